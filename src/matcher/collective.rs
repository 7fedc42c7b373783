//! Collective instance resolution
//!
//! Each rank's stream is scanned by a producer that pairs CollectiveEnter with
//! CollectiveExit and sends one arrival per participation to the coordinator
//! of that communicator. A coordinator owns all grouping state for its
//! communicator: it completes instance N once every member's Nth arrival is
//! in, and reports the rest as incomplete when its producers are done or the
//! channel stays silent for the configured timeout.

use super::EventRef;
use crate::engine::CancellationToken;
use crate::error::{AnalysisError, AnalysisWarning};
use crate::event::{CommId, Event, EventKind, OperationId, RankId, TraceDefinitions};
use crate::worker_pool::run_bounded;
use anyhow::anyhow;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use fnv::FnvHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// One rank's part in a collective instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participation {
    pub enter: EventRef,
    pub exit: EventRef,
    pub enter_timestamp: u64,
    pub exit_timestamp: u64,
    pub payload_bytes: Option<u64>,
}

/// A complete collective instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectiveInstance {
    pub communicator: CommId,
    /// Zero-based instance number on the communicator
    pub sequence: u64,
    /// Operation of the lowest participating rank
    pub operation: OperationId,
    pub participants: BTreeMap<RankId, Participation>,
    /// Latest entry: no participant can leave before this point
    pub sync_timestamp: u64,
}

impl CollectiveInstance {
    fn new(
        communicator: CommId,
        sequence: u64,
        arrivals: BTreeMap<RankId, (OperationId, Participation)>,
    ) -> Self {
        let operation = arrivals
            .values()
            .next()
            .map(|(operation, _)| *operation)
            .unwrap_or(OperationId(0));
        let participants: BTreeMap<RankId, Participation> = arrivals
            .into_iter()
            .map(|(rank, (_, participation))| (rank, participation))
            .collect();
        let sync_timestamp = participants
            .values()
            .map(|p| p.enter_timestamp)
            .max()
            .unwrap_or(0);
        Self {
            communicator,
            sequence,
            operation,
            participants,
            sync_timestamp,
        }
    }

    /// Rank whose entry set the sync timestamp (lowest rank on ties)
    pub fn last_arrival(&self) -> Option<RankId> {
        self.participants
            .iter()
            .find(|(_, p)| p.enter_timestamp == self.sync_timestamp)
            .map(|(&rank, _)| rank)
    }

    /// Sum of exit payloads over all participants
    pub fn bytes(&self) -> u64 {
        self.participants
            .values()
            .filter_map(|p| p.payload_bytes)
            .sum()
    }

    /// Time `rank` spent waiting for the last participant
    pub fn wait_time(&self, rank: RankId) -> Option<u64> {
        self.participants
            .get(&rank)
            .map(|p| self.sync_timestamp.saturating_sub(p.enter_timestamp))
    }
}

/// Participants of each communicator that has collective traffic
///
/// Predefined members win; otherwise every given rank that enters a
/// collective on the communicator is a participant.
pub fn collective_membership(
    ranks: &BTreeMap<RankId, Vec<Event>>,
    definitions: &TraceDefinitions,
) -> BTreeMap<CommId, BTreeSet<RankId>> {
    let mut membership: BTreeMap<CommId, BTreeSet<RankId>> = BTreeMap::new();
    for (&rank, events) in ranks {
        for event in events {
            if let EventKind::CollectiveEnter { communicator, .. } = event.kind {
                membership.entry(communicator).or_default().insert(rank);
            }
        }
    }

    for (communicator, members) in membership.iter_mut() {
        if let Some(defined) = definitions.members(*communicator) {
            *members = defined.clone();
        }
    }
    membership
}

#[derive(Debug, Clone, Copy)]
pub(super) struct Arrival {
    rank: RankId,
    sequence: u64,
    operation: OperationId,
    participation: Participation,
}

struct OpenCollective {
    communicator: CommId,
    sequence: u64,
    operation: OperationId,
    index: usize,
    timestamp: u64,
}

/// Scan one rank and push its arrivals to the coordinators
pub(super) fn produce(
    rank: RankId,
    events: &[Event],
    senders: &BTreeMap<CommId, Sender<Arrival>>,
) {
    let mut next_sequence: FnvHashMap<CommId, u64> = FnvHashMap::default();
    let mut open: Vec<OpenCollective> = Vec::new();

    for (index, event) in events.iter().enumerate() {
        match event.kind {
            EventKind::CollectiveEnter {
                operation,
                communicator,
            } => {
                let counter = next_sequence.entry(communicator).or_insert(0);
                open.push(OpenCollective {
                    communicator,
                    sequence: *counter,
                    operation,
                    index,
                    timestamp: event.timestamp,
                });
                *counter += 1;
            }
            EventKind::CollectiveExit {
                communicator,
                payload_bytes,
                ..
            } => {
                let Some(position) = open.iter().rposition(|o| o.communicator == communicator)
                else {
                    continue;
                };
                let entry = open.remove(position);
                let arrival = Arrival {
                    rank,
                    sequence: entry.sequence,
                    operation: entry.operation,
                    participation: Participation {
                        enter: EventRef::new(rank, entry.index),
                        exit: EventRef::new(rank, index),
                        enter_timestamp: entry.timestamp,
                        exit_timestamp: event.timestamp,
                        payload_bytes,
                    },
                };
                if let Some(sender) = senders.get(&communicator) {
                    // A coordinator that timed out has dropped its receiver
                    let _ = sender.send(arrival);
                }
            }
            _ => {}
        }
    }
}

#[derive(Default)]
struct CoordinatorOutcome {
    instances: Vec<CollectiveInstance>,
    warnings: Vec<AnalysisWarning>,
}

fn coordinate(
    communicator: CommId,
    members: &BTreeSet<RankId>,
    arrivals: Receiver<Arrival>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> CoordinatorOutcome {
    let mut pending: BTreeMap<u64, BTreeMap<RankId, (OperationId, Participation)>> =
        BTreeMap::new();
    let mut outcome = CoordinatorOutcome::default();

    while !cancel.is_cancelled() {
        match arrivals.recv_timeout(timeout) {
            Ok(arrival) => {
                if !members.contains(&arrival.rank) {
                    tracing::warn!(
                        rank = %arrival.rank,
                        %communicator,
                        "collective entry from a rank outside the communicator ignored"
                    );
                    continue;
                }
                let group = pending.entry(arrival.sequence).or_default();
                group.insert(arrival.rank, (arrival.operation, arrival.participation));
                if group.len() == members.len() {
                    if let Some(group) = pending.remove(&arrival.sequence) {
                        outcome.instances.push(CollectiveInstance::new(
                            communicator,
                            arrival.sequence,
                            group,
                        ));
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(%communicator, pending = pending.len(), "collective matching timed out");
                outcome.warnings.push(AnalysisWarning::CollectiveTimeout {
                    communicator,
                    pending: pending.len(),
                });
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for (sequence, group) in pending {
        let arrived: Vec<RankId> = group.keys().copied().collect();
        let missing: Vec<RankId> = members
            .iter()
            .filter(|rank| !group.contains_key(rank))
            .copied()
            .collect();
        let operation = group
            .values()
            .next()
            .map(|(operation, _)| *operation)
            .unwrap_or(OperationId(0));
        tracing::warn!(%communicator, sequence, ?missing, "incomplete collective");
        outcome.warnings.push(AnalysisWarning::IncompleteCollective {
            communicator,
            sequence,
            operation,
            arrived,
            missing,
        });
    }

    outcome.instances.sort_by_key(|i| i.sequence);
    outcome
}

/// Resolve all collective instances
///
/// Coordinators start first, one scoped thread per communicator. Producers
/// then run on the bounded pool and feed them over unbounded channels. A
/// coordinator finishes once every producer sender is gone, or once `timeout`
/// passes without a new arrival.
pub(crate) fn match_all(
    ranks: &BTreeMap<RankId, Vec<Event>>,
    membership: &BTreeMap<CommId, BTreeSet<RankId>>,
    workers: usize,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(Vec<CollectiveInstance>, Vec<AnalysisWarning>), AnalysisError> {
    resolve(ranks, membership, workers, timeout, cancel, produce)
}

/// [`match_all`] with a replaceable producer
pub(super) fn resolve<P>(
    ranks: &BTreeMap<RankId, Vec<Event>>,
    membership: &BTreeMap<CommId, BTreeSet<RankId>>,
    workers: usize,
    timeout: Duration,
    cancel: &CancellationToken,
    producer: P,
) -> Result<(Vec<CollectiveInstance>, Vec<AnalysisWarning>), AnalysisError>
where
    P: Fn(RankId, &[Event], &BTreeMap<CommId, Sender<Arrival>>) + Sync,
{
    if membership.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let mut senders: BTreeMap<CommId, Sender<Arrival>> = BTreeMap::new();
    let mut coordinators: Vec<(CommId, &BTreeSet<RankId>, Receiver<Arrival>)> = Vec::new();
    for (&communicator, members) in membership {
        let (tx, rx) = channel::unbounded();
        senders.insert(communicator, tx);
        coordinators.push((communicator, members, rx));
    }

    let producers: Vec<(RankId, &Vec<Event>)> =
        ranks.iter().map(|(&rank, events)| (rank, events)).collect();

    let (produced, outcomes) = crossbeam::scope(|scope| {
        let handles: Vec<_> = coordinators
            .into_iter()
            .map(|(communicator, members, rx)| {
                scope.spawn(move |_| coordinate(communicator, members, rx, timeout, cancel))
            })
            .collect();

        let produced = run_bounded(workers, producers, |(rank, events)| {
            producer(rank, events.as_slice(), &senders)
        });
        drop(senders);

        let outcomes: Vec<_> = handles.into_iter().map(|handle| handle.join()).collect();
        (produced, outcomes)
    })
    .map_err(|_| anyhow!("collective matching thread panicked"))?;
    produced?;
    cancel.check()?;

    let mut instances = Vec::new();
    let mut warnings = Vec::new();
    for outcome in outcomes {
        let outcome = outcome.map_err(|_| anyhow!("collective coordinator panicked"))?;
        instances.extend(outcome.instances);
        warnings.extend(outcome.warnings);
    }
    Ok((instances, warnings))
}
