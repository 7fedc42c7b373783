//! Point-to-point send/receive matching
//!
//! Work is partitioned by (communicator, receiver). Inside a partition the
//! sends and receives are replayed in (timestamp, rank, event index) order
//! against per-sender FIFO queues of pending sends and one FIFO queue of
//! posted receives.

use super::EventRef;
use crate::engine::CancellationToken;
use crate::error::{AnalysisError, Direction, UnmatchedCommunicationWarning};
use crate::event::{CommId, Event, EventKind, OperationId, PeerSelector, RankId, TagSelector};
use crate::worker_pool::run_bounded;
use fnv::FnvHashMap;
use std::collections::{BTreeMap, VecDeque};

/// A matched send/receive pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMatch {
    pub send: EventRef,
    pub receive: EventRef,
    pub communicator: CommId,
    /// Tag of the send (the receive may have used a wildcard)
    pub tag: i32,
    pub send_timestamp: u64,
    pub receive_timestamp: u64,
    pub send_operation: OperationId,
    pub receive_operation: OperationId,
    /// Payload of the send, else of the receive, else 0
    pub bytes: u64,
}

impl MessageMatch {
    pub fn sender(&self) -> RankId {
        self.send.rank
    }

    pub fn receiver(&self) -> RankId {
        self.receive.rank
    }

    /// Receive minus send timestamp; `None` if the receive precedes the send
    pub fn transit_time(&self) -> Option<u64> {
        self.receive_timestamp.checked_sub(self.send_timestamp)
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Send {
        tag: i32,
    },
    Receive {
        tag: TagSelector,
        peer: PeerSelector,
    },
}

#[derive(Debug, Clone, Copy)]
struct P2pOp {
    at: EventRef,
    timestamp: u64,
    operation: OperationId,
    payload_bytes: Option<u64>,
    side: Side,
}

impl P2pOp {
    fn unmatched(&self, communicator: CommId) -> UnmatchedCommunicationWarning {
        let direction = match self.side {
            Side::Send { .. } => Direction::Send,
            Side::Receive { .. } => Direction::Receive,
        };
        UnmatchedCommunicationWarning {
            rank: self.at.rank,
            operation: self.operation,
            timestamp: self.timestamp,
            communicator,
            direction,
            event_index: self.at.index,
        }
    }
}

struct Partition {
    communicator: CommId,
    ops: Vec<P2pOp>,
}

struct PendingSend {
    seq: u64,
    tag: i32,
    op: P2pOp,
}

struct PendingReceive {
    tag: TagSelector,
    peer: PeerSelector,
    op: P2pOp,
}

#[derive(Default)]
struct PartitionOutcome {
    matches: Vec<MessageMatch>,
    unmatched: Vec<UnmatchedCommunicationWarning>,
}

fn collect_partitions(ranks: &BTreeMap<RankId, Vec<Event>>) -> Vec<Partition> {
    let mut partitions: BTreeMap<(CommId, RankId), Vec<P2pOp>> = BTreeMap::new();

    for (&rank, events) in ranks {
        for (index, event) in events.iter().enumerate() {
            let at = EventRef::new(rank, index);
            let (key, operation, payload_bytes, side) = match &event.kind {
                EventKind::Send {
                    operation,
                    communicator,
                    tag,
                    peer,
                    payload_bytes,
                } => (
                    (*communicator, *peer),
                    *operation,
                    *payload_bytes,
                    Side::Send { tag: *tag },
                ),
                EventKind::Receive {
                    operation,
                    communicator,
                    tag,
                    peer,
                    payload_bytes,
                } => (
                    (*communicator, rank),
                    *operation,
                    *payload_bytes,
                    Side::Receive {
                        tag: *tag,
                        peer: *peer,
                    },
                ),
                _ => continue,
            };
            partitions.entry(key).or_default().push(P2pOp {
                at,
                timestamp: event.timestamp,
                operation,
                payload_bytes,
                side,
            });
        }
    }

    partitions
        .into_iter()
        .map(|((communicator, _), mut ops)| {
            ops.sort_by_key(|op| (op.timestamp, op.at.rank, op.at.index));
            Partition { communicator, ops }
        })
        .collect()
}

fn pair(communicator: CommId, send: &PendingSend, receive: &P2pOp) -> MessageMatch {
    let bytes = send
        .op
        .payload_bytes
        .or(receive.payload_bytes)
        .unwrap_or(0);
    MessageMatch {
        send: send.op.at,
        receive: receive.at,
        communicator,
        tag: send.tag,
        send_timestamp: send.op.timestamp,
        receive_timestamp: receive.timestamp,
        send_operation: send.op.operation,
        receive_operation: receive.operation,
        bytes,
    }
}

fn match_partition(partition: Partition) -> PartitionOutcome {
    let communicator = partition.communicator;
    let mut sends: FnvHashMap<RankId, VecDeque<PendingSend>> = FnvHashMap::default();
    let mut receives: VecDeque<PendingReceive> = VecDeque::new();
    let mut next_seq: u64 = 0;
    let mut outcome = PartitionOutcome::default();

    for op in partition.ops {
        match op.side {
            Side::Send { tag } => {
                let sender = op.at.rank;
                let posted = receives
                    .iter()
                    .position(|r| r.peer.accepts(sender) && r.tag.accepts(tag));
                let pending = PendingSend {
                    seq: next_seq,
                    tag,
                    op,
                };
                next_seq += 1;

                match posted.and_then(|index| receives.remove(index)) {
                    Some(receive) => outcome
                        .matches
                        .push(pair(communicator, &pending, &receive.op)),
                    None => sends.entry(sender).or_default().push_back(pending),
                }
            }
            Side::Receive { tag, peer } => {
                let found = match peer {
                    PeerSelector::Rank(sender) => sends.get_mut(&sender).and_then(|queue| {
                        let index = queue.iter().position(|s| tag.accepts(s.tag))?;
                        queue.remove(index)
                    }),
                    PeerSelector::Any => {
                        // Earliest enqueued compatible send across all senders
                        let best = sends
                            .iter()
                            .filter_map(|(&sender, queue)| {
                                queue
                                    .iter()
                                    .position(|s| tag.accepts(s.tag))
                                    .map(|index| (queue[index].seq, sender, index))
                            })
                            .min();
                        best.and_then(|(_, sender, index)| {
                            sends.get_mut(&sender).and_then(|queue| queue.remove(index))
                        })
                    }
                };

                match found {
                    Some(send) => outcome.matches.push(pair(communicator, &send, &op)),
                    None => receives.push_back(PendingReceive { tag, peer, op }),
                }
            }
        }
    }

    for queue in sends.into_values() {
        outcome
            .unmatched
            .extend(queue.into_iter().map(|s| s.op.unmatched(communicator)));
    }
    outcome
        .unmatched
        .extend(receives.into_iter().map(|r| r.op.unmatched(communicator)));
    outcome
}

/// Match every point-to-point message of the given ranks
///
/// Returns matches sorted by (receiver, receive index) and unmatched warnings
/// sorted by (rank, event index).
pub(crate) fn match_all(
    ranks: &BTreeMap<RankId, Vec<Event>>,
    workers: usize,
    cancel: &CancellationToken,
) -> Result<(Vec<MessageMatch>, Vec<UnmatchedCommunicationWarning>), AnalysisError> {
    let partitions = collect_partitions(ranks);
    tracing::debug!(partitions = partitions.len(), "matching point-to-point partitions");

    let outcomes = run_bounded(workers, partitions, |partition| {
        if cancel.is_cancelled() {
            return None;
        }
        Some(match_partition(partition))
    })?;

    let mut matches = Vec::new();
    let mut unmatched = Vec::new();
    for outcome in outcomes {
        let outcome = outcome.ok_or(AnalysisError::Cancelled)?;
        matches.extend(outcome.matches);
        unmatched.extend(outcome.unmatched);
    }

    matches.sort_by_key(|m| m.receive);
    unmatched.sort_by_key(|w| (w.rank, w.event_index));
    for warning in &unmatched {
        tracing::warn!(%warning, "unmatched point-to-point communication");
    }
    Ok((matches, unmatched))
}
