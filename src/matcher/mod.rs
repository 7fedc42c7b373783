// Communication matching across ranks
//
// Point-to-point messages are paired per (communicator, receiver) partition,
// honoring MPI's non-overtaking rule: messages between the same pair of ranks
// on the same communicator and tag are received in the order they were sent.
// Collective instances are grouped per communicator by a coordinator that
// consumes participant arrivals from a channel.
//
// Both stages are deterministic: the same rank streams always produce the
// same pairings, regardless of thread scheduling.

mod collective;
mod point_to_point;

pub use collective::{collective_membership, CollectiveInstance, Participation};
pub use point_to_point::MessageMatch;

use crate::config::EngineConfig;
use crate::engine::CancellationToken;
use crate::error::{AnalysisError, AnalysisWarning};
use crate::event::{Event, RankId, TraceDefinitions};
use std::collections::BTreeMap;

/// Position of an event: rank plus index in that rank's stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventRef {
    pub rank: RankId,
    pub index: usize,
}

impl EventRef {
    pub fn new(rank: RankId, index: usize) -> Self {
        Self { rank, index }
    }
}

/// One matched communication, point-to-point or collective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedCommunication<'a> {
    PointToPoint(&'a MessageMatch),
    Collective(&'a CollectiveInstance),
}

/// Output of the matcher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSet {
    messages: Vec<MessageMatch>,
    collectives: Vec<CollectiveInstance>,
    warnings: Vec<AnalysisWarning>,
}

impl MatchSet {
    /// Point-to-point matches, ordered by receiver rank and receive index
    pub fn messages(&self) -> &[MessageMatch] {
        &self.messages
    }

    /// Complete collective instances, ordered by communicator and sequence
    pub fn collectives(&self) -> &[CollectiveInstance] {
        &self.collectives
    }

    /// Unmatched sends/receives and incomplete collectives
    pub fn warnings(&self) -> &[AnalysisWarning] {
        &self.warnings
    }

    pub fn len(&self) -> usize {
        self.messages.len() + self.collectives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = MatchedCommunication<'_>> {
        self.messages
            .iter()
            .map(MatchedCommunication::PointToPoint)
            .chain(self.collectives.iter().map(MatchedCommunication::Collective))
    }
}

/// Match all point-to-point and collective communication of the given ranks
///
/// `ranks` must only contain streams that passed reconstruction; events of
/// failed ranks are never matched, so their partners surface as warnings.
///
/// # Errors
///
/// [`AnalysisError::Cancelled`] if `cancel` fires between matching stages,
/// [`AnalysisError::Internal`] if a worker thread panics.
pub fn match_communications(
    ranks: &BTreeMap<RankId, Vec<Event>>,
    definitions: &TraceDefinitions,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<MatchSet, AnalysisError> {
    let workers = config.effective_workers();

    cancel.check()?;
    let (messages, unmatched) = point_to_point::match_all(ranks, workers, cancel)?;
    tracing::debug!(
        messages = messages.len(),
        unmatched = unmatched.len(),
        "point-to-point matching complete"
    );

    cancel.check()?;
    let membership = collective_membership(ranks, definitions);
    let (collectives, collective_warnings) = collective::match_all(
        ranks,
        &membership,
        workers,
        config.collective_timeout(),
        cancel,
    )?;
    tracing::debug!(
        collectives = collectives.len(),
        communicators = membership.len(),
        "collective matching complete"
    );
    cancel.check()?;

    let mut warnings: Vec<AnalysisWarning> = unmatched
        .into_iter()
        .map(AnalysisWarning::UnmatchedCommunication)
        .collect();
    warnings.extend(collective_warnings);

    Ok(MatchSet {
        messages,
        collectives,
        warnings,
    })
}
