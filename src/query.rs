//! Read-only queries over an [`Analysis`]
//!
//! Every query is total: an unknown rank, operation or communicator yields
//! an empty result rather than an error. Nothing here mutates the analysis,
//! so any number of threads may query one `Arc<Analysis>` at once.

use crate::aggregate::{AggregateRow, ImbalanceStats, RankScope};
use crate::call_tree::{CallTreeNodeRef, Intervals};
use crate::comm_matrix::{CommMatrix, HistogramAxis, MatrixGrouping, MessageHistogram};
use crate::critical_path::{CriticalPath, PathSegment};
use crate::engine::{Analysis, TraceSummary};
use crate::error::{AnalysisWarning, MalformedTraceError};
use crate::event::{CommId, Event, OperationId, RankId};
use crate::filter::FilterSet;
use crate::matcher::{MatchSet, MatchedCommunication};
use std::borrow::Cow;

impl Analysis {
    /// Root of `rank`'s call tree
    pub fn call_tree(&self, rank: RankId) -> Option<CallTreeNodeRef<'_>> {
        self.trees.get(&rank).map(|tree| tree.root_view())
    }

    pub fn critical_path(&self) -> &[PathSegment] {
        &self.critical_path.segments
    }

    pub fn critical_path_summary(&self) -> &CriticalPath {
        &self.critical_path
    }

    /// Aggregate rows, by inclusive time descending
    ///
    /// `None` selects every operation.
    pub fn aggregate(&self, operation: Option<OperationId>, scope: RankScope) -> Vec<AggregateRow> {
        self.aggregates.rows(operation, scope)
    }

    /// Events of `rank` with `start <= timestamp <= end`, in stream order
    pub fn timeline(
        &self,
        rank: RankId,
        start: u64,
        end: u64,
    ) -> impl Iterator<Item = &Event> + '_ {
        let window: &[Event] = match self.events.get(&rank) {
            Some(events) if start <= end => {
                let first = events.partition_point(|e| e.timestamp < start);
                &events[first..]
            }
            _ => &[],
        };
        window.iter().take_while(move |e| e.timestamp <= end)
    }

    /// Call-tree frames of `rank` overlapping `[start, end]`
    pub fn intervals(
        &self,
        rank: RankId,
        start: u64,
        end: u64,
    ) -> impl Iterator<Item = CallTreeNodeRef<'_>> + '_ {
        self.trees
            .get(&rank)
            .into_iter()
            .flat_map(move |tree| -> Intervals<'_> { tree.overlapping(start, end) })
    }

    /// Message matrix over reconstructed ranks
    ///
    /// `communicator` restricts to messages on one communicator. Returns
    /// `None` when a locality grouping is requested that the trace does not
    /// define.
    pub fn comm_matrix(
        &self,
        communicator: Option<CommId>,
        grouping: MatrixGrouping,
    ) -> Option<CommMatrix> {
        let ranks: Vec<RankId> = self.trees.keys().copied().collect();
        let messages = self
            .matches
            .messages()
            .iter()
            .filter(|m| communicator.map_or(true, |c| m.communicator == c));
        let matrix = CommMatrix::from_messages(&ranks, messages);
        match grouping {
            MatrixGrouping::Rank => Some(matrix),
            MatrixGrouping::Locality(level) => matrix.by_locality(&self.definitions, level),
        }
    }

    /// Messages sent by `rank`, per receiver and size or tag
    pub fn message_histogram(
        &self,
        rank: RankId,
        axis: HistogramAxis,
        filters: &FilterSet,
    ) -> MessageHistogram {
        MessageHistogram::build(rank, axis, self.matches.messages(), filters)
    }

    pub fn imbalance(&self, operation: OperationId) -> Option<&ImbalanceStats> {
        self.aggregates.imbalance(operation)
    }

    pub fn summary(&self) -> TraceSummary {
        self.summary
    }

    pub fn matches(&self) -> &MatchSet {
        &self.matches
    }

    /// Messages first, then collective instances
    pub fn matched_communications(&self) -> impl Iterator<Item = MatchedCommunication<'_>> + '_ {
        self.matches.iter()
    }

    pub fn warnings(&self) -> &[AnalysisWarning] {
        &self.warnings
    }

    pub fn failed_ranks(&self) -> &[MalformedTraceError] {
        &self.failed_ranks
    }

    pub fn operation_name(&self, operation: OperationId) -> Cow<'_, str> {
        self.definitions.operation_name(operation)
    }
}
