//! Per-operation and per-rank rollups
//!
//! One pass over the call-tree frames and one over the matched
//! communications fill a table keyed by (operation, rank scope). Cross-rank
//! imbalance is computed from the per-rank exclusive times with trueno.

use crate::call_tree::{CallTree, FrameId};
use crate::event::{OperationId, RankId};
use crate::matcher::MatchSet;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Which ranks a row summarizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RankScope {
    All,
    Rank(RankId),
}

impl fmt::Display for RankScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RankScope::All => write!(f, "all"),
            RankScope::Rank(rank) => write!(f, "{}", rank),
        }
    }
}

/// Accumulated timing of one operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationStats {
    /// Time inside the operation, outermost frames only for recursion
    pub inclusive_time: u64,
    /// Time inside the operation minus nested calls
    pub exclusive_time: u64,
    pub call_count: u64,
    pub bytes_transferred: u64,
    /// Time blocked on messages or collectives while in this operation
    pub wait_time: u64,
}

/// One row of an aggregate query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregateRow {
    pub operation: OperationId,
    pub scope: RankScope,
    #[serde(flatten)]
    pub stats: OperationStats,
}

/// Spread of one operation's exclusive time across ranks
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImbalanceStats {
    pub operation: OperationId,
    /// Ranks that execute the operation
    pub ranks: usize,
    pub mean: f32,
    pub stddev: f32,
    pub min: f32,
    pub max: f32,
    /// (max - mean) / mean, 0 when mean is 0
    pub imbalance: f32,
}

/// Aggregate table over all reconstructed ranks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateTable {
    rows: BTreeMap<(OperationId, RankScope), OperationStats>,
    imbalance: BTreeMap<OperationId, ImbalanceStats>,
}

impl AggregateTable {
    /// Build the table from call trees and matches
    ///
    /// With `attribute_wait_time`, a receive's wait `recv.ts - max(send.ts,
    /// frame.start)` is charged to the innermost frame active at the receive,
    /// and a collective's wait `sync - entry` to the innermost frame at the
    /// entry. Waits outside any frame are not charged.
    pub fn build(
        trees: &BTreeMap<RankId, CallTree>,
        matches: &MatchSet,
        attribute_wait_time: bool,
    ) -> Self {
        let mut table = Self::default();

        for (&rank, tree) in trees {
            for (id, node) in tree.frames() {
                let Some(operation) = node.operation else {
                    continue;
                };
                let recursive = has_ancestor_with(tree, id, operation);
                let exclusive = tree.exclusive_time(id);
                table.update(operation, rank, |stats| {
                    stats.call_count += 1;
                    stats.exclusive_time += exclusive;
                    if !recursive {
                        stats.inclusive_time += node.duration();
                    }
                });
            }
        }

        for message in matches.messages() {
            let bytes = message.bytes;
            table.update(message.send_operation, message.sender(), |s| {
                s.bytes_transferred += bytes
            });
            table.update(message.receive_operation, message.receiver(), |s| {
                s.bytes_transferred += bytes
            });

            if !attribute_wait_time {
                continue;
            }
            let Some(tree) = trees.get(&message.receiver()) else {
                continue;
            };
            let frame = tree.innermost_at(message.receive_timestamp);
            let Some(node) = tree.node(frame).filter(|_| frame != tree.root()) else {
                continue;
            };
            let Some(operation) = node.operation else {
                continue;
            };
            let ready = message.send_timestamp.max(node.start);
            let wait = message.receive_timestamp.saturating_sub(ready);
            table.update(operation, message.receiver(), |s| s.wait_time += wait);
        }

        for instance in matches.collectives() {
            for (&rank, participation) in &instance.participants {
                if let Some(bytes) = participation.payload_bytes {
                    table.update(instance.operation, rank, |s| s.bytes_transferred += bytes);
                }

                if !attribute_wait_time {
                    continue;
                }
                let Some(tree) = trees.get(&rank) else {
                    continue;
                };
                let frame = tree.innermost_at(participation.enter_timestamp);
                if frame == tree.root() {
                    continue;
                }
                if let Some(operation) = tree.node(frame).and_then(|n| n.operation) {
                    let wait = instance
                        .sync_timestamp
                        .saturating_sub(participation.enter_timestamp);
                    table.update(operation, rank, |s| s.wait_time += wait);
                }
            }
        }

        table.imbalance = table.compute_imbalance();
        tracing::debug!(
            rows = table.rows.len(),
            operations = table.imbalance.len(),
            "aggregate table built"
        );
        table
    }

    /// Apply `f` to the per-rank row and the all-ranks row
    fn update<F: Fn(&mut OperationStats)>(&mut self, operation: OperationId, rank: RankId, f: F) {
        f(self
            .rows
            .entry((operation, RankScope::Rank(rank)))
            .or_default());
        f(self.rows.entry((operation, RankScope::All)).or_default());
    }

    fn compute_imbalance(&self) -> BTreeMap<OperationId, ImbalanceStats> {
        let mut per_operation: BTreeMap<OperationId, Vec<f32>> = BTreeMap::new();
        for (&(operation, scope), stats) in &self.rows {
            if let RankScope::Rank(_) = scope {
                if stats.call_count > 0 {
                    per_operation
                        .entry(operation)
                        .or_default()
                        .push(stats.exclusive_time as f32);
                }
            }
        }

        per_operation
            .into_iter()
            .map(|(operation, times)| {
                let v = trueno::Vector::from_slice(&times);
                let mean = v.mean().unwrap_or(0.0);
                let stddev = v.stddev().unwrap_or(0.0);
                let min = v.min().unwrap_or(0.0);
                let max = v.max().unwrap_or(0.0);
                let imbalance = if mean > 0.0 { (max - mean) / mean } else { 0.0 };
                (
                    operation,
                    ImbalanceStats {
                        operation,
                        ranks: times.len(),
                        mean,
                        stddev,
                        min,
                        max,
                        imbalance,
                    },
                )
            })
            .collect()
    }

    pub fn get(&self, operation: OperationId, scope: RankScope) -> Option<&OperationStats> {
        self.rows.get(&(operation, scope))
    }

    /// Rows for one operation (or every operation) at the given scope
    ///
    /// Sorted by inclusive time descending, then operation id.
    pub fn rows(&self, operation: Option<OperationId>, scope: RankScope) -> Vec<AggregateRow> {
        let mut rows: Vec<AggregateRow> = match operation {
            Some(operation) => self
                .get(operation, scope)
                .map(|stats| AggregateRow {
                    operation,
                    scope,
                    stats: *stats,
                })
                .into_iter()
                .collect(),
            None => self
                .rows
                .iter()
                .filter(|((_, row_scope), _)| *row_scope == scope)
                .map(|(&(operation, scope), stats)| AggregateRow {
                    operation,
                    scope,
                    stats: *stats,
                })
                .collect(),
        };
        rows.sort_by(|a, b| {
            b.stats
                .inclusive_time
                .cmp(&a.stats.inclusive_time)
                .then(a.operation.cmp(&b.operation))
        });
        rows
    }

    pub fn imbalance(&self, operation: OperationId) -> Option<&ImbalanceStats> {
        self.imbalance.get(&operation)
    }

    /// Imbalance of every operation, most imbalanced first
    pub fn imbalances(&self) -> Vec<ImbalanceStats> {
        let mut all: Vec<ImbalanceStats> = self.imbalance.values().copied().collect();
        all.sort_by(|a, b| {
            b.imbalance
                .partial_cmp(&a.imbalance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.operation.cmp(&b.operation))
        });
        all
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn has_ancestor_with(tree: &CallTree, id: FrameId, operation: OperationId) -> bool {
    let mut cursor = tree.parent(id);
    while let Some(parent) = cursor {
        if tree.node(parent).and_then(|n| n.operation) == Some(operation) {
            return true;
        }
        cursor = tree.parent(parent);
    }
    false
}
