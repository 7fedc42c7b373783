//! Critical path through the causality graph
//!
//! The critical path is the longest path from the global start node to the
//! global end node. Nothing off this path can shorten the run.
//!
//! # Algorithm
//!
//! ```text
//! 1. Kahn topological order (lowest node id first among ready nodes)
//! 2. For each node v in that order, for each edge v → w:
//!    dist[w] = max(dist[w], dist[v] + weight(v, w))
//! 3. Walk predecessors back from the end node
//! ```
//!
//! Every edge weight except the final boundary edge is a timestamp
//! difference, so many paths tie. Ties are broken towards the predecessor
//! with the latest timestamp (the dependency that actually gated the node),
//! then the lowest rank, then the lowest node id. The resulting path follows
//! the last arrival into every message and collective.
//!
//! Rank order is only the second key: between equal-length predecessors, a
//! later one on rank 3 wins over an earlier one on rank 0. Lowest rank first
//! applies only among predecessors at the same timestamp.

use crate::causal_graph::{CausalGraph, EdgeKind, GraphNode};
use crate::event::RankId;
use anyhow::{Context, Result};
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;
use trueno_graph::NodeId;

/// What the time of a path segment was spent on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentCategory {
    /// Local progress on one rank
    Compute,
    /// Waiting for a point-to-point message
    PointToPointWait,
    /// Waiting inside a collective
    CollectiveWait,
}

impl SegmentCategory {
    fn of(kind: EdgeKind) -> Self {
        match kind {
            EdgeKind::ProgramOrder | EdgeKind::Boundary => SegmentCategory::Compute,
            EdgeKind::Message => SegmentCategory::PointToPointWait,
            EdgeKind::Collective => SegmentCategory::CollectiveWait,
        }
    }
}

/// One node on the critical path with the edge that led into it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathSegment {
    pub node: NodeId,
    pub location: GraphNode,
    pub rank: Option<RankId>,
    pub timestamp: u64,
    /// Weight of the incoming edge (0 for the start node)
    pub weight: u64,
    /// Category of the incoming edge (`None` for the start node)
    pub category: Option<SegmentCategory>,
}

/// Longest path from global start to global end
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CriticalPath {
    pub segments: Vec<PathSegment>,
    pub total_duration: u64,
}

impl CriticalPath {
    /// Share of `total_trace_duration` covered by the path (0.0 to 100.0)
    pub fn critical_path_percentage(&self, total_trace_duration: u64) -> f64 {
        if total_trace_duration == 0 {
            return 0.0;
        }
        (self.total_duration as f64 / total_trace_duration as f64) * 100.0
    }

    /// Heaviest single segment (biggest bottleneck)
    pub fn longest_segment(&self) -> Option<&PathSegment> {
        self.segments
            .iter()
            .filter(|s| s.category.is_some())
            .max_by(|a, b| a.weight.cmp(&b.weight).then(b.node.0.cmp(&a.node.0)))
    }

    pub fn is_on_critical_path(&self, node: NodeId) -> bool {
        self.segments.iter().any(|s| s.node == node)
    }

    /// Path time per category
    pub fn time_by_category(&self) -> BTreeMap<SegmentCategory, u64> {
        let mut totals = BTreeMap::new();
        for segment in &self.segments {
            if let Some(category) = segment.category {
                *totals.entry(category).or_insert(0) += segment.weight;
            }
        }
        totals
    }

    /// Ranks the path visits, in path order without repeats
    pub fn ranks(&self) -> Vec<RankId> {
        let mut ranks: Vec<RankId> = Vec::new();
        for rank in self.segments.iter().filter_map(|s| s.rank) {
            if ranks.last() != Some(&rank) && !ranks.contains(&rank) {
                ranks.push(rank);
            }
        }
        ranks
    }
}

/// Preference key among equal-length predecessors; smaller wins
fn preference(graph: &CausalGraph, node: u32) -> (Reverse<u64>, Option<RankId>, u32) {
    match graph.node(NodeId(node)) {
        Some(info) => (Reverse(info.timestamp), info.rank(), node),
        None => (Reverse(0), None, node),
    }
}

/// Find the critical path of a causality graph
///
/// # Errors
///
/// Returns an error if the graph contains a cycle.
///
/// # Example
///
/// ```
/// use mpiperf::causal_graph::CausalGraph;
/// use mpiperf::critical_path::find_critical_path;
/// use mpiperf::event::{Event, OperationId, RankId};
/// use mpiperf::matcher::MatchSet;
/// use std::collections::BTreeMap;
///
/// # fn main() -> anyhow::Result<()> {
/// let f = OperationId(1);
/// let mut ranks = BTreeMap::new();
/// ranks.insert(RankId(0), vec![Event::enter(RankId(0), 2, f), Event::exit(RankId(0), 9, f)]);
///
/// let graph = CausalGraph::build(&ranks, &MatchSet::default())?;
/// let path = find_critical_path(&graph)?;
/// assert_eq!(path.total_duration, 7);
/// # Ok(())
/// # }
/// ```
pub fn find_critical_path(graph: &CausalGraph) -> Result<CriticalPath> {
    let order = graph
        .topological_order()
        .context("causality graph contains a cycle")?;

    let n = graph.node_count();
    let mut dist: Vec<Option<u64>> = vec![None; n];
    let mut pred: Vec<Option<u32>> = vec![None; n];
    let start = graph.global_start();
    let end = graph.global_end();
    if let Some(d) = dist.get_mut(start.0 as usize) {
        *d = Some(0);
    }

    for node in order {
        let Some(base) = dist[node.0 as usize] else {
            continue;
        };
        for edge in graph.successors(node) {
            let to = edge.to.0 as usize;
            let candidate = base + edge.weight;
            let better = match (dist[to], pred[to]) {
                (None, _) => true,
                (Some(current), previous) => match candidate.cmp(&current) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => previous.map_or(true, |p| {
                        preference(graph, node.0) < preference(graph, p)
                    }),
                },
            };
            if better {
                dist[to] = Some(candidate);
                pred[to] = Some(node.0);
            }
        }
    }

    let Some(total_duration) = dist.get(end.0 as usize).copied().flatten() else {
        return Ok(CriticalPath::default());
    };
    if end == start {
        return Ok(CriticalPath::default());
    }

    let mut chain = vec![end.0];
    let mut cursor = end.0;
    while let Some(previous) = pred[cursor as usize] {
        chain.push(previous);
        cursor = previous;
    }
    chain.reverse();

    let mut segments = Vec::with_capacity(chain.len());
    let mut previous: Option<u32> = None;
    for node in chain {
        let info = graph
            .node(NodeId(node))
            .context("critical path references unknown node")?;
        let incoming = match previous {
            Some(from) => Some(
                graph
                    .edge(NodeId(from), NodeId(node))
                    .context("critical path references missing edge")?,
            ),
            None => None,
        };
        segments.push(PathSegment {
            node: NodeId(node),
            location: info.location,
            rank: info.rank(),
            timestamp: info.timestamp,
            weight: incoming.map(|e| e.weight).unwrap_or(0),
            category: incoming.map(|e| SegmentCategory::of(e.kind)),
        });
        previous = Some(node);
    }

    tracing::debug!(
        segments = segments.len(),
        total_duration,
        "critical path found"
    );

    Ok(CriticalPath {
        segments,
        total_duration,
    })
}
