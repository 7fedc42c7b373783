//! Cross-rank causality graph
//!
//! Every event of every reconstructed rank becomes a node, plus one
//! synchronization node per complete collective instance and the synthetic
//! global start and end nodes. Edges express happens-before:
//!
//! ```text
//!   start ──boundary──▶ r0:e0 ──order──▶ r0:e1 (send) ──order──▶ r0:e2 ──▶ end
//!         └─boundary──▶ r1:e0 ──order──▶ r1:e1 (recv) ──order──▶ r1:e2 ──▶ end
//!                                          ▲
//!                      r0:e1 ───message────┘
//!
//!   entry(r) ──collective──▶ sync(comm, seq) ──collective──▶ exit(r)
//! ```
//!
//! Adjacency is stored in trueno-graph's CSR format. CSR weights are `f32`,
//! so the exact `u64` weight and the edge kind are kept in a side table.
//!
//! # Example
//!
//! ```
//! use mpiperf::causal_graph::CausalGraph;
//! use mpiperf::event::{Event, OperationId, RankId};
//! use mpiperf::matcher::MatchSet;
//! use std::collections::BTreeMap;
//!
//! # fn main() -> anyhow::Result<()> {
//! let f = OperationId(1);
//! let mut ranks = BTreeMap::new();
//! ranks.insert(RankId(0), vec![Event::enter(RankId(0), 0, f), Event::exit(RankId(0), 5, f)]);
//!
//! let graph = CausalGraph::build(&ranks, &MatchSet::default())?;
//! // start, two events, end
//! assert_eq!(graph.node_count(), 4);
//! // start→e0, e0→e1, e1→end
//! assert_eq!(graph.edge_count(), 3);
//! # Ok(())
//! # }
//! ```

use crate::error::AnalysisWarning;
use crate::event::{CommId, Event, RankId};
use crate::matcher::{EventRef, MatchSet};
use anyhow::{Context, Result};
use fnv::{FnvHashMap, FnvHashSet};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use trueno_graph::{CsrGraph, NodeId};

/// Kind of a happens-before edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeKind {
    /// Consecutive events on one rank
    ProgramOrder,
    /// Matched send → receive
    Message,
    /// Collective entry → sync node, or sync node → exit
    Collective,
    /// Global start → first event, or last event → global end
    Boundary,
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::ProgramOrder => write!(f, "program order"),
            EdgeKind::Message => write!(f, "message"),
            EdgeKind::Collective => write!(f, "collective"),
            EdgeKind::Boundary => write!(f, "boundary"),
        }
    }
}

/// What a graph node stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphNode {
    GlobalStart,
    Event(EventRef),
    CollectiveSync { communicator: CommId, sequence: u64 },
    GlobalEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub location: GraphNode,
    pub timestamp: u64,
}

impl NodeInfo {
    /// Rank of event nodes; synthetic nodes have none
    pub fn rank(&self) -> Option<RankId> {
        match self.location {
            GraphNode::Event(at) => Some(at.rank),
            _ => None,
        }
    }
}

/// One weighted happens-before edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CausalEdge {
    pub from: NodeId,
    pub to: NodeId,
    /// Elapsed trace time along the edge
    pub weight: u64,
    pub kind: EdgeKind,
}

/// Immutable causality DAG over one trace
pub struct CausalGraph {
    graph: CsrGraph,
    nodes: Vec<NodeInfo>,
    /// First node id of each rank's events
    rank_offsets: BTreeMap<RankId, u32>,
    edges: FnvHashMap<(u32, u32), CausalEdge>,
    warnings: Vec<AnalysisWarning>,
}

impl std::fmt::Debug for CausalGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CausalGraph")
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .field("ranks", &self.rank_offsets.len())
            .finish()
    }
}

struct EdgeCandidate {
    from: u32,
    to: u32,
    weight: u64,
    kind: EdgeKind,
}

impl CausalGraph {
    /// Build the graph from reconstructed rank streams and their matches
    ///
    /// Single pass over events and matches. A message whose receive precedes
    /// its send gets no edge and a [`AnalysisWarning::BackwardMessage`]
    /// instead, so every weight is a non-negative time difference.
    ///
    /// Weights telescope along any path, so a cycle can only run through
    /// zero-weight edges between events sharing one timestamp. Zero-weight
    /// message and collective edges are therefore admitted one at a time
    /// (messages, then collective entries, then collective exits) and an edge
    /// whose target already reaches its source is omitted with a
    /// [`AnalysisWarning::CyclicEdge`]. The result is always a DAG.
    ///
    /// # Errors
    ///
    /// Returns an error if the node count exceeds the graph id space or the
    /// CSR graph rejects an edge.
    pub fn build(ranks: &BTreeMap<RankId, Vec<Event>>, matches: &MatchSet) -> Result<Self> {
        let start_ts = ranks
            .values()
            .filter_map(|events| events.first())
            .map(|e| e.timestamp)
            .min()
            .unwrap_or(0);
        let end_ts = ranks
            .values()
            .filter_map(|events| events.last())
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(start_ts);

        let event_count: usize = ranks.values().map(Vec::len).sum();
        let total = event_count + matches.collectives().len() + 2;
        u32::try_from(total).context("trace has too many events for the causality graph")?;

        let mut nodes = Vec::with_capacity(total);
        let mut rank_offsets = BTreeMap::new();
        let mut candidates: Vec<EdgeCandidate> = Vec::with_capacity(total * 2);

        nodes.push(NodeInfo {
            location: GraphNode::GlobalStart,
            timestamp: start_ts,
        });

        // Event nodes, program order and start boundary
        for (&rank, events) in ranks {
            let offset = nodes.len() as u32;
            rank_offsets.insert(rank, offset);
            for (index, event) in events.iter().enumerate() {
                nodes.push(NodeInfo {
                    location: GraphNode::Event(EventRef::new(rank, index)),
                    timestamp: event.timestamp,
                });
            }
            if let Some(first) = events.first() {
                candidates.push(EdgeCandidate {
                    from: 0,
                    to: offset,
                    weight: first.timestamp.saturating_sub(start_ts),
                    kind: EdgeKind::Boundary,
                });
            }
            for (index, pair) in events.windows(2).enumerate() {
                let from = offset + index as u32;
                candidates.push(EdgeCandidate {
                    from,
                    to: from + 1,
                    weight: pair[1].timestamp.saturating_sub(pair[0].timestamp),
                    kind: EdgeKind::ProgramOrder,
                });
            }
        }

        let lookup = |at: EventRef| -> Option<u32> {
            let offset = rank_offsets.get(&at.rank)?;
            let len = ranks.get(&at.rank)?.len();
            (at.index < len).then(|| offset + at.index as u32)
        };

        let mut warnings = Vec::new();
        for message in matches.messages() {
            let (Some(from), Some(to)) = (lookup(message.send), lookup(message.receive)) else {
                continue;
            };
            let backward = message.receive_timestamp < message.send_timestamp
                || (message.sender() == message.receiver() && to < from);
            if backward {
                tracing::warn!(
                    sender = %message.sender(),
                    receiver = %message.receiver(),
                    send_ts = message.send_timestamp,
                    receive_ts = message.receive_timestamp,
                    "message received before it was sent, edge omitted"
                );
                warnings.push(AnalysisWarning::BackwardMessage {
                    sender: message.sender(),
                    receiver: message.receiver(),
                    send_timestamp: message.send_timestamp,
                    receive_timestamp: message.receive_timestamp,
                });
                continue;
            }
            candidates.push(EdgeCandidate {
                from,
                to,
                weight: message.receive_timestamp - message.send_timestamp,
                kind: EdgeKind::Message,
            });
        }

        for instance in matches.collectives() {
            let sync = nodes.len() as u32;
            nodes.push(NodeInfo {
                location: GraphNode::CollectiveSync {
                    communicator: instance.communicator,
                    sequence: instance.sequence,
                },
                timestamp: instance.sync_timestamp,
            });
            for participation in instance.participants.values() {
                if let Some(entry) = lookup(participation.enter) {
                    candidates.push(EdgeCandidate {
                        from: entry,
                        to: sync,
                        weight: instance.sync_timestamp - participation.enter_timestamp,
                        kind: EdgeKind::Collective,
                    });
                }
                if participation.exit_timestamp < instance.sync_timestamp {
                    continue;
                }
                if let Some(exit) = lookup(participation.exit) {
                    candidates.push(EdgeCandidate {
                        from: sync,
                        to: exit,
                        weight: participation.exit_timestamp - instance.sync_timestamp,
                        kind: EdgeKind::Collective,
                    });
                }
            }
        }

        let end = nodes.len() as u32;
        nodes.push(NodeInfo {
            location: GraphNode::GlobalEnd,
            timestamp: end_ts,
        });
        for (&rank, events) in ranks {
            if let (Some(&offset), false) = (rank_offsets.get(&rank), events.is_empty()) {
                candidates.push(EdgeCandidate {
                    from: offset + events.len() as u32 - 1,
                    to: end,
                    weight: 0,
                    kind: EdgeKind::Boundary,
                });
            }
        }

        // Parallel edges collapse to the heaviest; equal weights keep the lowest kind
        candidates.sort_by_key(|c| (c.from, c.to, Reverse(c.weight), c.kind));
        candidates.dedup_by_key(|c| (c.from, c.to));

        let mut candidates = break_zero_time_cycles(candidates, &nodes, &mut warnings);
        candidates.sort_by_key(|c| (c.from, c.to));

        let mut graph = CsrGraph::new();
        let mut edges = FnvHashMap::default();
        edges.reserve(candidates.len());
        for c in candidates {
            let (from, to) = (NodeId(c.from), NodeId(c.to));
            graph
                .add_edge(from, to, c.weight as f32)
                .context("failed to add causality edge")?;
            edges.insert(
                (c.from, c.to),
                CausalEdge {
                    from,
                    to,
                    weight: c.weight,
                    kind: c.kind,
                },
            );
        }

        tracing::debug!(
            nodes = nodes.len(),
            edges = edges.len(),
            omitted = warnings.len(),
            "causality graph built"
        );

        Ok(Self {
            graph,
            nodes,
            rank_offsets,
            edges,
            warnings,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.num_edges()
    }

    pub fn global_start(&self) -> NodeId {
        NodeId(0)
    }

    pub fn global_end(&self) -> NodeId {
        NodeId(self.nodes.len().saturating_sub(1) as u32)
    }

    /// Earliest first timestamp over all ranks
    pub fn start_timestamp(&self) -> u64 {
        self.nodes.first().map(|n| n.timestamp).unwrap_or(0)
    }

    /// Latest last timestamp over all ranks
    pub fn end_timestamp(&self) -> u64 {
        self.nodes.last().map(|n| n.timestamp).unwrap_or(0)
    }

    pub fn node(&self, node: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(node.0 as usize)
    }

    /// Graph node of an event, if its rank is part of the graph
    pub fn event_node(&self, at: EventRef) -> Option<NodeId> {
        let offset = *self.rank_offsets.get(&at.rank)?;
        let node = offset.checked_add(u32::try_from(at.index).ok()?)?;
        match self.nodes.get(node as usize)?.location {
            GraphNode::Event(found) if found == at => Some(NodeId(node)),
            _ => None,
        }
    }

    pub fn edge(&self, from: NodeId, to: NodeId) -> Option<&CausalEdge> {
        self.edges.get(&(from.0, to.0))
    }

    /// Outgoing edges of a node, in target order
    pub fn successors(&self, node: NodeId) -> impl Iterator<Item = &CausalEdge> + '_ {
        let neighbors: Vec<u32> = if self.edges.is_empty() || node.0 as usize >= self.nodes.len() {
            Vec::new()
        } else {
            let (neighbors, _weights) = self.graph.adjacency(node);
            neighbors.iter().copied().collect()
        };
        neighbors
            .into_iter()
            .filter_map(move |to| self.edges.get(&(node.0, to)))
    }

    /// All edges, unordered
    pub fn edges(&self) -> impl Iterator<Item = &CausalEdge> + '_ {
        self.edges.values()
    }

    /// Backward messages found while building
    pub fn warnings(&self) -> &[AnalysisWarning] {
        &self.warnings
    }

    pub fn as_csr_graph(&self) -> &CsrGraph {
        &self.graph
    }

    /// Kahn topological order, lowest node id first among ready nodes
    ///
    /// `None` if the graph has a cycle; [`CausalGraph::build`] never
    /// produces one.
    pub fn topological_order(&self) -> Option<Vec<NodeId>> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        for edge in self.edges.values() {
            in_degree[edge.to.0 as usize] += 1;
        }

        let mut ready: BinaryHeap<Reverse<u32>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree == 0)
            .map(|(node, _)| Reverse(node as u32))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(Reverse(node)) = ready.pop() {
            order.push(NodeId(node));
            for edge in self.successors(NodeId(node)) {
                let degree = &mut in_degree[edge.to.0 as usize];
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(edge.to.0));
                }
            }
        }

        (order.len() == self.nodes.len()).then_some(order)
    }

    pub fn is_dag(&self) -> bool {
        self.topological_order().is_some()
    }
}

/// Admit zero-weight communication edges only where they keep the graph acyclic
fn break_zero_time_cycles(
    candidates: Vec<EdgeCandidate>,
    nodes: &[NodeInfo],
    warnings: &mut Vec<AnalysisWarning>,
) -> Vec<EdgeCandidate> {
    let (mut accepted, mut pending): (Vec<_>, Vec<_>) =
        candidates.into_iter().partition(|c| {
            c.weight > 0 || matches!(c.kind, EdgeKind::ProgramOrder | EdgeKind::Boundary)
        });
    if pending.is_empty() {
        return accepted;
    }

    // Boundary edges touch the start and end nodes only, which sit on no cycle
    let mut zero: FnvHashMap<u32, Vec<u32>> = FnvHashMap::default();
    for c in accepted
        .iter()
        .filter(|c| c.weight == 0 && c.kind == EdgeKind::ProgramOrder)
    {
        zero.entry(c.from).or_default().push(c.to);
    }

    let into_sync = |c: &EdgeCandidate| {
        matches!(
            nodes.get(c.to as usize).map(|n| n.location),
            Some(GraphNode::CollectiveSync { .. })
        )
    };
    pending.sort_by_key(|c| {
        let stage = match c.kind {
            EdgeKind::Message => 0,
            _ if into_sync(c) => 1,
            _ => 2,
        };
        (stage, c.from, c.to)
    });

    for c in pending {
        if reaches(&zero, c.to, c.from) {
            let ranks: Vec<RankId> = [c.from, c.to]
                .iter()
                .filter_map(|&n| nodes.get(n as usize).and_then(NodeInfo::rank))
                .collect();
            let timestamp = nodes.get(c.from as usize).map(|n| n.timestamp).unwrap_or(0);
            tracing::warn!(
                kind = %c.kind,
                timestamp,
                ?ranks,
                "edge would close a cycle of simultaneous events, omitted"
            );
            warnings.push(AnalysisWarning::CyclicEdge {
                kind: c.kind,
                timestamp,
                ranks,
            });
            continue;
        }
        zero.entry(c.from).or_default().push(c.to);
        accepted.push(c);
    }
    accepted
}

/// Depth-first search over zero-weight edges
fn reaches(zero: &FnvHashMap<u32, Vec<u32>>, from: u32, target: u32) -> bool {
    let mut stack = vec![from];
    let mut seen = FnvHashSet::default();
    while let Some(node) = stack.pop() {
        if node == target {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = zero.get(&node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}
