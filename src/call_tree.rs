//! Per-rank call tree reconstruction
//!
//! Enter/Exit (and CollectiveEnter/CollectiveExit) pairs become nested
//! intervals. Nodes live in a per-rank arena; parent links are arena indices,
//! so there are no ownership cycles between parents and children.
//!
//! ```text
//! Enter(f,0) Enter(g,1) Exit(g,4) Exit(f,5)
//!
//!   <root> [0,5]
//!   └─ f [0,5]  inclusive 5, exclusive 2
//!      └─ g [1,4]  inclusive 3, exclusive 3
//! ```
//!
//! # Example
//!
//! ```
//! use mpiperf::call_tree::CallTree;
//! use mpiperf::event::{Event, OperationId, RankId};
//!
//! # fn main() -> Result<(), mpiperf::MalformedTraceError> {
//! let (f, g, r) = (OperationId(1), OperationId(2), RankId(0));
//! let events = vec![
//!     Event::enter(r, 0, f),
//!     Event::enter(r, 1, g),
//!     Event::exit(r, 4, g),
//!     Event::exit(r, 5, f),
//! ];
//! let tree = CallTree::build(r, &events)?;
//! let f_node = tree.root_view().children().next().unwrap();
//! assert_eq!(f_node.inclusive(), 5);
//! assert_eq!(f_node.exclusive(), 2);
//! # Ok(())
//! # }
//! ```

use crate::error::{MalformedReason, MalformedTraceError};
use crate::event::{CommId, Event, EventKind, OperationId, RankId};

/// Index of a node in a rank's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub usize);

/// One matched Enter/Exit interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTreeNode {
    pub rank: RankId,
    /// `None` only for the synthetic root
    pub operation: Option<OperationId>,
    /// Set for collective frames
    pub communicator: Option<CommId>,
    pub start: u64,
    pub end: u64,
    pub depth: u32,
    /// Index of the opening event in the rank's stream (`None` for the root)
    pub enter_event: Option<usize>,
    parent: Option<FrameId>,
    children: Vec<FrameId>,
}

impl CallTreeNode {
    pub fn duration(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_collective(&self) -> bool {
        self.communicator.is_some()
    }
}

/// Call tree of one rank
///
/// Index 0 is the synthetic whole-execution root spanning the rank's first to
/// last timestamp. Nodes are stored in enter order (pre-order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTree {
    rank: RankId,
    nodes: Vec<CallTreeNode>,
}

struct OpenFrame {
    id: FrameId,
    event_index: usize,
}

impl CallTree {
    /// Reconstruct the call tree of one rank
    ///
    /// # Errors
    ///
    /// Returns [`MalformedTraceError`] if an exit does not close the frame on
    /// top of the stack, if the stack underflows, or if frames remain open at
    /// the end of the stream.
    pub fn build(rank: RankId, events: &[Event]) -> Result<Self, MalformedTraceError> {
        let start = events.first().map(|e| e.timestamp).unwrap_or(0);
        let end = events.last().map(|e| e.timestamp).unwrap_or(start);

        let mut nodes = vec![CallTreeNode {
            rank,
            operation: None,
            communicator: None,
            start,
            end,
            depth: 0,
            enter_event: None,
            parent: None,
            children: Vec::new(),
        }];
        let mut stack: Vec<OpenFrame> = Vec::new();

        for (event_index, event) in events.iter().enumerate() {
            let fail = |reason| MalformedTraceError {
                rank,
                event_index,
                reason,
            };

            let (operation, communicator, opens) = match &event.kind {
                EventKind::Enter { operation } => (*operation, None, true),
                EventKind::Exit { operation } => (*operation, None, false),
                EventKind::CollectiveEnter {
                    operation,
                    communicator,
                } => (*operation, Some(*communicator), true),
                EventKind::CollectiveExit {
                    operation,
                    communicator,
                    ..
                } => (*operation, Some(*communicator), false),
                EventKind::Send { .. } | EventKind::Receive { .. } => continue,
            };

            if opens {
                let parent = stack.last().map(|f| f.id).unwrap_or(FrameId(0));
                let id = FrameId(nodes.len());
                nodes.push(CallTreeNode {
                    rank,
                    operation: Some(operation),
                    communicator,
                    start: event.timestamp,
                    end: event.timestamp,
                    depth: stack.len() as u32 + 1,
                    enter_event: Some(event_index),
                    parent: Some(parent),
                    children: Vec::new(),
                });
                stack.push(OpenFrame { id, event_index });
                continue;
            }

            let frame = stack
                .pop()
                .ok_or_else(|| fail(MalformedReason::UnmatchedExit { operation }))?;
            let node = &mut nodes[frame.id.0];
            if node.operation != Some(operation) {
                return Err(fail(MalformedReason::MismatchedExit {
                    expected: node.operation.unwrap_or(operation),
                    found: operation,
                }));
            }
            if node.communicator != communicator {
                return Err(fail(MalformedReason::MismatchedFrameKind { operation }));
            }
            node.end = event.timestamp;

            let parent = node.parent.unwrap_or(FrameId(0));
            nodes[parent.0].children.push(frame.id);
        }

        if let Some(open) = stack.pop() {
            let node = &nodes[open.id.0];
            return Err(MalformedTraceError {
                rank,
                event_index: open.event_index,
                reason: MalformedReason::UnclosedFrame {
                    operation: node.operation.unwrap_or(OperationId(0)),
                    start: node.start,
                },
            });
        }

        Ok(Self { rank, nodes })
    }

    pub fn rank(&self) -> RankId {
        self.rank
    }

    pub fn root(&self) -> FrameId {
        FrameId(0)
    }

    /// Number of nodes including the synthetic root
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the rank has no enter/exit frames
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn node(&self, id: FrameId) -> Option<&CallTreeNode> {
        self.nodes.get(id.0)
    }

    pub fn parent(&self, id: FrameId) -> Option<FrameId> {
        self.nodes.get(id.0).and_then(|n| n.parent)
    }

    pub fn children(&self, id: FrameId) -> &[FrameId] {
        self.nodes
            .get(id.0)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn inclusive_time(&self, id: FrameId) -> u64 {
        self.nodes.get(id.0).map(|n| n.duration()).unwrap_or(0)
    }

    /// Duration minus the durations of direct children
    pub fn exclusive_time(&self, id: FrameId) -> u64 {
        let children: u64 = self
            .children(id)
            .iter()
            .map(|&child| self.inclusive_time(child))
            .sum();
        self.inclusive_time(id).saturating_sub(children)
    }

    /// All real (non-root) frames in enter order
    pub fn frames(&self) -> impl Iterator<Item = (FrameId, &CallTreeNode)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .skip(1)
            .map(|(index, node)| (FrameId(index), node))
    }

    /// Innermost frame active at `timestamp`, or the root
    ///
    /// When one sibling ends exactly where the next begins, the later sibling
    /// wins.
    pub fn innermost_at(&self, timestamp: u64) -> FrameId {
        let mut current = self.root();
        loop {
            let children = self.children(current);
            let candidates = children.partition_point(|&c| self.nodes[c.0].start <= timestamp);
            if candidates == 0 {
                return current;
            }
            let child = children[candidates - 1];
            if self.nodes[child.0].end < timestamp {
                return current;
            }
            current = child;
        }
    }

    /// Frames overlapping `[start, end]`, depth-first in start order
    pub fn overlapping(&self, start: u64, end: u64) -> Intervals<'_> {
        let mut stack = Vec::new();
        if start <= end {
            stack.extend(self.children(self.root()).iter().rev().copied());
        }
        Intervals {
            tree: self,
            start,
            end,
            stack,
        }
    }

    /// Borrowed view of a node, `None` for an id outside this tree
    pub fn view(&self, id: FrameId) -> Option<CallTreeNodeRef<'_>> {
        (id.0 < self.nodes.len()).then(|| self.frame_ref(id))
    }

    /// Borrowed view of the synthetic root
    pub fn root_view(&self) -> CallTreeNodeRef<'_> {
        self.frame_ref(self.root())
    }

    // Only for ids taken from this arena
    fn frame_ref(&self, id: FrameId) -> CallTreeNodeRef<'_> {
        CallTreeNodeRef { tree: self, id }
    }
}

/// Lazy iterator over frames overlapping a time window
pub struct Intervals<'a> {
    tree: &'a CallTree,
    start: u64,
    end: u64,
    stack: Vec<FrameId>,
}

impl<'a> Iterator for Intervals<'a> {
    type Item = CallTreeNodeRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            let node = &self.tree.nodes[id.0];
            // Children lie inside their parent, so a disjoint frame prunes its subtree
            if node.end < self.start || node.start > self.end {
                continue;
            }
            self.stack
                .extend(self.tree.children(id).iter().rev().copied());
            return Some(self.tree.frame_ref(id));
        }
        None
    }
}

/// Read-only handle to one call tree node
#[derive(Debug, Clone, Copy)]
pub struct CallTreeNodeRef<'a> {
    tree: &'a CallTree,
    id: FrameId,
}

impl<'a> CallTreeNodeRef<'a> {
    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn node(&self) -> &'a CallTreeNode {
        &self.tree.nodes[self.id.0]
    }

    pub fn rank(&self) -> RankId {
        self.tree.rank
    }

    pub fn operation(&self) -> Option<OperationId> {
        self.node().operation
    }

    pub fn start(&self) -> u64 {
        self.node().start
    }

    pub fn end(&self) -> u64 {
        self.node().end
    }

    pub fn inclusive(&self) -> u64 {
        self.tree.inclusive_time(self.id)
    }

    pub fn exclusive(&self) -> u64 {
        self.tree.exclusive_time(self.id)
    }

    pub fn parent(&self) -> Option<CallTreeNodeRef<'a>> {
        let tree = self.tree;
        tree.parent(self.id).map(|id| tree.frame_ref(id))
    }

    pub fn children(&self) -> impl Iterator<Item = CallTreeNodeRef<'a>> + 'a {
        let tree = self.tree;
        tree.children(self.id).iter().map(move |&id| tree.frame_ref(id))
    }
}
