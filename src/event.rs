//! Event model for MPI traces
//!
//! A trace is a set of per-rank event streams plus a definitions block that
//! names operations, communicators and hardware localities. Events are a
//! closed sum type: every stage downstream (call trees, matching, graph
//! construction) dispatches exhaustively on [`EventKind`].
//!
//! # Example
//!
//! ```
//! use mpiperf::event::{Event, OperationId, RankId, validate_rank_stream};
//!
//! let f = OperationId(1);
//! let events = vec![
//!     Event::enter(RankId(0), 0, f),
//!     Event::exit(RankId(0), 5, f),
//! ];
//! assert!(validate_rank_stream(RankId(0), &events).is_ok());
//! ```

use crate::error::{MalformedReason, MalformedTraceError, TraceSourceError};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Process identifier within the MPI program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RankId(pub u32);

/// Index into the trace's operation name table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u32);

/// Communicator identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommId(pub u32);

impl fmt::Display for RankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

impl fmt::Display for CommId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comm#{}", self.0)
    }
}

/// Source selector of a receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerSelector {
    /// Accept a message from any sender (MPI_ANY_SOURCE)
    Any,
    /// Accept a message from one sender only
    Rank(RankId),
}

impl PeerSelector {
    pub fn accepts(&self, sender: RankId) -> bool {
        match self {
            PeerSelector::Any => true,
            PeerSelector::Rank(rank) => *rank == sender,
        }
    }
}

/// Tag selector of a receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagSelector {
    /// Accept any tag (MPI_ANY_TAG)
    Any,
    /// Accept exactly this tag
    Value(i32),
}

impl TagSelector {
    pub fn accepts(&self, tag: i32) -> bool {
        match self {
            TagSelector::Any => true,
            TagSelector::Value(value) => *value == tag,
        }
    }
}

/// What happened at an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// A function or region was entered
    Enter { operation: OperationId },
    /// A function or region was left
    Exit { operation: OperationId },
    /// A point-to-point message left this rank for `peer`
    Send {
        operation: OperationId,
        communicator: CommId,
        tag: i32,
        peer: RankId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload_bytes: Option<u64>,
    },
    /// A point-to-point message was received (completion time)
    Receive {
        operation: OperationId,
        communicator: CommId,
        tag: TagSelector,
        peer: PeerSelector,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload_bytes: Option<u64>,
    },
    /// This rank entered a collective on `communicator`
    CollectiveEnter {
        operation: OperationId,
        communicator: CommId,
    },
    /// This rank left a collective on `communicator`
    CollectiveExit {
        operation: OperationId,
        communicator: CommId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload_bytes: Option<u64>,
    },
}

/// A single trace record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub rank: RankId,
    /// Trace-local clock units, non-decreasing within a rank
    pub timestamp: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(rank: RankId, timestamp: u64, kind: EventKind) -> Self {
        Self {
            rank,
            timestamp,
            kind,
        }
    }

    pub fn enter(rank: RankId, timestamp: u64, operation: OperationId) -> Self {
        Self::new(rank, timestamp, EventKind::Enter { operation })
    }

    pub fn exit(rank: RankId, timestamp: u64, operation: OperationId) -> Self {
        Self::new(rank, timestamp, EventKind::Exit { operation })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn send(
        rank: RankId,
        timestamp: u64,
        operation: OperationId,
        communicator: CommId,
        tag: i32,
        peer: RankId,
        payload_bytes: Option<u64>,
    ) -> Self {
        Self::new(
            rank,
            timestamp,
            EventKind::Send {
                operation,
                communicator,
                tag,
                peer,
                payload_bytes,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn receive(
        rank: RankId,
        timestamp: u64,
        operation: OperationId,
        communicator: CommId,
        tag: TagSelector,
        peer: PeerSelector,
        payload_bytes: Option<u64>,
    ) -> Self {
        Self::new(
            rank,
            timestamp,
            EventKind::Receive {
                operation,
                communicator,
                tag,
                peer,
                payload_bytes,
            },
        )
    }

    pub fn collective_enter(
        rank: RankId,
        timestamp: u64,
        operation: OperationId,
        communicator: CommId,
    ) -> Self {
        Self::new(
            rank,
            timestamp,
            EventKind::CollectiveEnter {
                operation,
                communicator,
            },
        )
    }

    pub fn collective_exit(
        rank: RankId,
        timestamp: u64,
        operation: OperationId,
        communicator: CommId,
        payload_bytes: Option<u64>,
    ) -> Self {
        Self::new(
            rank,
            timestamp,
            EventKind::CollectiveExit {
                operation,
                communicator,
                payload_bytes,
            },
        )
    }

    /// Operation (function or MPI call) this event belongs to
    pub fn operation(&self) -> OperationId {
        match &self.kind {
            EventKind::Enter { operation }
            | EventKind::Exit { operation }
            | EventKind::Send { operation, .. }
            | EventKind::Receive { operation, .. }
            | EventKind::CollectiveEnter { operation, .. }
            | EventKind::CollectiveExit { operation, .. } => *operation,
        }
    }

    /// Communicator for communication events, `None` for enter/exit
    pub fn communicator(&self) -> Option<CommId> {
        match &self.kind {
            EventKind::Enter { .. } | EventKind::Exit { .. } => None,
            EventKind::Send { communicator, .. }
            | EventKind::Receive { communicator, .. }
            | EventKind::CollectiveEnter { communicator, .. }
            | EventKind::CollectiveExit { communicator, .. } => Some(*communicator),
        }
    }

    pub fn payload_bytes(&self) -> Option<u64> {
        match &self.kind {
            EventKind::Send { payload_bytes, .. }
            | EventKind::Receive { payload_bytes, .. }
            | EventKind::CollectiveExit { payload_bytes, .. } => *payload_bytes,
            _ => None,
        }
    }
}

/// Validate one rank's stream before reconstruction
///
/// Checks that timestamps never go backwards, that sends carry a valid tag,
/// and that the enter/exit depth never goes negative. Operation identity of
/// exits is checked by the call tree builder, which owns the frame stack.
///
/// # Errors
///
/// Returns the first violation found, with the index of the offending event.
pub fn validate_rank_stream(rank: RankId, events: &[Event]) -> Result<(), MalformedTraceError> {
    let mut previous: Option<u64> = None;
    let mut depth: usize = 0;

    for (event_index, event) in events.iter().enumerate() {
        let fail = |reason| MalformedTraceError {
            rank,
            event_index,
            reason,
        };

        if let Some(previous) = previous {
            if event.timestamp < previous {
                return Err(fail(MalformedReason::NonMonotonicTimestamp {
                    previous,
                    current: event.timestamp,
                }));
            }
        }
        previous = Some(event.timestamp);

        match &event.kind {
            EventKind::Enter { .. } | EventKind::CollectiveEnter { .. } => depth += 1,
            EventKind::Exit { operation } | EventKind::CollectiveExit { operation, .. } => {
                if depth == 0 {
                    return Err(fail(MalformedReason::UnmatchedExit {
                        operation: *operation,
                    }));
                }
                depth -= 1;
            }
            EventKind::Send { tag, .. } => {
                if *tag < 0 {
                    return Err(fail(MalformedReason::NegativeSendTag { tag: *tag }));
                }
            }
            EventKind::Receive { .. } => {}
        }
    }

    Ok(())
}

/// Hardware grouping level of ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalityLevel {
    Core,
    Socket,
    Numa,
    Node,
}

/// A set of ranks sharing one locality (e.g. all ranks on node 3)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalityGroup {
    pub level: LocalityLevel,
    pub ranks: Vec<RankId>,
}

/// Communicator definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicatorDef {
    #[serde(default)]
    pub name: String,
    /// Predetermined membership; `None` means membership is inferred from
    /// the ranks that take part in collectives on it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<BTreeSet<RankId>>,
}

/// Definitions block of a trace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceDefinitions {
    #[serde(default)]
    pub operations: BTreeMap<OperationId, String>,
    #[serde(default)]
    pub communicators: BTreeMap<CommId, CommunicatorDef>,
    #[serde(default)]
    pub localities: Vec<LocalityGroup>,
}

impl TraceDefinitions {
    /// Human-readable operation name, falling back to `op#N`
    pub fn operation_name(&self, operation: OperationId) -> Cow<'_, str> {
        match self.operations.get(&operation) {
            Some(name) => Cow::Borrowed(name.as_str()),
            None => Cow::Owned(operation.to_string()),
        }
    }

    /// Predetermined members of a communicator, if any
    pub fn members(&self, communicator: CommId) -> Option<&BTreeSet<RankId>> {
        self.communicators
            .get(&communicator)
            .and_then(|def| def.members.as_ref())
    }

    /// Locality groups of one level, sorted, or `None` if the level is not defined
    pub fn locality_groups(&self, level: LocalityLevel) -> Option<Vec<Vec<RankId>>> {
        let mut groups: Vec<Vec<RankId>> = self
            .localities
            .iter()
            .filter(|group| group.level == level)
            .map(|group| {
                let mut ranks = group.ranks.clone();
                ranks.sort();
                ranks
            })
            .collect();

        if groups.is_empty() {
            return None;
        }
        groups.sort();
        Some(groups)
    }

    /// Check that locality groups of each level are disjoint
    pub fn validate(&self) -> Result<(), TraceSourceError> {
        let mut seen: BTreeMap<(LocalityLevel, RankId), usize> = BTreeMap::new();
        for (index, group) in self.localities.iter().enumerate() {
            for &rank in &group.ranks {
                if let Some(previous) = seen.insert((group.level, rank), index) {
                    return Err(TraceSourceError::InvalidDefinitions(format!(
                        "rank {} appears in locality groups {} and {} of level {:?}",
                        rank, previous, index, group.level
                    )));
                }
            }
        }
        Ok(())
    }
}
