//! Error and warning taxonomy
//!
//! Construction never stops at the first problem: malformed ranks and
//! communication warnings are collected into the [`crate::IngestReport`].
//! Only a failing trace source, a cancelled build or an invalid configuration
//! abort construction as a whole.

use crate::causal_graph::EdgeKind;
use crate::config::ConfigError;
use crate::event::{CommId, OperationId, RankId};
use std::fmt;
use thiserror::Error;

/// Why a rank's stream could not be reconstructed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedReason {
    #[error("timestamp {current} precedes previous timestamp {previous}")]
    NonMonotonicTimestamp { previous: u64, current: u64 },

    #[error("exit of {operation} without a matching enter")]
    UnmatchedExit { operation: OperationId },

    #[error("exit of {found} does not close the open frame of {expected}")]
    MismatchedExit {
        expected: OperationId,
        found: OperationId,
    },

    #[error("exit of {operation} closes a frame of a different kind or communicator")]
    MismatchedFrameKind { operation: OperationId },

    #[error("{operation} entered at {start} is never exited")]
    UnclosedFrame { operation: OperationId, start: u64 },

    #[error("send tag {tag} is negative")]
    NegativeSendTag { tag: i32 },
}

/// Structural violation in one rank's stream
///
/// Fatal for that rank only; other ranks are still reconstructed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed trace on rank {rank} at event {event_index}: {reason}")]
pub struct MalformedTraceError {
    pub rank: RankId,
    pub event_index: usize,
    pub reason: MalformedReason,
}

/// Which side of a point-to-point message was left without a partner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => write!(f, "send"),
            Direction::Receive => write!(f, "receive"),
        }
    }
}

/// A send or receive still pending at the end of the trace
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unmatched {direction} of {operation} on rank {rank} at {timestamp} ({communicator})")]
pub struct UnmatchedCommunicationWarning {
    pub rank: RankId,
    pub operation: OperationId,
    pub timestamp: u64,
    pub communicator: CommId,
    pub direction: Direction,
    /// Index of the event in the rank's stream
    pub event_index: usize,
}

/// Non-fatal findings of trace construction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisWarning {
    #[error(transparent)]
    UnmatchedCommunication(#[from] UnmatchedCommunicationWarning),

    #[error(
        "collective {sequence} of {operation} on {communicator} incomplete: arrived {arrived:?}, missing {missing:?}"
    )]
    IncompleteCollective {
        communicator: CommId,
        sequence: u64,
        operation: OperationId,
        arrived: Vec<RankId>,
        missing: Vec<RankId>,
    },

    #[error(
        "message from rank {sender} at {send_timestamp} received by rank {receiver} earlier at {receive_timestamp}; edge omitted"
    )]
    BackwardMessage {
        sender: RankId,
        receiver: RankId,
        send_timestamp: u64,
        receive_timestamp: u64,
    },

    #[error("{kind} edge at {timestamp} on ranks {ranks:?} would close a cycle of simultaneous events; edge omitted")]
    CyclicEdge {
        kind: EdgeKind,
        timestamp: u64,
        ranks: Vec<RankId>,
    },

    #[error("collective matching on {communicator} timed out with {pending} instances pending")]
    CollectiveTimeout { communicator: CommId, pending: usize },
}

/// Failure of the trace source; aborts construction entirely
#[derive(Error, Debug)]
pub enum TraceSourceError {
    #[error("failed to read trace: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {message}")]
    Decode { line: usize, message: String },

    #[error("invalid trace definitions: {0}")]
    InvalidDefinitions(String),
}

/// Errors that abort engine construction
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("trace source failed: {0}")]
    Source(#[from] TraceSourceError),

    #[error("analysis cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("internal analysis failure: {0}")]
    Internal(#[from] anyhow::Error),
}
