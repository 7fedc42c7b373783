//! mpiperf - MPI trace reconstruction and critical-path analysis
//!
//! This library turns per-rank streams of timestamped MPI events into nested
//! call trees, matches point-to-point messages and collective operations across
//! ranks, builds a causality graph from both, and derives the critical path and
//! aggregate timing tables from it. The resulting [`engine::Analysis`] is
//! immutable and can be queried concurrently by a CLI or a viewer.

pub mod aggregate;
pub mod call_tree;
pub mod causal_graph;
pub mod cli;
pub mod comm_matrix;
pub mod config;
pub mod critical_path;
pub mod engine;
pub mod error;
pub mod event;
pub mod filter;
pub mod matcher;
pub mod query;
pub mod report;
pub mod source;
mod worker_pool;

pub use config::EngineConfig;
pub use engine::{analyze, Analysis, CancellationToken, EngineHandle, IngestReport};
pub use error::{AnalysisError, AnalysisWarning, MalformedTraceError, TraceSourceError};
pub use event::{CommId, Event, EventKind, OperationId, RankId};
