// Integration test utilities
//
// Operation tables, trace builders and helpers that run the full engine or
// write JSON-lines traces for the binary.
#![allow(dead_code)]

use mpiperf::engine::{analyze, Analysis, CancellationToken};
use mpiperf::event::{CommId, Event, OperationId, TraceDefinitions};
use mpiperf::matcher::{match_communications, MatchSet};
use mpiperf::source::TraceInput;
use mpiperf::EngineConfig;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

pub const MAIN: OperationId = OperationId(1);
pub const SEND: OperationId = OperationId(2);
pub const RECV: OperationId = OperationId(3);
pub const BARRIER: OperationId = OperationId(4);
pub const ALLREDUCE: OperationId = OperationId(5);
pub const COMPUTE: OperationId = OperationId(6);

pub const WORLD: CommId = CommId(0);

pub fn definitions() -> TraceDefinitions {
    let mut defs = TraceDefinitions::default();
    for (id, name) in [
        (MAIN, "main"),
        (SEND, "MPI_Send"),
        (RECV, "MPI_Recv"),
        (BARRIER, "MPI_Barrier"),
        (ALLREDUCE, "MPI_Allreduce"),
        (COMPUTE, "compute"),
    ] {
        defs.operations.insert(id, name.to_string());
    }
    defs
}

pub fn input(events: Vec<Event>) -> TraceInput {
    TraceInput::from_events(definitions(), events)
}

/// Run the whole engine with default configuration
pub fn analyze_events(events: Vec<Event>) -> Arc<Analysis> {
    analyze(input(events), &EngineConfig::default(), &CancellationToken::new())
        .expect("analysis succeeds")
        .analysis
        .expect("at least one rank reconstructed")
}

/// Run the matcher only
pub fn match_events(events: Vec<Event>) -> MatchSet {
    let input = input(events);
    match_communications(
        &input.ranks,
        &input.definitions,
        &EngineConfig::default(),
        &CancellationToken::new(),
    )
    .expect("matching succeeds")
}

/// One JSON record per line, definitions first
pub fn to_json_lines(definitions: &TraceDefinitions, events: &[Event]) -> String {
    let mut out = serde_json::json!({ "definitions": definitions }).to_string();
    out.push('\n');
    for event in events {
        out.push_str(&serde_json::to_string(event).expect("event serializes"));
        out.push('\n');
    }
    out
}

pub fn write_trace(events: &[Event]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(to_json_lines(&definitions(), events).as_bytes())
        .expect("write trace");
    file
}
