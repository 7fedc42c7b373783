//! Trace construction engine
//!
//! Construction runs in stages:
//!
//! ```text
//! TraceInput ─► per-rank validation + call trees (worker pool)
//!            ─► point-to-point + collective matching
//!            ─► causality graph ─► critical path ─► aggregate table
//!            ─► Arc<Analysis>
//! ```
//!
//! Ranks whose stream is malformed are dropped and listed in the failed-rank
//! manifest; everything else is still analysed. The finished [`Analysis`] is
//! immutable and shared through an `Arc`.

use crate::aggregate::AggregateTable;
use crate::call_tree::CallTree;
use crate::causal_graph::CausalGraph;
use crate::config::{ConfigError, EngineConfig};
use crate::critical_path::{find_critical_path, CriticalPath};
use crate::error::{AnalysisError, AnalysisWarning, MalformedTraceError};
use crate::event::{validate_rank_stream, Event, RankId, TraceDefinitions};
use crate::matcher::{match_communications, MatchSet};
use crate::source::{TraceInput, TraceSource};
use crate::worker_pool::run_bounded;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Shared cancellation flag
///
/// Cloning yields a handle to the same flag. Construction polls it between
/// stages and returns [`AnalysisError::Cancelled`] once it is set.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is set
    pub fn check(&self) -> Result<(), AnalysisError> {
        if self.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        Ok(())
    }
}

/// Headline numbers of one analysed trace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TraceSummary {
    /// Reconstructed ranks
    pub ranks: usize,
    pub failed_ranks: usize,
    pub events: usize,
    pub messages: usize,
    pub collectives: usize,
    /// Earliest timestamp over reconstructed ranks
    pub start: u64,
    /// Latest timestamp over reconstructed ranks
    pub end: u64,
    /// Longest single-rank span (last - first timestamp)
    pub wall_time: u64,
    pub critical_path_length: u64,
}

/// Result of analysing one trace
///
/// Immutable once built; all query methods take `&self`.
#[derive(Debug)]
pub struct Analysis {
    pub(crate) definitions: TraceDefinitions,
    pub(crate) events: BTreeMap<RankId, Vec<Event>>,
    pub(crate) trees: BTreeMap<RankId, CallTree>,
    pub(crate) matches: MatchSet,
    pub(crate) graph: CausalGraph,
    pub(crate) critical_path: CriticalPath,
    pub(crate) aggregates: AggregateTable,
    pub(crate) warnings: Vec<AnalysisWarning>,
    pub(crate) failed_ranks: Vec<MalformedTraceError>,
    pub(crate) summary: TraceSummary,
}

impl Analysis {
    pub fn definitions(&self) -> &TraceDefinitions {
        &self.definitions
    }

    pub fn graph(&self) -> &CausalGraph {
        &self.graph
    }

    pub fn ranks(&self) -> impl Iterator<Item = RankId> + '_ {
        self.trees.keys().copied()
    }

    pub fn aggregates(&self) -> &AggregateTable {
        &self.aggregates
    }
}

/// Outcome of one ingestion
///
/// `analysis` is `None` only when no rank could be reconstructed.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub analysis: Option<Arc<Analysis>>,
    pub failed_ranks: Vec<MalformedTraceError>,
    pub warnings: Vec<AnalysisWarning>,
}

impl IngestReport {
    pub fn is_complete(&self) -> bool {
        self.analysis.is_some() && self.failed_ranks.is_empty()
    }
}

/// Read a source to the end and analyse it
///
/// # Errors
///
/// Any [`crate::TraceSourceError`] aborts before analysis starts.
pub fn analyze_source<S: TraceSource + ?Sized>(
    source: &mut S,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<IngestReport, AnalysisError> {
    let input = TraceInput::read(source)?;
    analyze(input, config, cancel)
}

/// Analyse a fully read trace
///
/// # Errors
///
/// [`AnalysisError::Config`] for an invalid configuration,
/// [`AnalysisError::Cancelled`] if `cancel` fires, and
/// [`AnalysisError::Internal`] if graph construction fails.
///
/// # Example
///
/// ```
/// use mpiperf::engine::{analyze, CancellationToken};
/// use mpiperf::event::{Event, OperationId, RankId, TraceDefinitions};
/// use mpiperf::source::TraceInput;
/// use mpiperf::EngineConfig;
///
/// # fn main() -> Result<(), mpiperf::AnalysisError> {
/// let (r, f) = (RankId(0), OperationId(1));
/// let input = TraceInput::from_events(
///     TraceDefinitions::default(),
///     vec![Event::enter(r, 0, f), Event::exit(r, 5, f)],
/// );
/// let report = analyze(input, &EngineConfig::default(), &CancellationToken::new())?;
/// let analysis = report.analysis.expect("one rank");
/// assert_eq!(analysis.summary().critical_path_length, 5);
/// # Ok(())
/// # }
/// ```
pub fn analyze(
    input: TraceInput,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<IngestReport, AnalysisError> {
    analyze_observed(input, config, cancel, &|_: Stage| {})
}

/// Construction stage that just finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    CallTrees,
    Matching,
    Graph,
}

/// [`analyze`] reporting each finished stage to `observe`
pub(crate) fn analyze_observed(
    input: TraceInput,
    config: &EngineConfig,
    cancel: &CancellationToken,
    observe: &dyn Fn(Stage),
) -> Result<IngestReport, AnalysisError> {
    config.validate().map_err(ConfigError::Invalid)?;
    cancel.check()?;

    let TraceInput {
        definitions,
        ranks,
    } = input;
    let workers = config.effective_workers();
    tracing::debug!(ranks = ranks.len(), workers, "building call trees");

    let built = run_bounded(workers, ranks.into_iter().collect(), |(rank, events)| {
        let tree =
            validate_rank_stream(rank, &events).and_then(|_| CallTree::build(rank, &events));
        (rank, events, tree)
    })?;

    let mut events = BTreeMap::new();
    let mut trees = BTreeMap::new();
    let mut failed_ranks = Vec::new();
    for (rank, stream, tree) in built {
        match tree {
            Ok(tree) => {
                events.insert(rank, stream);
                trees.insert(rank, tree);
            }
            Err(err) => {
                tracing::warn!(rank = rank.0, "excluding rank: {}", err);
                failed_ranks.push(err);
            }
        }
    }
    observe(Stage::CallTrees);
    cancel.check()?;

    if trees.is_empty() {
        tracing::warn!(failed = failed_ranks.len(), "no rank could be reconstructed");
        return Ok(IngestReport {
            analysis: None,
            failed_ranks,
            warnings: Vec::new(),
        });
    }

    let matches = match_communications(&events, &definitions, config, cancel)?;
    observe(Stage::Matching);
    cancel.check()?;

    let graph = CausalGraph::build(&events, &matches)?;
    tracing::debug!(
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        "causality graph built"
    );
    observe(Stage::Graph);

    cancel.check()?;
    let critical_path = find_critical_path(&graph)?;

    let aggregates = AggregateTable::build(&trees, &matches, config.attribute_wait_time);

    let mut warnings = matches.warnings().to_vec();
    warnings.extend(graph.warnings().iter().cloned());

    let summary = summarize(&events, &matches, &critical_path, failed_ranks.len());
    tracing::debug!(
        ranks = summary.ranks,
        messages = summary.messages,
        collectives = summary.collectives,
        warnings = warnings.len(),
        "analysis complete"
    );

    let analysis = Arc::new(Analysis {
        definitions,
        events,
        trees,
        matches,
        graph,
        critical_path,
        aggregates,
        warnings: warnings.clone(),
        failed_ranks: failed_ranks.clone(),
        summary,
    });

    Ok(IngestReport {
        analysis: Some(analysis),
        failed_ranks,
        warnings,
    })
}

fn summarize(
    events: &BTreeMap<RankId, Vec<Event>>,
    matches: &MatchSet,
    critical_path: &CriticalPath,
    failed: usize,
) -> TraceSummary {
    let mut summary = TraceSummary {
        ranks: events.len(),
        failed_ranks: failed,
        messages: matches.messages().len(),
        collectives: matches.collectives().len(),
        critical_path_length: critical_path.total_duration,
        start: u64::MAX,
        ..Default::default()
    };

    for stream in events.values() {
        summary.events += stream.len();
        let (Some(first), Some(last)) = (stream.first(), stream.last()) else {
            continue;
        };
        summary.start = summary.start.min(first.timestamp);
        summary.end = summary.end.max(last.timestamp);
        summary.wall_time = summary
            .wall_time
            .max(last.timestamp.saturating_sub(first.timestamp));
    }
    if summary.start == u64::MAX {
        summary.start = 0;
    }
    summary
}

/// Holder of the current analysis with copy-on-replace re-ingestion
///
/// A new trace is analysed outside any lock and swapped in only when the
/// ingestion succeeds. Readers holding an earlier snapshot keep it alive.
#[derive(Debug, Default)]
pub struct EngineHandle {
    config: EngineConfig,
    current: RwLock<Option<Arc<Analysis>>>,
    ingest_lock: Mutex<()>,
}

impl EngineHandle {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            current: RwLock::new(None),
            ingest_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current snapshot, if any trace has been ingested
    pub fn current(&self) -> Option<Arc<Analysis>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Read and analyse `source`, replacing the current analysis on success
    ///
    /// On error, or when no rank could be reconstructed, the previous
    /// analysis stays current.
    pub fn ingest<S: TraceSource + ?Sized>(
        &self,
        source: &mut S,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, AnalysisError> {
        let input = TraceInput::read(source)?;
        self.ingest_input(input, cancel)
    }

    pub fn ingest_input(
        &self,
        input: TraceInput,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, AnalysisError> {
        let _serialized = match self.ingest_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let report = analyze(input, &self.config, cancel)?;
        if let Some(analysis) = &report.analysis {
            let mut current = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *current = Some(Arc::clone(analysis));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CommId, OperationId, PeerSelector, TagSelector};

    const F: OperationId = OperationId(1);
    const C: CommId = CommId(0);

    fn two_rank_input() -> TraceInput {
        let (r0, r1) = (RankId(0), RankId(1));
        TraceInput::from_events(
            TraceDefinitions::default(),
            vec![
                Event::enter(r0, 0, F),
                Event::send(r0, 10, F, C, 5, r1, Some(100)),
                Event::exit(r0, 11, F),
                Event::enter(r1, 0, F),
                Event::receive(r1, 12, F, C, TagSelector::Any, PeerSelector::Any, None),
                Event::exit(r1, 13, F),
            ],
        )
    }

    #[test]
    fn test_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(AnalysisError::Cancelled)));
    }

    #[test]
    fn test_analyze_summary() {
        let report = analyze(
            two_rank_input(),
            &EngineConfig::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(report.is_complete());
        let analysis = report.analysis.unwrap();
        let summary = analysis.summary;
        assert_eq!(summary.ranks, 2);
        assert_eq!(summary.events, 6);
        assert_eq!(summary.messages, 1);
        assert_eq!(summary.wall_time, 13);
        assert_eq!(summary.critical_path_length, 13);
    }

    #[test]
    fn test_malformed_rank_excluded() {
        let mut input = two_rank_input();
        let bad = RankId(2);
        input.push(Event::enter(bad, 5, F));
        input.push(Event::exit(bad, 3, F));

        let report = analyze(input, &EngineConfig::default(), &CancellationToken::new()).unwrap();
        assert_eq!(report.failed_ranks.len(), 1);
        assert_eq!(report.failed_ranks[0].rank, bad);
        assert_eq!(report.failed_ranks[0].event_index, 1);
        let analysis = report.analysis.unwrap();
        assert_eq!(analysis.ranks().collect::<Vec<_>>(), vec![RankId(0), RankId(1)]);
    }

    #[test]
    fn test_all_ranks_failed() {
        let r = RankId(0);
        let input = TraceInput::from_events(
            TraceDefinitions::default(),
            vec![Event::exit(r, 0, F)],
        );
        let report = analyze(input, &EngineConfig::default(), &CancellationToken::new()).unwrap();
        assert!(report.analysis.is_none());
        assert_eq!(report.failed_ranks.len(), 1);
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let result = analyze(two_rank_input(), &EngineConfig::default(), &token);
        assert!(matches!(result, Err(AnalysisError::Cancelled)));
    }

    #[test]
    fn test_cancelled_after_each_stage() {
        for stage in [Stage::CallTrees, Stage::Matching, Stage::Graph] {
            let token = CancellationToken::new();
            let result = analyze_observed(
                two_rank_input(),
                &EngineConfig::default(),
                &token,
                &|finished: Stage| {
                    if finished == stage {
                        token.cancel();
                    }
                },
            );
            assert!(
                matches!(result, Err(AnalysisError::Cancelled)),
                "not cancelled after {:?}",
                stage
            );
        }
    }

    #[test]
    fn test_stages_reported_in_order() {
        let seen = Mutex::new(Vec::new());
        analyze_observed(
            two_rank_input(),
            &EngineConfig::default(),
            &CancellationToken::new(),
            &|stage: Stage| seen.lock().unwrap().push(stage),
        )
        .unwrap();
        assert_eq!(
            seen.into_inner().unwrap(),
            vec![Stage::CallTrees, Stage::Matching, Stage::Graph]
        );
    }

    #[test]
    fn test_invalid_config() {
        let config = EngineConfig {
            collective_timeout_ms: 0,
            ..Default::default()
        };
        let result = analyze(two_rank_input(), &config, &CancellationToken::new());
        assert!(matches!(result, Err(AnalysisError::Config(_))));
    }

    #[test]
    fn test_handle_keeps_previous_on_failure() {
        let handle = EngineHandle::new(EngineConfig::default());
        assert!(handle.current().is_none());

        handle
            .ingest_input(two_rank_input(), &CancellationToken::new())
            .unwrap();
        let first = handle.current().unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert!(handle.ingest_input(two_rank_input(), &token).is_err());
        assert!(Arc::ptr_eq(&first, &handle.current().unwrap()));

        handle
            .ingest_input(two_rank_input(), &CancellationToken::new())
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &handle.current().unwrap()));
        // The old snapshot is still usable
        assert_eq!(first.summary.messages, 1);
    }

    #[test]
    fn test_analysis_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Analysis>();
        assert_send_sync::<EngineHandle>();
    }
}
