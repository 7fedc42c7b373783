//! Causality graph and critical path benchmark
//!
//! Synthetic ring-exchange traces: every rank computes, sends to its right
//! neighbour, receives from its left neighbour, then joins an allreduce.
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench graph_construction
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mpiperf::causal_graph::CausalGraph;
use mpiperf::critical_path::find_critical_path;
use mpiperf::engine::{analyze, CancellationToken};
use mpiperf::event::{
    CommId, Event, OperationId, PeerSelector, RankId, TagSelector, TraceDefinitions,
};
use mpiperf::matcher::match_communications;
use mpiperf::source::TraceInput;
use mpiperf::EngineConfig;

const MAIN: OperationId = OperationId(1);
const COMPUTE: OperationId = OperationId(2);
const SEND: OperationId = OperationId(3);
const RECV: OperationId = OperationId(4);
const ALLREDUCE: OperationId = OperationId(5);
const WORLD: CommId = CommId(0);

/// `ranks` ranks exchanging around a ring for `iterations` rounds
fn ring_trace(ranks: u32, iterations: u64) -> TraceInput {
    let mut events = Vec::new();
    for rank in 0..ranks {
        let me = RankId(rank);
        let right = RankId((rank + 1) % ranks);
        let mut clock = 0u64;
        events.push(Event::enter(me, clock, MAIN));
        for i in 0..iterations {
            events.push(Event::enter(me, clock, COMPUTE));
            // Uneven compute so different ranks end up on the critical path
            clock += 10 + (u64::from(rank) * 7 + i * 3) % 13;
            events.push(Event::exit(me, clock, COMPUTE));
            events.push(Event::send(me, clock, SEND, WORLD, 0, right, Some(4096)));
            clock += 2;
            events.push(Event::receive(
                me,
                clock,
                RECV,
                WORLD,
                TagSelector::Value(0),
                PeerSelector::Any,
                None,
            ));
            events.push(Event::collective_enter(me, clock, ALLREDUCE, WORLD));
            clock += 5;
            events.push(Event::collective_exit(me, clock, ALLREDUCE, WORLD, Some(8)));
        }
        clock += 1;
        events.push(Event::exit(me, clock, MAIN));
    }
    TraceInput::from_events(TraceDefinitions::default(), events)
}

fn bench_graph_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("causal_graph_build");
    let config = EngineConfig::default();
    let cancel = CancellationToken::new();

    for ranks in [4u32, 16, 64] {
        let input = ring_trace(ranks, 100);
        let matches =
            match_communications(&input.ranks, &input.definitions, &config, &cancel).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(ranks), &ranks, |b, _| {
            b.iter(|| {
                let graph =
                    CausalGraph::build(black_box(&input.ranks), black_box(&matches)).unwrap();
                black_box(graph);
            });
        });
    }

    group.finish();
}

fn bench_critical_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("critical_path");
    let config = EngineConfig::default();
    let cancel = CancellationToken::new();

    for ranks in [4u32, 16, 64] {
        let input = ring_trace(ranks, 100);
        let matches =
            match_communications(&input.ranks, &input.definitions, &config, &cancel).unwrap();
        let graph = CausalGraph::build(&input.ranks, &matches).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(ranks), &ranks, |b, _| {
            b.iter(|| {
                let path = find_critical_path(black_box(&graph)).unwrap();
                black_box(path);
            });
        });
    }

    group.finish();
}

fn bench_full_analysis(c: &mut Criterion) {
    let input = ring_trace(16, 100);
    let config = EngineConfig::default();

    c.bench_function("analyze_16_ranks", |b| {
        b.iter(|| {
            let report =
                analyze(black_box(input.clone()), &config, &CancellationToken::new()).unwrap();
            black_box(report);
        });
    });
}

criterion_group!(
    benches,
    bench_graph_construction,
    bench_critical_path,
    bench_full_analysis
);
criterion_main!(benches);
