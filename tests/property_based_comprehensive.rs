//! Comprehensive property-based tests
//!
//! Random but well-formed multi-rank traces exercise the invariants of every
//! stage:
//!
//! 1. Call trees nest without overlapping siblings
//! 2. Causality graph edges never run backwards in time
//! 3. Matching is deterministic and FIFO per (sender, receiver, tag)
//! 4. The critical path spans the whole trace
//! 5. Filter expressions and rank lists parse back from their display form

mod utils;

use mpiperf::call_tree::CallTree;
use mpiperf::causal_graph::{CausalGraph, EdgeKind, GraphNode};
use mpiperf::critical_path::find_critical_path;
use mpiperf::event::{Event, OperationId, PeerSelector, RankId, TagSelector};
use mpiperf::filter::{parse_rank_list, FilterSet, RangeFilter, ValueFilter};
use mpiperf::{CancellationToken, EngineConfig};
use proptest::prelude::*;
use std::collections::BTreeMap;
use utils::*;

/// Nested enter/exit stream from (open?, operation, time step) steps
fn nested_stream(rank: RankId, steps: &[(bool, u32, u64)]) -> Vec<Event> {
    let mut events = Vec::new();
    let mut stack: Vec<OperationId> = Vec::new();
    let mut clock = 0u64;
    for &(open, op, step) in steps {
        clock += step;
        if open || stack.is_empty() {
            let operation = OperationId(op);
            stack.push(operation);
            events.push(Event::enter(rank, clock, operation));
        } else if let Some(operation) = stack.pop() {
            events.push(Event::exit(rank, clock, operation));
        }
    }
    while let Some(operation) = stack.pop() {
        clock += 1;
        events.push(Event::exit(rank, clock, operation));
    }
    events
}

#[derive(Debug, Clone)]
enum Action {
    Compute(u64),
    Send { peer: u32, tag: i32, bytes: u64 },
    Receive { peer: Option<u32>, tag: Option<i32> },
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (1u64..20).prop_map(Action::Compute),
        (0u32..4, 0i32..3, 0u64..4096).prop_map(|(peer, tag, bytes)| Action::Send {
            peer,
            tag,
            bytes
        }),
        (prop::option::of(0u32..4), prop::option::of(0i32..3))
            .prop_map(|(peer, tag)| Action::Receive { peer, tag }),
    ]
}

/// Communication trace over `ranks` ranks, every rank wrapped in main
fn communication_trace(plans: &[Vec<(u64, Action)>]) -> Vec<Event> {
    let ranks = plans.len() as u32;
    let mut events = Vec::new();
    for (index, plan) in plans.iter().enumerate() {
        let rank = RankId(index as u32);
        let mut clock = 0u64;
        events.push(Event::enter(rank, clock, MAIN));
        for (step, action) in plan {
            clock += step;
            match action {
                Action::Compute(d) => {
                    events.push(Event::enter(rank, clock, COMPUTE));
                    clock += d;
                    events.push(Event::exit(rank, clock, COMPUTE));
                }
                Action::Send { peer, tag, bytes } => {
                    let peer = RankId(peer % ranks);
                    events.push(Event::send(
                        rank,
                        clock,
                        SEND,
                        WORLD,
                        *tag,
                        peer,
                        Some(*bytes),
                    ));
                }
                Action::Receive { peer, tag } => {
                    let peer = match peer {
                        Some(p) => PeerSelector::Rank(RankId(p % ranks)),
                        None => PeerSelector::Any,
                    };
                    let tag = match tag {
                        Some(t) => TagSelector::Value(*t),
                        None => TagSelector::Any,
                    };
                    events.push(Event::receive(rank, clock, RECV, WORLD, tag, peer, None));
                }
            }
        }
        clock += 1;
        events.push(Event::exit(rank, clock, MAIN));
    }
    events
}

fn plans() -> impl Strategy<Value = Vec<Vec<(u64, Action)>>> {
    // Zero steps put events of different ranks on one timestamp
    prop::collection::vec(prop::collection::vec((0u64..10, action()), 0..12), 1..5)
}

fn grouped(events: Vec<Event>) -> BTreeMap<RankId, Vec<Event>> {
    input(events).ranks
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_call_tree_siblings_never_overlap(
        steps in prop::collection::vec((any::<bool>(), 1u32..5, 0u64..10), 0..40),
    ) {
        let rank = RankId(0);
        let events = nested_stream(rank, &steps);
        let tree = CallTree::build(rank, &events).unwrap();

        for (id, node) in tree.frames() {
            let children = tree.children(id);
            let mut child_total = 0u64;
            for pair in children.windows(2) {
                let a = tree.node(pair[0]).unwrap();
                let b = tree.node(pair[1]).unwrap();
                prop_assert!(a.end <= b.start);
            }
            for &child in children {
                let c = tree.node(child).unwrap();
                prop_assert!(c.start >= node.start && c.end <= node.end);
                child_total += c.duration();
            }
            prop_assert!(tree.inclusive_time(id) >= child_total);
            prop_assert_eq!(tree.exclusive_time(id), tree.inclusive_time(id) - child_total);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_edges_run_forward(plans in plans()) {
        let ranks = grouped(communication_trace(&plans));
        let matches = mpiperf::matcher::match_communications(
            &ranks,
            &definitions(),
            &EngineConfig::default(),
            &CancellationToken::new(),
        ).unwrap();
        let graph = CausalGraph::build(&ranks, &matches).unwrap();
        prop_assert!(graph.is_dag());

        for edge in graph.edges() {
            let from = graph.node(edge.from).unwrap();
            let to = graph.node(edge.to).unwrap();
            if edge.kind == EdgeKind::Boundary && to.location == GraphNode::GlobalEnd {
                prop_assert_eq!(edge.weight, 0);
            } else {
                prop_assert!(to.timestamp >= from.timestamp);
                prop_assert_eq!(edge.weight, to.timestamp - from.timestamp);
            }
        }
    }

    #[test]
    fn prop_matching_deterministic(plans in plans(), workers in 1usize..4) {
        let ranks = grouped(communication_trace(&plans));
        let run = |worker_threads| {
            let config = EngineConfig { worker_threads, ..Default::default() };
            mpiperf::matcher::match_communications(
                &ranks,
                &definitions(),
                &config,
                &CancellationToken::new(),
            ).unwrap()
        };
        let first = run(workers);
        prop_assert_eq!(&first, &run(workers));
        prop_assert_eq!(&first, &run(1));

        // Every send and receive is used at most once
        let mut sends: Vec<_> = first.messages().iter().map(|m| m.send).collect();
        let mut receives: Vec<_> = first.messages().iter().map(|m| m.receive).collect();
        sends.sort();
        sends.dedup();
        receives.sort();
        receives.dedup();
        prop_assert_eq!(sends.len(), first.messages().len());
        prop_assert_eq!(receives.len(), first.messages().len());
    }

    #[test]
    fn prop_fifo_per_channel(plans in plans()) {
        // Exact receives only: peer and tag always concrete
        let plans: Vec<Vec<(u64, Action)>> = plans
            .into_iter()
            .map(|plan| {
                plan.into_iter()
                    .map(|(step, action)| match action {
                        Action::Receive { peer, tag } => (
                            step,
                            Action::Receive {
                                peer: Some(peer.unwrap_or(0)),
                                tag: Some(tag.unwrap_or(0)),
                            },
                        ),
                        other => (step, other),
                    })
                    .collect()
            })
            .collect();
        let matches = match_events(communication_trace(&plans));

        let mut last: BTreeMap<(RankId, RankId, i32), (usize, usize)> = BTreeMap::new();
        let mut ordered: Vec<_> = matches.messages().to_vec();
        ordered.sort_by_key(|m| m.receive);
        for m in ordered {
            let key = (m.sender(), m.receiver(), m.tag);
            if let Some(&(send, _)) = last.get(&key) {
                prop_assert!(m.send.index > send);
            }
            last.insert(key, (m.send.index, m.receive.index));
        }
    }

    #[test]
    fn prop_critical_path_spans_trace(plans in plans()) {
        let ranks = grouped(communication_trace(&plans));
        let matches = mpiperf::matcher::match_communications(
            &ranks,
            &definitions(),
            &EngineConfig::default(),
            &CancellationToken::new(),
        ).unwrap();
        let graph = CausalGraph::build(&ranks, &matches).unwrap();
        let path = find_critical_path(&graph).unwrap();

        prop_assert_eq!(path.total_duration, graph.end_timestamp() - graph.start_timestamp());
        let segment_sum: u64 = path.segments.iter().map(|s| s.weight).sum();
        prop_assert_eq!(segment_sum, path.total_duration);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_range_filter_display_parses_back(
        min in prop::option::of(-1000i64..1000),
        width in 0i64..1000,
        open_max in any::<bool>(),
    ) {
        let max = if open_max { None } else { Some(min.unwrap_or(0) + width) };
        let range = RangeFilter::new(min, max);
        let filter: ValueFilter = range.to_string().parse().unwrap();
        for value in [-2000i64, -1, 0, 1, 500, 2000] {
            prop_assert_eq!(filter.accepts(value), range.accepts(value));
        }
    }

    #[test]
    fn prop_filter_set_never_panics(expr in "[a-z:!;,\\[\\]=0-9+-]{0,30}") {
        if let Ok(filters) = FilterSet::from_expr(&expr) {
            let again = FilterSet::from_expr(&filters.to_string()).unwrap();
            prop_assert_eq!(again, filters);
        }
    }

    #[test]
    fn prop_rank_list_ranges(start in 0u32..100, len in 0u32..20, extra in 200u32..300) {
        let list = format!("{}-{},{}", start, start + len, extra);
        let ranks = parse_rank_list(&list).unwrap();
        prop_assert_eq!(ranks.len() as u32, len + 2);
        prop_assert!(ranks.contains(&RankId(extra)));
        prop_assert!(ranks.contains(&RankId(start + len)));
    }
}
