//! Integration tests for point-to-point and collective matching

mod utils;

use mpiperf::error::{AnalysisWarning, Direction};
use mpiperf::event::{CommId, CommunicatorDef, Event, PeerSelector, RankId, TagSelector};
use mpiperf::matcher::{match_communications, EventRef, MatchedCommunication};
use mpiperf::{CancellationToken, EngineConfig};
use utils::*;

fn r(n: u32) -> RankId {
    RankId(n)
}

#[test]
fn test_wildcard_receive_matches_late_send() {
    // 100-byte send at t=10 tag 5, wildcard receive completes at t=12
    let matches = match_events(vec![
        Event::enter(r(0), 0, MAIN),
        Event::send(r(0), 10, SEND, WORLD, 5, r(1), Some(100)),
        Event::exit(r(0), 11, MAIN),
        Event::enter(r(1), 0, MAIN),
        Event::receive(r(1), 12, RECV, WORLD, TagSelector::Any, PeerSelector::Any, None),
        Event::exit(r(1), 13, MAIN),
    ]);

    assert_eq!(matches.messages().len(), 1);
    let m = &matches.messages()[0];
    assert_eq!(m.bytes, 100);
    assert_eq!(m.tag, 5);
    assert_eq!(m.transit_time(), Some(2));
    assert_eq!(m.send, EventRef::new(r(0), 1));
    assert_eq!(m.receive, EventRef::new(r(1), 1));
    assert!(matches.warnings().is_empty());
}

#[test]
fn test_fifo_between_two_sends() {
    // S1(t=1), S2(t=2) from the same sender, one wildcard receive
    let matches = match_events(vec![
        Event::send(r(0), 1, SEND, WORLD, 0, r(1), None),
        Event::send(r(0), 2, SEND, WORLD, 0, r(1), None),
        Event::receive(r(1), 5, RECV, WORLD, TagSelector::Any, PeerSelector::Any, None),
    ]);

    assert_eq!(matches.messages().len(), 1);
    assert_eq!(matches.messages()[0].send_timestamp, 1);

    let unmatched: Vec<_> = matches
        .warnings()
        .iter()
        .filter_map(|w| match w {
            AnalysisWarning::UnmatchedCommunication(u) => Some(u),
            _ => None,
        })
        .collect();
    assert_eq!(unmatched.len(), 1);
    assert_eq!(unmatched[0].timestamp, 2);
    assert_eq!(unmatched[0].direction, Direction::Send);
}

#[test]
fn test_unmatched_send_single_warning() {
    let matches = match_events(vec![
        Event::enter(r(0), 0, MAIN),
        Event::send(r(0), 3, SEND, WORLD, 1, r(1), Some(8)),
        Event::exit(r(0), 4, MAIN),
        Event::enter(r(1), 0, MAIN),
        Event::exit(r(1), 4, MAIN),
    ]);

    assert!(matches.messages().is_empty());
    assert_eq!(matches.warnings().len(), 1);
    assert!(matches!(
        &matches.warnings()[0],
        AnalysisWarning::UnmatchedCommunication(u) if u.rank == r(0) && u.event_index == 1
    ));
}

#[test]
fn test_communicators_are_separate() {
    let other = CommId(7);
    let matches = match_events(vec![
        Event::send(r(0), 1, SEND, other, 0, r(1), None),
        Event::send(r(0), 2, SEND, WORLD, 0, r(1), None),
        Event::receive(r(1), 3, RECV, WORLD, TagSelector::Any, PeerSelector::Rank(r(0)), None),
        Event::receive(r(1), 4, RECV, other, TagSelector::Any, PeerSelector::Rank(r(0)), None),
    ]);

    assert_eq!(matches.messages().len(), 2);
    for m in matches.messages() {
        let expected = if m.communicator == WORLD { 2 } else { 1 };
        assert_eq!(m.send_timestamp, expected);
    }
}

#[test]
fn test_exact_receive_skips_other_sender() {
    let matches = match_events(vec![
        Event::send(r(0), 1, SEND, WORLD, 0, r(2), None),
        Event::send(r(1), 1, SEND, WORLD, 0, r(2), None),
        Event::receive(r(2), 4, RECV, WORLD, TagSelector::Value(0), PeerSelector::Rank(r(1)), None),
        Event::receive(r(2), 5, RECV, WORLD, TagSelector::Value(0), PeerSelector::Rank(r(0)), None),
    ]);

    let senders: Vec<RankId> = matches.messages().iter().map(|m| m.sender()).collect();
    assert_eq!(senders, vec![r(1), r(0)]);
}

#[test]
fn test_barrier_instances_and_sync() {
    let mut events = Vec::new();
    for (rank, first, second) in [(0u32, 1u64, 20u64), (1, 4, 22), (2, 2, 30)] {
        events.push(Event::collective_enter(r(rank), first, BARRIER, WORLD));
        events.push(Event::collective_exit(r(rank), 10, BARRIER, WORLD, None));
        events.push(Event::collective_enter(r(rank), second, BARRIER, WORLD));
        events.push(Event::collective_exit(r(rank), 31, BARRIER, WORLD, None));
    }

    let matches = match_events(events);
    assert_eq!(matches.collectives().len(), 2);

    let first = &matches.collectives()[0];
    assert_eq!(first.sequence, 0);
    assert_eq!(first.sync_timestamp, 4);
    assert_eq!(first.last_arrival(), Some(r(1)));
    assert_eq!(first.wait_time(r(0)), Some(3));

    let second = &matches.collectives()[1];
    assert_eq!(second.sequence, 1);
    assert_eq!(second.sync_timestamp, 30);
    assert_eq!(second.last_arrival(), Some(r(2)));
}

#[test]
fn test_missing_participant_reported() {
    let mut defs = definitions();
    defs.communicators.insert(
        WORLD,
        CommunicatorDef {
            name: "world".to_string(),
            members: Some([r(0), r(1)].into_iter().collect()),
        },
    );
    let input = mpiperf::source::TraceInput::from_events(
        defs,
        vec![
            Event::collective_enter(r(0), 1, ALLREDUCE, WORLD),
            Event::collective_exit(r(0), 2, ALLREDUCE, WORLD, Some(64)),
        ],
    );
    let matches = match_communications(
        &input.ranks,
        &input.definitions,
        &EngineConfig::default(),
        &CancellationToken::new(),
    )
    .unwrap();

    assert!(matches.collectives().is_empty());
    assert!(matches.warnings().iter().any(|w| matches!(
        w,
        AnalysisWarning::IncompleteCollective { missing, .. } if missing == &vec![r(1)]
    )));
}

#[test]
fn test_matching_is_idempotent_and_worker_independent() {
    let mut events = Vec::new();
    for rank in 0..4u32 {
        events.push(Event::enter(r(rank), 0, MAIN));
        for step in 0..5u64 {
            let peer = r((rank + 1) % 4);
            events.push(Event::send(
                r(rank),
                1 + step * 4,
                SEND,
                WORLD,
                step as i32,
                peer,
                Some(step * 10),
            ));
            events.push(Event::receive(
                r(rank),
                3 + step * 4,
                RECV,
                WORLD,
                TagSelector::Any,
                PeerSelector::Any,
                None,
            ));
        }
        events.push(Event::exit(r(rank), 30, MAIN));
    }

    let input = input(events);
    let run = |workers: usize| {
        let config = EngineConfig {
            worker_threads: workers,
            ..Default::default()
        };
        match_communications(&input.ranks, &input.definitions, &config, &CancellationToken::new())
            .unwrap()
    };

    let single = run(1);
    assert_eq!(single.messages().len(), 20);
    assert_eq!(single, run(1));
    assert_eq!(single, run(4));

    let kinds: Vec<bool> = single
        .iter()
        .map(|m| matches!(m, MatchedCommunication::PointToPoint(_)))
        .collect();
    assert!(kinds.iter().all(|&p2p| p2p));
}
