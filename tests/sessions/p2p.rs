//! Two sessions talking to each other over a lossless in-memory link.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::stubs::{idle, mashing, tapping, GameStub};
use crate::common::{
    init_tracing, loopback_pair, run_rounds, run_until_tick, start_a, start_b,
};
use netplay_rollback::__internal::compute_checksum;
use netplay_rollback::{
    MemorySocket, NetplayConfig, NetplayError, NetplayEvent, NonBlockingSocket, P2PSession,
    SessionState,
};

/// Asserts that every tick both sides have synced produced the same state.
fn assert_synced_states_match(a: &P2PSession<GameStub>, b: &P2PSession<GameStub>) -> i64 {
    let synced = a
        .last_synced_tick()
        .as_i64()
        .min(b.last_synced_tick().as_i64());
    for tick in 0..=synced {
        assert_eq!(
            a.simulation().state_at(tick),
            b.simulation().state_at(tick),
            "states differ at tick {tick}"
        );
    }
    synced
}

#[test]
fn test_loopback_states_match_at_tick_50() -> Result<(), NetplayError> {
    let (mut a, mut b) = loopback_pair(NetplayConfig::default(), tapping, mashing);
    run_until_tick(&mut a, &mut b, 100)?;

    let at_a = a.simulation().state_at(50).expect("tick 50 simulated");
    let at_b = b.simulation().state_at(50).expect("tick 50 simulated");
    assert_eq!(at_a, at_b);
    assert_eq!(at_a.tick, 51);
    assert!(at_a.presses[0] > 0);
    assert!(at_a.presses[1] > 0);

    assert!(assert_synced_states_match(&a, &b) >= 50);
    assert!(!a.is_desynced());
    assert!(!b.is_desynced());
    Ok(())
}

#[test]
fn test_both_sides_report_connected_once() -> Result<(), NetplayError> {
    init_tracing();
    let (mut a, mut b) = loopback_pair(NetplayConfig::default(), idle, idle);
    assert_eq!(a.current_state(), SessionState::AwaitingPeer);
    assert_eq!(b.current_state(), SessionState::AwaitingPeer);

    run_rounds(&mut a, &mut b, 20)?;

    assert_eq!(a.current_state(), SessionState::Connected);
    assert_eq!(b.current_state(), SessionState::Connected);
    for session in [&mut a, &mut b] {
        let events: Vec<_> = session.events().collect();
        assert_eq!(events, vec![NetplayEvent::Connected]);
    }
    Ok(())
}

#[test]
fn test_checksums_agree_over_a_long_run() -> Result<(), NetplayError> {
    let (mut a, mut b) = loopback_pair(NetplayConfig::default(), mashing, tapping);
    run_until_tick(&mut a, &mut b, 400)?;

    let local = a.local_sync_record().expect("audit ran");
    assert!(local.tick.as_i64() >= 300);
    // the audited bytes are exactly the simulation's serialized state after that tick
    let audited = a.simulation().state_at(local.tick.as_i64()).expect("tick was simulated");
    assert_eq!(local.checksum, compute_checksum(&audited).unwrap());
    assert!(b.remote_sync_record().is_some());
    assert!(a.events().all(|e| e == NetplayEvent::Connected));
    assert_synced_states_match(&a, &b);
    Ok(())
}

#[test]
fn test_lan_preset_stays_in_sync() -> Result<(), NetplayError> {
    let (mut a, mut b) = loopback_pair(NetplayConfig::lan(), tapping, tapping);
    run_until_tick(&mut a, &mut b, 120)?;
    assert!(assert_synced_states_match(&a, &b) >= 100);
    Ok(())
}

#[test]
fn test_ping_is_measured_on_both_sides() -> Result<(), NetplayError> {
    let (mut a, mut b) = loopback_pair(NetplayConfig::default(), idle, idle);
    run_rounds(&mut a, &mut b, 10)?;

    for stats in [a.network_stats(), b.network_stats()] {
        assert!(stats.ping_ms.is_some());
        assert!(stats.average_ping_ms.is_some());
        assert!(stats.packets_sent > 0);
        assert!(stats.packets_received > 0);
        assert_eq!(stats.malformed_packets, 0);
        assert_eq!(stats.updates_since_last_receive, 0);
    }
    Ok(())
}

#[test]
fn test_garbage_on_the_link_is_dropped() -> Result<(), NetplayError> {
    let (socket_a, socket_b) = MemorySocket::pair();
    // a second handle on B's end writes straight into A's inbox
    let mut injector = socket_b.clone();
    let config = NetplayConfig::default();
    let mut a = start_a(config, socket_a, tapping);
    let mut b = start_b(config, socket_b, mashing);

    for round in 0..60_u8 {
        injector.send(&[0xff, round]);
        injector.send(&[]);
        let _ = a.update()?;
        let _ = b.update()?;
    }

    assert_eq!(a.network_stats().malformed_packets, 120);
    assert_eq!(b.network_stats().malformed_packets, 0);
    assert!(assert_synced_states_match(&a, &b) >= 40);
    Ok(())
}

#[test]
fn test_sessions_coexist_in_one_process() -> Result<(), NetplayError> {
    let (mut a1, mut b1) = loopback_pair(NetplayConfig::default(), tapping, idle);
    let (mut a2, mut b2) = loopback_pair(NetplayConfig::default(), idle, mashing);
    for _ in 0..80 {
        let _ = a1.update()?;
        let _ = a2.update()?;
        let _ = b1.update()?;
        let _ = b2.update()?;
    }
    assert_synced_states_match(&a1, &b1);
    assert_synced_states_match(&a2, &b2);
    assert_ne!(a1.simulation().state_at(30), a2.simulation().state_at(30));
    Ok(())
}
