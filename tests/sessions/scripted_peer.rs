//! One real session against a peer whose packets are built by hand, so every arrival time
//! is under the test's control.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::stubs::{tapping, GameStub};
use crate::common::{handshake, idle_input, input_window, start_a, sync_data};
use netplay_rollback::network::codec::decode_packet;
use netplay_rollback::telemetry::{CollectingObserver, ViolationKind};
use netplay_rollback::{
    Button, DesyncDetection, EncodedInput, InputStatus, MemorySocket, NetplayConfig,
    NetplayError, NetplayEvent, NonBlockingSocket, P2PSession, Packet, PlayerState,
    SessionBuilder, Tick,
};
use std::sync::Arc;

fn connected_session(config: NetplayConfig) -> (P2PSession<GameStub>, MemorySocket) {
    let (socket, mut peer) = MemorySocket::pair();
    let session = start_a(config, socket, tapping);
    peer.send(&handshake());
    (session, peer)
}

/// Feeds the peer's input for every tick just before the session simulates it.
fn run_just_in_time(
    session: &mut P2PSession<GameStub>,
    peer: &mut MemorySocket,
    ticks: std::ops::Range<i64>,
) -> Result<(), NetplayError> {
    for tick in ticks {
        assert_eq!(session.current_tick(), Tick::new(tick));
        peer.send(&idle_input(tick, 5));
        let report = session.update()?;
        assert!(report.advanced, "tick {tick} did not advance: {report:?}");
        assert_eq!(report.remote_input, Some(InputStatus::Confirmed));
    }
    Ok(())
}

#[test]
fn test_late_input_replays_exactly_the_missing_ticks() -> Result<(), NetplayError> {
    let (mut session, mut peer) = connected_session(NetplayConfig::default());
    run_just_in_time(&mut session, &mut peer, 0..10)?;
    assert_eq!(session.last_synced_tick(), Tick::new(9));

    // three ticks run on predictions
    for _ in 0..3 {
        let report = session.update()?;
        assert!(report.advanced);
        assert_eq!(report.replayed_ticks, 0);
        assert_eq!(report.remote_input, Some(InputStatus::Predicted));
    }
    assert_eq!(session.current_tick(), Tick::new(13));
    assert_eq!(session.last_synced_tick(), Tick::new(9));
    assert_eq!(session.simulation().state_at(12).unwrap().presses[1], 0);

    // the real inputs for 10..=12 held A
    let mut held = PlayerState::default();
    held.press(Button::A);
    let a = EncodedInput::encode(&held);
    let window = [EncodedInput::NONE, EncodedInput::NONE, a, a, a];
    peer.send(&input_window(12, 0, &window));

    let report = session.update()?;
    assert_eq!(report.replayed_ticks, 3);
    assert_eq!(session.last_synced_tick(), Tick::new(12));
    assert_eq!(session.confirmed_tick(), Tick::new(12));
    assert!(report.advanced);
    assert_eq!(session.current_tick(), Tick::new(14));
    assert_eq!(session.simulation().loads, 1);

    // corrected history, then tick 13 predicted from the newly confirmed A
    assert_eq!(session.simulation().state_at(12).unwrap().presses[1], 3);
    assert_eq!(session.simulation().gs.presses[1], 4);
    Ok(())
}

#[test]
fn test_checksum_mismatch_at_tick_20_is_fatal() -> Result<(), NetplayError> {
    let (mut session, mut peer) = connected_session(NetplayConfig::default());
    run_just_in_time(&mut session, &mut peer, 0..11)?;

    // a matching record changes nothing
    let at_10 = session.local_sync_record().expect("tick 10 audited");
    assert_eq!(at_10.tick, Tick::new(10));
    peer.send(&sync_data(10, at_10.checksum));
    run_just_in_time(&mut session, &mut peer, 11..21)?;
    assert!(!session.is_desynced());

    let at_20 = session.local_sync_record().expect("tick 20 audited");
    assert_eq!(at_20.tick, Tick::new(20));
    peer.send(&sync_data(20, !at_20.checksum));

    let err = session.update().unwrap_err();
    assert_eq!(
        err,
        NetplayError::Desynced {
            tick: Tick::new(20),
            local_checksum: at_20.checksum,
            remote_checksum: !at_20.checksum,
        }
    );
    assert!(session.is_desynced());

    let tick = session.current_tick();
    for _ in 0..5 {
        peer.send(&idle_input(tick.as_i64(), 5));
        assert_eq!(session.update().unwrap_err(), err);
    }
    assert_eq!(session.current_tick(), tick);

    let desyncs: Vec<_> = session
        .events()
        .filter(|e| matches!(e, NetplayEvent::DesyncDetected { .. }))
        .collect();
    assert_eq!(
        desyncs,
        vec![NetplayEvent::DesyncDetected {
            tick: Tick::new(20),
            local_checksum: at_20.checksum,
            remote_checksum: !at_20.checksum,
        }]
    );
    Ok(())
}

#[test]
fn test_mismatch_is_ignored_with_detection_off() -> Result<(), NetplayError> {
    let config = NetplayConfig {
        desync_detection: DesyncDetection::Off,
        ..NetplayConfig::default()
    };
    let (mut session, mut peer) = connected_session(config);
    run_just_in_time(&mut session, &mut peer, 0..11)?;
    assert!(session.local_sync_record().is_none());

    peer.send(&sync_data(10, 0xdead_beef));
    run_just_in_time(&mut session, &mut peer, 11..15)?;
    assert!(!session.is_desynced());

    let sent = peer.receive_all_messages();
    assert!(sent
        .iter()
        .all(|bytes| !matches!(decode_packet(bytes), Ok(Packet::SyncData(_)))));
    Ok(())
}

#[test]
fn test_sync_data_is_sent_redundantly() -> Result<(), NetplayError> {
    let config = NetplayConfig {
        sync_data_redundancy: 3,
        ..NetplayConfig::default()
    };
    let (mut session, mut peer) = connected_session(config);
    run_just_in_time(&mut session, &mut peer, 0..25)?;

    let records: Vec<_> = peer
        .receive_all_messages()
        .iter()
        .filter_map(|bytes| match decode_packet(bytes) {
            Ok(Packet::SyncData(record)) => Some(record.tick.as_i64()),
            _ => None,
        })
        .collect();
    assert_eq!(records, vec![0, 0, 0, 10, 10, 10, 20, 20, 20]);
    Ok(())
}

#[test]
fn test_backpressure_caps_the_lead_over_confirmed_input() -> Result<(), NetplayError> {
    let (mut session, _peer) = connected_session(NetplayConfig::default());
    let mut throttled = 0;
    for _ in 0..20 {
        let report = session.update()?;
        if report.throttled {
            assert!(!report.advanced);
            throttled += 1;
        }
    }
    // confirmed stays at 0, so ticks 0..=10 are the most that may run
    assert_eq!(session.confirmed_tick(), Tick::new(0));
    assert_eq!(session.current_tick(), Tick::new(11));
    assert_eq!(throttled, 9);
    Ok(())
}

#[test]
fn test_outgoing_inputs_are_delayed_and_oldest_first() -> Result<(), NetplayError> {
    let (mut session, mut peer) = connected_session(NetplayConfig::default());
    run_just_in_time(&mut session, &mut peer, 0..8)?;

    let last_input = peer
        .receive_all_messages()
        .iter()
        .filter_map(|bytes| match decode_packet(bytes) {
            Ok(Packet::PlayerInput(input)) => Some(input),
            _ => None,
        })
        .last()
        .expect("inputs were sent");

    // tick 7 was the last one simulated, its poll landed at 7 + 5
    assert_eq!(last_input.received_tick, Tick::new(12));
    let expected: Vec<_> = (3..8)
        .map(|poll| EncodedInput::encode(&tapping(poll)))
        .collect();
    assert_eq!(last_input.inputs.to_vec(), expected);
    Ok(())
}

#[test]
fn test_a_peer_running_behind_makes_this_side_stall() -> Result<(), NetplayError> {
    let (mut session, mut peer) = connected_session(NetplayConfig::default());
    let mut stalls = 0;
    let updates = 12;
    for _ in 0..updates {
        let received = session.current_tick().as_i64() + 5;
        peer.send(&input_window(received, -9, &[EncodedInput::NONE; 5]));
        let report = session.update()?;
        if report.stalled {
            assert!(!report.advanced);
            stalls += 1;
        }
    }
    assert!(stalls >= 2, "only {stalls} stalls");
    assert_eq!(session.current_tick().as_i64(), updates - stalls);
    Ok(())
}

#[test]
fn test_input_gap_and_stale_windows() -> Result<(), NetplayError> {
    let observer = Arc::new(CollectingObserver::new());
    let (socket, mut peer) = MemorySocket::pair();
    let mut session = SessionBuilder::new()
        .with_violation_observer(observer.clone())
        .start_p2p_session(socket, GameStub::new(tapping))?;

    peer.send(&idle_input(4, 5));
    let _ = session.update()?;
    peer.send(&idle_input(30, 5));
    let _ = session.update()?;
    peer.send(&idle_input(12, 5));
    let _ = session.update()?;

    assert_eq!(session.confirmed_tick(), Tick::new(30));
    assert_eq!(session.network_stats().stale_inputs, 1);
    let gaps = observer.violations_of_kind(ViolationKind::InputHistory);
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].tick, Some(Tick::new(26)));
    assert_eq!(gaps[0].context.get("missing").map(String::as_str), Some("21"));
    Ok(())
}

#[test]
fn test_input_window_before_tick_zero_is_dropped() -> Result<(), NetplayError> {
    let (mut session, mut peer) = connected_session(NetplayConfig::default());
    let _ = session.update()?;
    let _ = session.update()?;
    assert!(session.current_tick().as_i64() >= 1);

    peer.send(&input_window(i64::MIN, 0, &[EncodedInput::NONE; 5]));
    peer.send(&input_window(-3, 0, &[EncodedInput::NONE; 5]));
    let _ = session.update()?;
    assert_eq!(session.network_stats().malformed_packets, 2);
    assert_eq!(session.confirmed_tick(), Tick::new(0));

    let start = session.current_tick().as_i64();
    run_just_in_time(&mut session, &mut peer, start..start + 5)?;
    Ok(())
}

#[test]
fn test_input_window_beyond_the_history_is_dropped() -> Result<(), NetplayError> {
    let observer = Arc::new(CollectingObserver::new());
    let (socket, mut peer) = MemorySocket::pair();
    let mut session = SessionBuilder::new()
        .with_violation_observer(observer.clone())
        .start_p2p_session(socket, GameStub::new(tapping))?;
    peer.send(&handshake());
    run_just_in_time(&mut session, &mut peer, 0..3)?;

    peer.send(&idle_input(1_000_000, 5));
    // every later window still confirms its own tick
    run_just_in_time(&mut session, &mut peer, 3..40)?;

    assert_eq!(session.confirmed_tick(), Tick::new(39));
    assert_eq!(session.network_stats().stale_inputs, 0);
    assert_eq!(session.network_stats().malformed_packets, 1);
    let dropped = observer.violations_of_kind(ViolationKind::TickSync);
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].tick, Some(Tick::new(1_000_000)));
    Ok(())
}
