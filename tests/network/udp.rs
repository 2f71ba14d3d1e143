//! Two sessions exchanging real UDP datagrams on localhost.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::stubs::{mashing, tapping};
use crate::common::{start_a, start_b, test_addr, MAX_ITERATIONS};
use netplay_rollback::{NetplayConfig, NetplayError, SessionState, UdpNonBlockingSocket};
use serial_test::serial;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Binds an ephemeral port; the peer is filled in once both ports are known.
fn ephemeral_socket() -> (UdpNonBlockingSocket, u16) {
    let socket = UdpNonBlockingSocket::bind_to_port(0, test_addr(0)).unwrap();
    let port = socket.local_addr().unwrap().port();
    (socket, port)
}

#[test]
#[serial]
#[cfg_attr(miri, ignore)]
fn test_udp_sessions_stay_in_sync() -> Result<(), NetplayError> {
    let (mut socket_a, port_a) = ephemeral_socket();
    let (mut socket_b, port_b) = ephemeral_socket();
    socket_a.set_peer(test_addr(port_b));
    socket_b.set_peer(test_addr(port_a));

    let config = NetplayConfig::default();
    let mut a = start_a(config, socket_a, tapping);
    let mut b = start_b(config, socket_b, mashing);

    let mut iterations = 0;
    while a.current_tick().as_i64() < 60 || b.current_tick().as_i64() < 60 {
        assert!(iterations < MAX_ITERATIONS, "UDP sessions made no progress");
        let _ = a.update()?;
        let _ = b.update()?;
        std::thread::sleep(POLL_INTERVAL);
        iterations += 1;
    }

    assert_eq!(a.current_state(), SessionState::Connected);
    assert_eq!(b.current_state(), SessionState::Connected);
    assert!(a.network_stats().packets_received > 0);
    assert!(b.network_stats().bytes_received > 0);

    let synced = a
        .last_synced_tick()
        .as_i64()
        .min(b.last_synced_tick().as_i64());
    assert!(synced >= 30);
    for tick in 0..=synced {
        assert_eq!(a.simulation().state_at(tick), b.simulation().state_at(tick));
    }
    Ok(())
}

#[test]
#[serial]
#[cfg_attr(miri, ignore)]
fn test_udp_builder_binds_the_requested_port() -> Result<(), NetplayError> {
    let (probe, port) = ephemeral_socket();
    drop(probe);

    let session = netplay_rollback::SessionBuilder::new().start_p2p_udp_session(
        port,
        test_addr(port.wrapping_add(1)),
        crate::common::stubs::GameStub::default(),
    )?;
    assert_eq!(session.current_state(), SessionState::AwaitingPeer);
    assert_eq!(session.network_stats().packets_sent, 1);
    Ok(())
}
