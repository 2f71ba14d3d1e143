//! Sessions over a [`ChaosSocket`] still agree on every synced state.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::stubs::{mashing, tapping, GameStub};
use crate::common::{run_until_tick, start_a, start_b};
use netplay_rollback::{
    ChaosConfig, ChaosSocket, MemorySocket, NetplayConfig, NetplayError, P2PSession,
    SessionState,
};

fn chaos_pair(
    config_a: ChaosConfig,
    config_b: ChaosConfig,
) -> (P2PSession<GameStub>, P2PSession<GameStub>) {
    let (socket_a, socket_b) = MemorySocket::pair();
    let config = NetplayConfig::default();
    (
        start_a(config, ChaosSocket::new(socket_a, config_a), tapping),
        start_b(config, ChaosSocket::new(socket_b, config_b), mashing),
    )
}

fn assert_converged(a: &P2PSession<GameStub>, b: &P2PSession<GameStub>, at_least: i64) {
    assert!(!a.is_desynced());
    assert!(!b.is_desynced());
    let synced = a
        .last_synced_tick()
        .as_i64()
        .min(b.last_synced_tick().as_i64());
    assert!(synced >= at_least, "only synced through {synced}");
    for tick in 0..=synced {
        assert_eq!(
            a.simulation().state_at(tick),
            b.simulation().state_at(tick),
            "states differ at tick {tick}"
        );
    }
}

#[test]
fn test_latency_forces_rollbacks_but_converges() -> Result<(), NetplayError> {
    let latency = ChaosConfig::builder().delay_polls(7).seed(1).build();
    let (mut a, mut b) = chaos_pair(latency.clone(), latency);
    run_until_tick(&mut a, &mut b, 200)?;

    assert_eq!(a.current_state(), SessionState::Connected);
    // one-way latency beyond the input delay means predictions get corrected
    assert!(a.simulation().loads > 0);
    assert!(b.simulation().loads > 0);
    assert_converged(&a, &b, 150);
    Ok(())
}

#[test]
fn test_duplication_and_reordering_converge() -> Result<(), NetplayError> {
    let config_a = ChaosConfig::builder()
        .delay_polls(2)
        .jitter_polls(3)
        .duplication_rate(0.2)
        .reorder_rate(0.3)
        .seed(7)
        .build();
    let config_b = ChaosConfig::builder()
        .delay_polls(2)
        .jitter_polls(3)
        .duplication_rate(0.2)
        .reorder_rate(0.3)
        .seed(8)
        .build();
    let (mut a, mut b) = chaos_pair(config_a, config_b);
    run_until_tick(&mut a, &mut b, 300)?;

    assert_converged(&a, &b, 250);
    Ok(())
}

#[test]
fn test_light_packet_loss_converges() -> Result<(), NetplayError> {
    let config_a = ChaosConfig::builder()
        .delay_polls(1)
        .send_loss_rate(0.05)
        .seed(42)
        .build();
    let config_b = ChaosConfig::builder()
        .delay_polls(1)
        .send_loss_rate(0.05)
        .seed(43)
        .build();
    let (mut a, mut b) = chaos_pair(config_a, config_b);
    run_until_tick(&mut a, &mut b, 300)?;
    assert_converged(&a, &b, 250);
    Ok(())
}
