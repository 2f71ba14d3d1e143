//! Shared helpers for driving sessions in integration tests.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use netplay_rollback::network::codec::encode_packet;
use netplay_rollback::{
    EncodedInput, MemorySocket, NetplayConfig, NetplayError, NonBlockingSocket, P2PSession,
    Packet, PlayerInput, Port, SessionBuilder, SyncRecord, Tick,
};

use super::stubs::{GameStub, Script};

/// Upper bound on update rounds before a test gives up.
pub const MAX_ITERATIONS: usize = 2_000;

/// Routes `tracing` output to the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Localhost address for the given port.
#[must_use]
pub fn test_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Starts a session on port 0 over `socket` (the "A" side).
pub fn start_a<N: NonBlockingSocket + 'static>(
    config: NetplayConfig,
    socket: N,
    script: Script,
) -> P2PSession<GameStub> {
    SessionBuilder::new()
        .with_config(config)
        .start_p2p_session(socket, GameStub::new(script))
        .unwrap()
}

/// Starts a session on port 1 over `socket` (the "B" side).
pub fn start_b<N: NonBlockingSocket + 'static>(
    config: NetplayConfig,
    socket: N,
    script: Script,
) -> P2PSession<GameStub> {
    SessionBuilder::new()
        .with_config(config)
        .with_local_port(Port::new(1))
        .with_remote_port(Port::new(0))
        .start_p2p_session(socket, GameStub::new(script))
        .unwrap()
}

/// Two sessions joined by a lossless in-memory link.
pub fn loopback_pair(
    config: NetplayConfig,
    script_a: Script,
    script_b: Script,
) -> (P2PSession<GameStub>, P2PSession<GameStub>) {
    let (socket_a, socket_b) = MemorySocket::pair();
    (
        start_a(config, socket_a, script_a),
        start_b(config, socket_b, script_b),
    )
}

/// Updates both sessions in turn until both have simulated past `target`.
///
/// Returns the number of rounds.
pub fn run_until_tick(
    a: &mut P2PSession<GameStub>,
    b: &mut P2PSession<GameStub>,
    target: i64,
) -> Result<usize, NetplayError> {
    let mut rounds = 0;
    while a.current_tick() <= target || b.current_tick() <= target {
        assert!(
            rounds < MAX_ITERATIONS,
            "sessions stuck at ticks {} and {}",
            a.current_tick(),
            b.current_tick()
        );
        let _ = a.update()?;
        let _ = b.update()?;
        rounds += 1;
    }
    Ok(rounds)
}

/// Updates both sessions for `rounds` more rounds.
pub fn run_rounds(
    a: &mut P2PSession<GameStub>,
    b: &mut P2PSession<GameStub>,
    rounds: usize,
) -> Result<(), NetplayError> {
    for _ in 0..rounds {
        let _ = a.update()?;
        let _ = b.update()?;
    }
    Ok(())
}

/// An input packet from a scripted peer: `count` idle inputs ending at `received_tick`.
#[must_use]
pub fn idle_input(received_tick: i64, count: usize) -> Vec<u8> {
    input_window(received_tick, 0, &vec![EncodedInput::NONE; count])
}

/// An input packet carrying `inputs` (oldest first) ending at `received_tick`.
#[must_use]
pub fn input_window(received_tick: i64, tick_delta: i32, inputs: &[EncodedInput]) -> Vec<u8> {
    encode_packet(&Packet::PlayerInput(PlayerInput {
        tick_delta,
        received_tick: Tick::new(received_tick),
        inputs: inputs.iter().copied().collect(),
    }))
}

#[must_use]
pub fn handshake() -> Vec<u8> {
    encode_packet(&Packet::Handshake)
}

#[must_use]
pub fn sync_data(tick: i64, checksum: u32) -> Vec<u8> {
    encode_packet(&Packet::SyncData(SyncRecord::new(Tick::new(tick), checksum)))
}
