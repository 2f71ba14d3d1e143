//! Fuzz target for session configuration and hostile peers.
//!
//! # Properties Tested
//! - `NetplayConfig::validate` never panics
//! - A session started from a valid configuration survives arbitrary inbound datagrams;
//!   the only error it may return is a desync

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use netplay_rollback::{
    DesyncDetection, MemorySocket, NetplayConfig, NetplayError, NonBlockingSocket, PlayerState,
    Port, SessionBuilder, Simulation,
};

#[derive(Debug, Arbitrary)]
struct FuzzConfig {
    input_delay: u8,
    rollback_max: u8,
    history_size: u8,
    send_history_size: u8,
    desync_interval: u8,
    redundancy: u8,
    /// Datagrams delivered before each update.
    rounds: Vec<Vec<Vec<u8>>>,
}

#[derive(Default)]
struct Sum(u64);

impl Simulation for Sum {
    fn poll_local_input(&mut self) {}
    fn input_state(&self, _port: Port) -> PlayerState {
        PlayerState::default()
    }
    fn set_input_state(&mut self, _port: Port, state: PlayerState) {
        self.0 += state.pressed().count() as u64;
    }
    fn step(&mut self) {
        self.0 = self.0.wrapping_mul(3);
    }
    fn serialize(&self) -> Result<Vec<u8>, NetplayError> {
        Ok(self.0.to_le_bytes().to_vec())
    }
    fn deserialize(&mut self, state: &[u8]) -> Result<(), NetplayError> {
        let bytes = state
            .try_into()
            .map_err(|_| NetplayError::SerializationError {
                context: "expected 8 bytes".to_owned(),
            })?;
        self.0 = u64::from_le_bytes(bytes);
        Ok(())
    }
}

fuzz_target!(|input: FuzzConfig| {
    let desync_detection = match input.desync_interval {
        0 => DesyncDetection::Off,
        interval => DesyncDetection::On {
            interval: u32::from(interval),
        },
    };
    let config = NetplayConfig {
        input_delay_frames: usize::from(input.input_delay),
        rollback_max_frames: usize::from(input.rollback_max),
        history_size: usize::from(input.history_size),
        send_history_size: usize::from(input.send_history_size),
        desync_detection,
        sync_data_redundancy: usize::from(input.redundancy),
    };
    if config.validate().is_err() {
        return;
    }

    let (socket, mut peer) = MemorySocket::pair();
    let Ok(mut session) = SessionBuilder::new()
        .with_config(config)
        .start_p2p_session(socket, Sum::default())
    else {
        return;
    };

    for datagrams in input.rounds.iter().take(64) {
        for datagram in datagrams.iter().take(16) {
            peer.send(datagram);
        }
        match session.update() {
            Ok(_) | Err(NetplayError::Desynced { .. }) => {},
            Err(other) => panic!("unexpected error: {other}"),
        }
        let _ = peer.receive_all_messages();
    }
});
