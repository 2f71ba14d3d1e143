//! Benchmarks for rollback replay and the per-tick session loop.
//!
//! Run with: cargo bench --bench rollback

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use netplay_rollback::__internal::SyncLayer;
use netplay_rollback::{
    Button, EncodedInput, MemorySocket, NetplayConfig, NetplayError, PlayerInput, PlayerState,
    Port, SessionBuilder, Simulation, Tick,
};
use std::hint::black_box;

/// A small state that mixes every input it sees, serialized with a fixed size.
#[derive(Default)]
struct Mixer {
    value: u64,
    positions: [i32; 2],
    inputs: [PlayerState; 2],
    polls: u32,
}

impl Simulation for Mixer {
    fn poll_local_input(&mut self) {
        self.polls += 1;
    }

    fn input_state(&self, _port: Port) -> PlayerState {
        let mut state = PlayerState::default();
        state.set(Button::Right, self.polls % 3 == 0);
        state
    }

    fn set_input_state(&mut self, port: Port, state: PlayerState) {
        self.inputs[port.as_usize()] = state;
    }

    fn step(&mut self) {
        for (position, input) in self.positions.iter_mut().zip(self.inputs.iter()) {
            if input.is_pressed(Button::Right) {
                *position += 1;
            }
            let bits = u64::from(EncodedInput::encode(input).bits());
            self.value = self.value.rotate_left(5) ^ bits;
        }
    }

    fn serialize(&self) -> Result<Vec<u8>, NetplayError> {
        let mut bytes = self.value.to_le_bytes().to_vec();
        for position in self.positions {
            bytes.extend_from_slice(&position.to_le_bytes());
        }
        Ok(bytes)
    }

    fn deserialize(&mut self, state: &[u8]) -> Result<(), NetplayError> {
        let err = || NetplayError::SerializationError {
            context: "mixer state must be 16 bytes".to_owned(),
        };
        let value = state.get(..8).ok_or_else(err)?;
        let first = state.get(8..12).ok_or_else(err)?;
        let second = state.get(12..16).ok_or_else(err)?;
        self.value = u64::from_le_bytes(value.try_into().map_err(|_| err())?);
        self.positions = [
            i32::from_le_bytes(first.try_into().map_err(|_| err())?),
            i32::from_le_bytes(second.try_into().map_err(|_| err())?),
        ];
        Ok(())
    }
}

fn window(received_tick: i64, len: usize) -> PlayerInput {
    PlayerInput {
        tick_delta: 0,
        received_tick: Tick::new(received_tick),
        inputs: std::iter::repeat(EncodedInput::from_bits(0x80))
            .take(len)
            .collect(),
    }
}

/// Synced through tick 0, then `depth` predicted ticks, then the late input arrives.
fn bench_rollback_depth(c: &mut Criterion) {
    let config = NetplayConfig::default();
    let mut group = c.benchmark_group("rollback_replay");
    for depth in [2_i64, 4, 8, 10] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter_batched(
                || {
                    let mut layer = SyncLayer::new(&config, Port::new(0), Port::new(1));
                    let mut sim = Mixer::default();
                    for _ in 0..=depth {
                        layer.advance(&mut sim, |_, _| {}).unwrap();
                    }
                    let _ = layer.add_remote_input(&window(depth, config.send_history_size));
                    (layer, sim)
                },
                |(mut layer, mut sim)| {
                    let outcome = layer.rollback(&mut sim, |_, _| {}).unwrap();
                    black_box(outcome)
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_session_round(c: &mut Criterion) {
    c.bench_function("loopback_session_round", |b| {
        let (socket_a, socket_b) = MemorySocket::pair();
        let mut a = SessionBuilder::new()
            .start_p2p_session(socket_a, Mixer::default())
            .unwrap();
        let mut session_b = SessionBuilder::new()
            .with_local_port(Port::new(1))
            .with_remote_port(Port::new(0))
            .start_p2p_session(socket_b, Mixer::default())
            .unwrap();
        b.iter(|| {
            black_box(a.update().unwrap());
            black_box(session_b.update().unwrap());
        });
    });
}

criterion_group!(benches, bench_rollback_depth, bench_session_round);
criterion_main!(benches);
