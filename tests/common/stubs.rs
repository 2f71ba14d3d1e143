//! Game stubs for integration tests.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::use_self,
    clippy::derive_partial_eq_without_eq
)]

use std::collections::BTreeMap;

use netplay_rollback::network::codec;
use netplay_rollback::{Button, EncodedInput, NetplayError, PlayerState, Port, Simulation};
use serde::{Deserialize, Serialize};

/// Local input as a function of how often the stub has been polled.
pub type Script = fn(i64) -> PlayerState;

/// Never presses anything.
#[allow(dead_code)]
#[must_use]
pub fn idle(_poll: i64) -> PlayerState {
    PlayerState::default()
}

/// Holds A for three polls, releases it for four. Keeps predictions wrong often.
#[allow(dead_code)]
#[must_use]
pub fn tapping(poll: i64) -> PlayerState {
    let mut state = PlayerState::default();
    state.set(Button::A, poll % 7 < 3);
    state
}

/// Walks through the buttons, one per poll, with a direction held every other poll.
#[allow(dead_code)]
#[must_use]
pub fn mashing(poll: i64) -> PlayerState {
    let mut state = PlayerState::default();
    state.press(Button::ALL[poll.rem_euclid(Button::ALL.len() as i64) as usize]);
    state.set(Button::Right, poll % 2 == 0);
    state
}

/// The serialized part of [`GameStub`]. Every applied input is folded into `value`, so any
/// difference in the input sequence changes the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateStub {
    pub tick: i64,
    pub value: u64,
    pub presses: [u32; 2],
}

impl StateStub {
    fn step(&mut self, inputs: &[PlayerState; 2]) {
        for (port, input) in inputs.iter().enumerate() {
            let bits = u64::from(EncodedInput::encode(input).bits());
            self.value = self
                .value
                .wrapping_mul(1_000_003)
                .wrapping_add(bits + port as u64 + 1);
            self.presses[port] += input.pressed().count() as u32;
        }
        self.tick += 1;
    }
}

pub struct GameStub {
    pub gs: StateStub,
    inputs: [PlayerState; 2],
    polled: PlayerState,
    polls: i64,
    script: Script,
    /// State after each simulated tick. Replays overwrite mispredicted entries.
    pub history: BTreeMap<i64, StateStub>,
    pub steps: u64,
    pub loads: u64,
}

impl Default for GameStub {
    fn default() -> Self {
        Self::new(idle)
    }
}

impl GameStub {
    #[must_use]
    pub fn new(script: Script) -> GameStub {
        GameStub {
            gs: StateStub::default(),
            inputs: [PlayerState::default(); 2],
            polled: PlayerState::default(),
            polls: 0,
            script,
            history: BTreeMap::new(),
            steps: 0,
            loads: 0,
        }
    }

    /// State right after `tick` was simulated, as last computed.
    #[allow(dead_code)]
    #[must_use]
    pub fn state_at(&self, tick: i64) -> Option<StateStub> {
        self.history.get(&tick).copied()
    }
}

impl Simulation for GameStub {
    fn poll_local_input(&mut self) {
        self.polled = (self.script)(self.polls);
        self.polls += 1;
    }

    fn input_state(&self, _port: Port) -> PlayerState {
        self.polled
    }

    fn set_input_state(&mut self, port: Port, state: PlayerState) {
        self.inputs[port.as_usize()] = state;
    }

    fn step(&mut self) {
        let tick = self.gs.tick;
        self.gs.step(&self.inputs);
        self.history.insert(tick, self.gs);
        self.steps += 1;
    }

    fn serialize(&self) -> Result<Vec<u8>, NetplayError> {
        Ok(codec::encode(&self.gs)?)
    }

    fn deserialize(&mut self, state: &[u8]) -> Result<(), NetplayError> {
        self.gs = codec::decode_value(state)?;
        self.loads += 1;
        Ok(())
    }
}
