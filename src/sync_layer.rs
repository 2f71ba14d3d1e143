use tracing::trace;

use crate::input::EncodedInput;
use crate::input_history::{InputHistory, InputWindow, RemoteInputHistory, RemoteInputUpdate};
use crate::network::messages::PlayerInput;
use crate::sessions::config::NetplayConfig;
use crate::{InputStatus, NetplayError, Port, Simulation, Tick};

/// The single retained restore point: the serialized state right after `tick` was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    state: Vec<u8>,
    tick: Tick,
}

impl Snapshot {
    /// A snapshot holding nothing, taken at no tick.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            state: Vec::new(),
            tick: Tick::NULL,
        }
    }

    /// The last tick applied to the captured state.
    #[must_use]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// The serialized state.
    #[must_use]
    pub fn state(&self) -> &[u8] {
        &self.state
    }

    /// Whether there is nothing to restore.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

/// Result of a rollback check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// No newly confirmed input touches a predicted tick.
    NotNeeded,
    /// The snapshot was restored and `ticks` steps were replayed.
    Replayed {
        /// Number of replayed steps.
        ticks: usize,
    },
    /// A correction was due but the snapshot was empty; nothing changed.
    EmptySnapshot,
}

/// The rollback engine: tick cursors, both input histories and the snapshot.
///
/// `local_tick` is the next tick to simulate. `last_synced_tick` is the newest tick whose
/// state was computed from confirmed remote input only; the snapshot holds the state right
/// after it. Everything in `(last_synced_tick, local_tick)` was simulated with at least one
/// predicted remote input and is replayed once newer remote input arrives.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
#[derive(Debug, Clone)]
pub struct SyncLayer {
    input_delay: i64,
    rollback_max_frames: i64,
    send_history_size: usize,
    local_port: Port,
    remote_port: Port,
    /// The next tick to be simulated.
    local_tick: Tick,
    /// The newest tick simulated entirely from confirmed input. Never exceeds `local_tick`.
    last_synced_tick: Tick,
    snapshot: Snapshot,
    local_history: InputHistory,
    remote_history: RemoteInputHistory,
    last_remote_status: Option<InputStatus>,
}

impl SyncLayer {
    /// Creates an engine at tick 0. `config` is expected to be validated.
    #[must_use]
    pub fn new(config: &NetplayConfig, local_port: Port, remote_port: Port) -> Self {
        Self {
            input_delay: config.input_delay_frames as i64,
            rollback_max_frames: config.rollback_max_frames as i64,
            send_history_size: config.send_history_size,
            local_port,
            remote_port,
            local_tick: Tick::new(0),
            last_synced_tick: Tick::NULL,
            snapshot: Snapshot::empty(),
            local_history: InputHistory::new(config.history_size),
            remote_history: RemoteInputHistory::new(config.history_size),
            last_remote_status: None,
        }
    }

    /// The next tick to be simulated.
    #[must_use]
    pub fn local_tick(&self) -> Tick {
        self.local_tick
    }

    /// Highest tick for which the peer's real input has been received.
    #[must_use]
    pub fn confirmed_tick(&self) -> Tick {
        self.remote_history.confirmed_tick()
    }

    /// The newest tick simulated from confirmed input only.
    #[must_use]
    pub fn last_synced_tick(&self) -> Tick {
        self.last_synced_tick
    }

    /// The retained restore point.
    #[must_use]
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// The peer's last reported `local tick - confirmed tick`.
    #[must_use]
    pub fn remote_tick_delta(&self) -> i32 {
        self.remote_history.remote_tick_delta()
    }

    /// Whether the remote input of the most recent step was real or predicted.
    #[must_use]
    pub fn last_remote_status(&self) -> Option<InputStatus> {
        self.last_remote_status
    }

    /// The local input recorded for `tick`.
    #[must_use]
    pub fn local_input(&self, tick: Tick) -> EncodedInput {
        self.local_history.get(tick)
    }

    /// The remote input `tick` is (or would be) simulated with.
    #[must_use]
    pub fn remote_input(&self, tick: Tick) -> (EncodedInput, InputStatus) {
        self.remote_history.input(tick)
    }

    /// Whether the backpressure ceiling still allows simulating `local_tick`.
    #[must_use]
    pub fn within_prediction_window(&self) -> bool {
        self.local_tick.distance_from(self.confirmed_tick()) <= self.rollback_max_frames
    }

    /// Whether newly confirmed input covers ticks that were simulated with predictions.
    #[must_use]
    pub fn needs_rollback(&self) -> bool {
        let last_game_tick = self.local_tick - 1;
        last_game_tick.is_valid()
            && last_game_tick > self.last_synced_tick + 1
            && self.confirmed_tick() > self.last_synced_tick
    }

    /// Stores a received input window.
    pub fn add_remote_input(&mut self, input: &PlayerInput) -> RemoteInputUpdate {
        self.remote_history
            .add_window(input.tick_delta, input.received_tick, &input.inputs)
    }

    /// Builds the input packet for the newest local input, which belongs to
    /// `local_tick - 1 + input_delay`.
    #[must_use]
    pub fn outgoing_input(&self, tick_delta: i32) -> PlayerInput {
        let received_tick = self.local_tick - 1 + self.input_delay;
        let inputs: InputWindow = self
            .local_history
            .window(received_tick, self.send_history_size);
        PlayerInput {
            tick_delta,
            received_tick,
            inputs,
        }
    }

    /// Restores the snapshot and replays every tick up to the last simulated one if a
    /// correction is due.
    ///
    /// `on_synced` is called with each tick that becomes synced during the replay and the
    /// freshly captured state.
    pub fn rollback<S, F>(
        &mut self,
        simulation: &mut S,
        mut on_synced: F,
    ) -> Result<RollbackOutcome, NetplayError>
    where
        S: Simulation + ?Sized,
        F: FnMut(Tick, &[u8]),
    {
        if !self.needs_rollback() {
            return Ok(RollbackOutcome::NotNeeded);
        }
        if self.snapshot.is_empty() {
            return Ok(RollbackOutcome::EmptySnapshot);
        }

        let last_game_tick = self.local_tick - 1;
        let ticks = last_game_tick.distance_from(self.last_synced_tick) as usize;
        trace!(
            "rolling back from {} to {} ({} ticks)",
            last_game_tick,
            self.snapshot.tick,
            ticks
        );

        simulation.deserialize(&self.snapshot.state)?;
        self.local_tick = self.snapshot.tick + 1;

        for _ in 0..ticks {
            let tick = self.local_tick;
            self.apply_inputs(simulation, tick);
            simulation.step();
            self.local_tick += 1;
            if tick <= self.confirmed_tick() {
                self.save_snapshot(simulation, tick, &mut on_synced)?;
            }
        }
        Ok(RollbackOutcome::Replayed { ticks })
    }

    /// Runs the live step: records fresh local input `input_delay` ticks ahead, simulates
    /// `local_tick` and snapshots it if its remote input was confirmed.
    pub fn advance<S, F>(&mut self, simulation: &mut S, mut on_synced: F) -> Result<(), NetplayError>
    where
        S: Simulation + ?Sized,
        F: FnMut(Tick, &[u8]),
    {
        let tick = self.local_tick;

        simulation.poll_local_input();
        let polled = simulation.input_state(self.local_port);
        self.local_history
            .set(tick + self.input_delay, EncodedInput::encode(&polled));

        self.apply_inputs(simulation, tick);
        simulation.step();
        self.local_tick += 1;

        if self.last_synced_tick + 1 == tick && tick <= self.confirmed_tick() {
            self.save_snapshot(simulation, tick, &mut on_synced)?;
        }
        Ok(())
    }

    fn apply_inputs<S: Simulation + ?Sized>(&mut self, simulation: &mut S, tick: Tick) {
        let local = self.local_history.get(tick);
        let (remote, status) = self.remote_history.input(tick);
        simulation.set_input_state(self.local_port, local.decode());
        simulation.set_input_state(self.remote_port, remote.decode());
        self.last_remote_status = Some(status);
    }

    fn save_snapshot<S, F>(
        &mut self,
        simulation: &S,
        tick: Tick,
        on_synced: &mut F,
    ) -> Result<(), NetplayError>
    where
        S: Simulation + ?Sized,
        F: FnMut(Tick, &[u8]),
    {
        self.snapshot = Snapshot {
            state: simulation.serialize()?,
            tick,
        };
        self.last_synced_tick = tick;
        on_synced(tick, &self.snapshot.state);
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::input::PlayerState;
    use crate::Button;

    /// Folds every applied input into an accumulator so that any difference in the
    /// input sequence shows up in the serialized state.
    #[derive(Debug, Default)]
    struct Counter {
        polled: PlayerState,
        inputs: [PlayerState; 2],
        steps: u64,
        value: u64,
    }

    impl Simulation for Counter {
        fn poll_local_input(&mut self) {}

        fn input_state(&self, _port: Port) -> PlayerState {
            self.polled
        }

        fn set_input_state(&mut self, port: Port, state: PlayerState) {
            self.inputs[port.as_usize()] = state;
        }

        fn step(&mut self) {
            let a = u64::from(EncodedInput::encode(&self.inputs[0]).bits());
            let b = u64::from(EncodedInput::encode(&self.inputs[1]).bits());
            self.value = self.value.wrapping_mul(31).wrapping_add(a * 7 + b * 13 + 1);
            self.steps += 1;
        }

        fn serialize(&self) -> Result<Vec<u8>, NetplayError> {
            let mut bytes = self.steps.to_le_bytes().to_vec();
            bytes.extend_from_slice(&self.value.to_le_bytes());
            Ok(bytes)
        }

        fn deserialize(&mut self, state: &[u8]) -> Result<(), NetplayError> {
            let steps: [u8; 8] = state[..8].try_into().unwrap();
            let value: [u8; 8] = state[8..16].try_into().unwrap();
            self.steps = u64::from_le_bytes(steps);
            self.value = u64::from_le_bytes(value);
            Ok(())
        }
    }

    fn layer() -> SyncLayer {
        SyncLayer::new(&NetplayConfig::default(), Port::new(0), Port::new(1))
    }

    fn window_of(received_tick: i64, bits: &[u32]) -> PlayerInput {
        PlayerInput {
            tick_delta: 0,
            received_tick: Tick::new(received_tick),
            inputs: bits.iter().copied().map(EncodedInput::from_bits).collect(),
        }
    }

    fn window(received_tick: i64, bits: u32) -> PlayerInput {
        window_of(received_tick, &[bits; 5])
    }

    #[test]
    fn first_step_is_synced_and_snapshotted() {
        let mut layer = layer();
        let mut sim = Counter::default();
        let mut synced = Vec::new();
        layer.advance(&mut sim, |t, _| synced.push(t)).unwrap();
        assert_eq!(layer.local_tick(), Tick::new(1));
        assert_eq!(layer.last_synced_tick(), Tick::new(0));
        assert_eq!(layer.snapshot().tick(), Tick::new(0));
        assert_eq!(synced, vec![Tick::new(0)]);
    }

    #[test]
    fn local_input_is_stored_with_delay() {
        let mut layer = layer();
        let mut sim = Counter::default();
        sim.polled.press(Button::A);
        layer.advance(&mut sim, |_, _| {}).unwrap();
        assert_eq!(layer.local_input(Tick::new(5)).decode(), sim.polled);
        assert_eq!(layer.local_input(Tick::new(0)), EncodedInput::NONE);
        // the step itself used the empty input stored for tick 0
        assert_eq!(sim.inputs[0], PlayerState::default());
    }

    #[test]
    fn outgoing_input_ends_at_delayed_tick() {
        let mut layer = layer();
        let mut sim = Counter::default();
        sim.polled.press(Button::B);
        layer.advance(&mut sim, |_, _| {}).unwrap();
        let packet = layer.outgoing_input(3);
        assert_eq!(packet.received_tick, Tick::new(5));
        assert_eq!(packet.tick_delta, 3);
        assert_eq!(packet.inputs.len(), 5);
        assert_eq!(packet.inputs[4].bits(), 1);
        assert_eq!(packet.inputs[0].bits(), 0);
    }

    #[test]
    fn predicted_ticks_are_not_synced() {
        let mut layer = layer();
        let mut sim = Counter::default();
        for _ in 0..4 {
            layer.advance(&mut sim, |_, _| {}).unwrap();
        }
        assert_eq!(layer.local_tick(), Tick::new(4));
        assert_eq!(layer.last_synced_tick(), Tick::new(0));
        assert_eq!(layer.last_remote_status(), Some(InputStatus::Predicted));
    }

    #[test]
    fn late_input_replays_exactly_the_predicted_ticks() {
        let mut layer = layer();
        let mut sim = Counter::default();
        for _ in 0..4 {
            layer.advance(&mut sim, |_, _| {}).unwrap();
        }
        // ticks 1..=3 were predicted; input for them arrives late
        layer.add_remote_input(&window(3, 0));
        assert!(layer.needs_rollback());

        let mut synced = Vec::new();
        let outcome = layer.rollback(&mut sim, |t, _| synced.push(t)).unwrap();
        assert_eq!(outcome, RollbackOutcome::Replayed { ticks: 3 });
        assert_eq!(layer.last_synced_tick(), Tick::new(3));
        assert_eq!(layer.local_tick(), Tick::new(4));
        assert_eq!(synced, vec![Tick::new(1), Tick::new(2), Tick::new(3)]);
        assert_eq!(sim.steps, 4);
    }

    #[test]
    fn replay_matches_an_online_run_with_the_real_inputs() {
        let early = window_of(4, &[0x21; 5]);
        let late = window_of(8, &[0x21, 0x05, 0x05, 0x05, 0x05]);

        // online: every remote input known before it is simulated
        let mut online_layer = layer();
        let mut online = Counter::default();
        online_layer.add_remote_input(&early);
        online_layer.add_remote_input(&late);
        for _ in 0..8 {
            online_layer.advance(&mut online, |_, _| {}).unwrap();
        }

        // rollback: ticks 5..=7 are first predicted with 0x21, then corrected
        let mut rollback_layer = layer();
        let mut rolled = Counter::default();
        rollback_layer.add_remote_input(&early);
        for _ in 0..8 {
            rollback_layer.advance(&mut rolled, |_, _| {}).unwrap();
        }
        assert_eq!(rollback_layer.last_synced_tick(), Tick::new(4));
        assert_ne!(rolled.serialize().unwrap(), online.serialize().unwrap());

        rollback_layer.add_remote_input(&late);
        let outcome = rollback_layer.rollback(&mut rolled, |_, _| {}).unwrap();
        assert_eq!(outcome, RollbackOutcome::Replayed { ticks: 3 });
        assert_eq!(rolled.serialize().unwrap(), online.serialize().unwrap());
        assert_eq!(rollback_layer.last_synced_tick(), Tick::new(7));
    }

    #[test]
    fn single_predicted_tick_waits_for_the_next_update() {
        let mut layer = layer();
        let mut sim = Counter::default();
        layer.advance(&mut sim, |_, _| {}).unwrap();
        layer.advance(&mut sim, |_, _| {}).unwrap();
        layer.add_remote_input(&window(6, 0));
        // last game tick 1 is only one past the synced tick
        assert!(!layer.needs_rollback());
        layer.advance(&mut sim, |_, _| {}).unwrap();
        assert!(layer.needs_rollback());
    }

    #[test]
    fn no_rollback_without_new_confirmation() {
        let mut layer = layer();
        let mut sim = Counter::default();
        for _ in 0..6 {
            layer.advance(&mut sim, |_, _| {}).unwrap();
        }
        assert!(!layer.needs_rollback());
        assert_eq!(
            layer.rollback(&mut sim, |_, _| {}).unwrap(),
            RollbackOutcome::NotNeeded
        );
    }

    #[test]
    fn empty_snapshot_skips_the_correction() {
        #[derive(Default)]
        struct Stateless(Counter);

        impl Simulation for Stateless {
            fn poll_local_input(&mut self) {}
            fn input_state(&self, port: Port) -> PlayerState {
                self.0.input_state(port)
            }
            fn set_input_state(&mut self, port: Port, state: PlayerState) {
                self.0.set_input_state(port, state);
            }
            fn step(&mut self) {
                self.0.step();
            }
            fn serialize(&self) -> Result<Vec<u8>, NetplayError> {
                Ok(Vec::new())
            }
            fn deserialize(&mut self, _state: &[u8]) -> Result<(), NetplayError> {
                panic!("an empty snapshot must never be restored");
            }
        }

        let mut layer = layer();
        let mut sim = Stateless::default();
        for _ in 0..4 {
            layer.advance(&mut sim, |_, _| {}).unwrap();
        }
        layer.add_remote_input(&window(3, 0));
        assert_eq!(
            layer.rollback(&mut sim, |_, _| {}).unwrap(),
            RollbackOutcome::EmptySnapshot
        );
        assert_eq!(layer.local_tick(), Tick::new(4));
        assert_eq!(layer.last_synced_tick(), Tick::new(0));
    }

    #[test]
    fn prediction_window_closes_after_rollback_max_frames() {
        let mut layer = layer();
        let mut sim = Counter::default();
        let mut steps = 0;
        while layer.within_prediction_window() {
            layer.advance(&mut sim, |_, _| {}).unwrap();
            steps += 1;
        }
        // confirmed tick is 0, ticks 0..=10 may be simulated
        assert_eq!(steps, 11);
        assert_eq!(layer.local_tick(), Tick::new(11));
        layer.add_remote_input(&window(4, 0));
        assert!(layer.within_prediction_window());
    }
}
