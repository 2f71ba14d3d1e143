//! Circular input histories for both sides of a session.
//!
//! Each side keeps its encoded input in a fixed ring of `history_size` slots; tick *t*
//! lives in slot `t mod history_size`. The local history is written `input_delay_frames`
//! ahead of the tick being simulated and read back unclamped. The remote history is written
//! from received `PlayerInput` windows and read through the prediction policy: any tick past
//! the confirmed tick reads the confirmed tick's input instead.

use smallvec::SmallVec;

use crate::input::EncodedInput;
use crate::{InputStatus, Tick};

/// Inline capacity of an input window before it spills to the heap.
pub const INPUT_WINDOW_INLINE: usize = 8;

/// A run of consecutive inputs, oldest first.
pub type InputWindow = SmallVec<[EncodedInput; INPUT_WINDOW_INLINE]>;

/// A fixed-capacity ring of encoded inputs addressed by tick.
///
/// Reading a tick that was never written returns whatever the slot last held (initially
/// [`EncodedInput::NONE`]). Callers keep the live window of ticks smaller than the capacity
/// so that no slot is read after a newer tick overwrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputHistory {
    inputs: Vec<EncodedInput>,
}

impl InputHistory {
    /// Creates a history of `size` slots, all holding [`EncodedInput::NONE`].
    /// A size of zero is bumped to one.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            inputs: vec![EncodedInput::NONE; size.max(1)],
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inputs.len()
    }

    #[inline]
    fn slot(&self, tick: Tick) -> usize {
        tick.as_i64().rem_euclid(self.inputs.len() as i64) as usize
    }

    /// Stores `input` as the input for `tick`.
    pub fn set(&mut self, tick: Tick, input: EncodedInput) {
        let slot = self.slot(tick);
        self.inputs[slot] = input;
    }

    /// Returns the input stored for `tick`.
    #[must_use]
    pub fn get(&self, tick: Tick) -> EncodedInput {
        self.inputs[self.slot(tick)]
    }

    /// Returns the `count` inputs ending at `last`, oldest first.
    #[must_use]
    pub fn window(&self, last: Tick, count: usize) -> InputWindow {
        let first = last - (count as i64 - 1);
        (0..count as i64).map(|i| self.get(first + i)).collect()
    }
}

/// What a received input window did to the remote history.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RemoteInputUpdate {
    /// The window ends before the confirmed tick; nothing changed.
    Stale,
    /// The window ends exactly at the confirmed tick; only the peer's tick delta was refreshed.
    Refreshed,
    /// The confirmed tick moved forward.
    Confirmed {
        /// The confirmed tick before this window.
        previous: Tick,
        /// Ticks between `previous` and the window's first tick that no window covered.
        /// Their slots still hold older data.
        missing: i64,
    },
}

/// The remote side's history together with its confirmed tick.
#[derive(Debug, Clone)]
pub struct RemoteInputHistory {
    history: InputHistory,
    confirmed_tick: Tick,
    remote_tick_delta: i32,
}

impl RemoteInputHistory {
    /// Creates an empty remote history. Tick 0 counts as confirmed: the first
    /// `input_delay_frames` ticks carry no input on either side.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            history: InputHistory::new(size),
            confirmed_tick: Tick::new(0),
            remote_tick_delta: 0,
        }
    }

    /// Highest tick for which the peer's real input has been received.
    #[must_use]
    pub fn confirmed_tick(&self) -> Tick {
        self.confirmed_tick
    }

    /// The peer's `local tick - confirmed tick` as of its newest window.
    #[must_use]
    pub fn remote_tick_delta(&self) -> i32 {
        self.remote_tick_delta
    }

    /// Returns the input to simulate `tick` with, predicting past the confirmed tick by
    /// repeating the confirmed tick's input.
    #[must_use]
    pub fn input(&self, tick: Tick) -> (EncodedInput, InputStatus) {
        if tick > self.confirmed_tick {
            (self.history.get(self.confirmed_tick), InputStatus::Predicted)
        } else {
            (self.history.get(tick), InputStatus::Confirmed)
        }
    }

    /// Applies a received window whose last input belongs to `received_tick`.
    ///
    /// `inputs` is ordered oldest first. The confirmed tick never moves backwards: windows
    /// ending at or before it leave the history untouched.
    pub fn add_window(
        &mut self,
        tick_delta: i32,
        received_tick: Tick,
        inputs: &[EncodedInput],
    ) -> RemoteInputUpdate {
        if received_tick < self.confirmed_tick {
            return RemoteInputUpdate::Stale;
        }
        self.remote_tick_delta = tick_delta;
        if received_tick == self.confirmed_tick {
            return RemoteInputUpdate::Refreshed;
        }

        let previous = self.confirmed_tick;
        self.confirmed_tick = received_tick;
        let first = received_tick - (inputs.len() as i64 - 1);
        for (i, input) in inputs.iter().enumerate() {
            self.history.set(first + i as i64, *input);
        }
        RemoteInputUpdate::Confirmed {
            previous,
            missing: (first.distance_from(previous) - 1).max(0),
        }
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

    fn enc(bits: u32) -> EncodedInput {
        EncodedInput::from_bits(bits)
    }

    #[test]
    fn ring_aliases_ticks_one_capacity_apart() {
        let mut history = InputHistory::new(60);
        history.set(Tick::new(3), enc(7));
        assert_eq!(history.get(Tick::new(3)), enc(7));
        assert_eq!(history.get(Tick::new(63)), enc(7));

        history.set(Tick::new(63), enc(9));
        assert_eq!(history.get(Tick::new(3)), enc(9));
    }

    #[test]
    fn negative_ticks_wrap_to_the_end() {
        let mut history = InputHistory::new(60);
        history.set(Tick::new(-1), enc(5));
        assert_eq!(history.get(Tick::new(59)), enc(5));
    }

    #[test]
    fn zero_capacity_is_bumped() {
        let mut history = InputHistory::new(0);
        assert_eq!(history.capacity(), 1);
        history.set(Tick::new(10), enc(1));
        assert_eq!(history.get(Tick::new(0)), enc(1));
    }

    #[test]
    fn window_is_oldest_first() {
        let mut history = InputHistory::new(60);
        for t in 0..10 {
            history.set(Tick::new(t), enc(t as u32));
        }
        let window = history.window(Tick::new(9), 5);
        assert_eq!(
            window.iter().map(|i| i.bits()).collect::<Vec<_>>(),
            vec![5, 6, 7, 8, 9]
        );
    }

    #[test]
    fn window_before_tick_zero_reads_empty_slots() {
        let history = InputHistory::new(60);
        let window = history.window(Tick::new(1), 5);
        assert!(window.iter().all(|i| *i == EncodedInput::NONE));
    }

    #[test]
    fn remote_reads_clamp_to_confirmed_tick() {
        let mut remote = RemoteInputHistory::new(60);
        let update = remote.add_window(0, Tick::new(4), &[enc(1), enc(2), enc(3), enc(4), enc(5)]);
        assert_eq!(
            update,
            RemoteInputUpdate::Confirmed {
                previous: Tick::new(0),
                missing: 0
            }
        );

        assert_eq!(remote.input(Tick::new(2)), (enc(3), InputStatus::Confirmed));
        assert_eq!(remote.input(Tick::new(4)), (enc(5), InputStatus::Confirmed));
        assert_eq!(remote.input(Tick::new(9)), (enc(5), InputStatus::Predicted));
    }

    #[test]
    fn stale_windows_do_not_move_confirmed_tick() {
        let mut remote = RemoteInputHistory::new(60);
        remote.add_window(3, Tick::new(10), &[enc(1); 5]);
        assert_eq!(remote.add_window(7, Tick::new(8), &[enc(2); 5]), RemoteInputUpdate::Stale);
        assert_eq!(remote.confirmed_tick(), Tick::new(10));
        assert_eq!(remote.remote_tick_delta(), 3);
        assert_eq!(remote.input(Tick::new(8)).0, enc(1));
    }

    #[test]
    fn equal_tick_only_refreshes_delta() {
        let mut remote = RemoteInputHistory::new(60);
        remote.add_window(3, Tick::new(10), &[enc(1); 5]);
        assert_eq!(
            remote.add_window(-2, Tick::new(10), &[enc(2); 5]),
            RemoteInputUpdate::Refreshed
        );
        assert_eq!(remote.remote_tick_delta(), -2);
        assert_eq!(remote.input(Tick::new(10)).0, enc(1));
    }

    #[test]
    fn gaps_larger_than_the_window_are_reported() {
        let mut remote = RemoteInputHistory::new(60);
        remote.add_window(0, Tick::new(4), &[enc(1); 5]);
        let update = remote.add_window(0, Tick::new(16), &[enc(2); 5]);
        assert_eq!(
            update,
            RemoteInputUpdate::Confirmed {
                previous: Tick::new(4),
                missing: 7
            }
        );
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn confirmed_tick_never_decreases(
                windows in proptest::collection::vec((-20_i32..20, 0_i64..200), 0..64)
            ) {
                let mut remote = RemoteInputHistory::new(60);
                let mut last = remote.confirmed_tick();
                for (delta, tick) in windows {
                    remote.add_window(delta, Tick::new(tick), &[EncodedInput::NONE; 5]);
                    prop_assert!(remote.confirmed_tick() >= last);
                    last = remote.confirmed_tick();
                }
            }
        }
    }
}
