//! Fixed-size button input and its 32-bit wire encoding.
//!
//! A [`PlayerState`] is twelve named boolean buttons. On the wire and in the input
//! histories it travels as an [`EncodedInput`]: bit *i* holds button *i*, least
//! significant bit first. Bits above [`BUTTON_COUNT`] carry nothing and are dropped
//! when decoding.
//!
//! ```
//! use netplay_rollback::{Button, EncodedInput, PlayerState};
//!
//! let mut state = PlayerState::default();
//! state.press(Button::B);
//! state.press(Button::Down);
//!
//! let encoded = EncodedInput::encode(&state);
//! assert_eq!(encoded.bits(), 0b10_0001);
//! assert_eq!(encoded.decode(), state);
//! ```

use std::fmt;

/// Number of buttons in a [`PlayerState`].
pub const BUTTON_COUNT: usize = 12;

/// Mask of the bits an [`EncodedInput`] actually uses.
const BUTTON_MASK: u32 = (1 << BUTTON_COUNT) - 1;

/// The twelve buttons of a player's pad, in encoding order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Button {
    /// Bit 0.
    B,
    /// Bit 1.
    Y,
    /// Bit 2.
    Select,
    /// Bit 3.
    Start,
    /// Bit 4.
    Up,
    /// Bit 5.
    Down,
    /// Bit 6.
    Left,
    /// Bit 7.
    Right,
    /// Bit 8.
    A,
    /// Bit 9.
    X,
    /// Bit 10.
    L,
    /// Bit 11.
    R,
}

impl Button {
    /// All buttons, in encoding order.
    pub const ALL: [Button; BUTTON_COUNT] = [
        Button::B,
        Button::Y,
        Button::Select,
        Button::Start,
        Button::Up,
        Button::Down,
        Button::Left,
        Button::Right,
        Button::A,
        Button::X,
        Button::L,
        Button::R,
    ];

    /// Position of this button in a [`PlayerState`] and its bit in an [`EncodedInput`].
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns the button at `index`, or `None` past the last button.
    #[must_use]
    pub fn from_index(index: usize) -> Option<Button> {
        Self::ALL.get(index).copied()
    }

    /// Lowercase name, for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Button::B => "b",
            Button::Y => "y",
            Button::Select => "select",
            Button::Start => "start",
            Button::Up => "up",
            Button::Down => "down",
            Button::Left => "left",
            Button::Right => "right",
            Button::A => "a",
            Button::X => "x",
            Button::L => "l",
            Button::R => "r",
        }
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The pressed/released state of all buttons of one player for one tick.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct PlayerState([bool; BUTTON_COUNT]);

impl PlayerState {
    /// Creates a state from raw button flags, indexed like [`Button::ALL`].
    #[must_use]
    pub const fn new(buttons: [bool; BUTTON_COUNT]) -> Self {
        Self(buttons)
    }

    /// Returns whether `button` is held.
    #[inline]
    #[must_use]
    pub const fn is_pressed(&self, button: Button) -> bool {
        self.0[button.index()]
    }

    /// Returns the flag at `index`, or `None` past the last button.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<bool> {
        self.0.get(index).copied()
    }

    /// Marks `button` as held.
    pub fn press(&mut self, button: Button) {
        self.0[button.index()] = true;
    }

    /// Marks `button` as released.
    pub fn release(&mut self, button: Button) {
        self.0[button.index()] = false;
    }

    /// Sets `button` to `pressed`.
    pub fn set(&mut self, button: Button, pressed: bool) {
        self.0[button.index()] = pressed;
    }

    /// Returns the raw flags, indexed like [`Button::ALL`].
    #[must_use]
    pub const fn buttons(&self) -> &[bool; BUTTON_COUNT] {
        &self.0
    }

    /// Iterates over the held buttons.
    pub fn pressed(&self) -> impl Iterator<Item = Button> + '_ {
        Button::ALL
            .into_iter()
            .filter(move |button| self.is_pressed(*button))
    }
}

impl From<[bool; BUTTON_COUNT]> for PlayerState {
    fn from(buttons: [bool; BUTTON_COUNT]) -> Self {
        Self(buttons)
    }
}

/// A [`PlayerState`] packed into 32 bits, button *i* in bit *i*.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct EncodedInput(u32);

impl EncodedInput {
    /// The encoding of a state with no button held.
    pub const NONE: EncodedInput = EncodedInput(0);

    /// Wraps raw bits as received from the wire. Unused high bits are kept as-is and
    /// ignored by [`decode`](Self::decode).
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Packs `state`.
    #[must_use]
    pub fn encode(state: &PlayerState) -> Self {
        let bits = state
            .buttons()
            .iter()
            .enumerate()
            .filter(|(_, pressed)| **pressed)
            .fold(0_u32, |acc, (i, _)| acc | (1 << i));
        Self(bits)
    }

    /// Unpacks into a [`PlayerState`].
    #[must_use]
    pub fn decode(self) -> PlayerState {
        let mut buttons = [false; BUTTON_COUNT];
        for (i, pressed) in buttons.iter_mut().enumerate() {
            *pressed = self.0 & (1 << i) != 0;
        }
        PlayerState(buttons)
    }

    /// The bits with everything above the last button cleared.
    #[inline]
    #[must_use]
    pub const fn normalized(self) -> Self {
        Self(self.0 & BUTTON_MASK)
    }
}

impl From<PlayerState> for EncodedInput {
    fn from(state: PlayerState) -> Self {
        Self::encode(&state)
    }
}

impl From<EncodedInput> for PlayerState {
    fn from(input: EncodedInput) -> Self {
        input.decode()
    }
}

impl fmt::Display for EncodedInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
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

    fn state_from_bits(bits: u32) -> PlayerState {
        let mut buttons = [false; BUTTON_COUNT];
        for (i, b) in buttons.iter_mut().enumerate() {
            *b = bits & (1 << i) != 0;
        }
        PlayerState::new(buttons)
    }

    #[test]
    fn every_button_combination_roundtrips() {
        for bits in 0..(1_u32 << BUTTON_COUNT) {
            let state = state_from_bits(bits);
            let encoded = EncodedInput::encode(&state);
            assert_eq!(encoded.bits(), bits);
            assert_eq!(encoded.decode(), state, "combination {bits:#014b}");
        }
    }

    #[test]
    fn buttons_zero_and_five_encode_to_33() {
        let mut buttons = [false; BUTTON_COUNT];
        buttons[0] = true;
        buttons[5] = true;
        let state = PlayerState::new(buttons);

        let encoded = EncodedInput::encode(&state);
        assert_eq!(encoded.bits(), 0b100001);
        assert_eq!(encoded.bits(), 33);

        let decoded = EncodedInput::from_bits(33).decode();
        let held: Vec<usize> = decoded.pressed().map(Button::index).collect();
        assert_eq!(held, vec![0, 5]);
    }

    #[test]
    fn decode_ignores_high_bits() {
        let noisy = EncodedInput::from_bits(0xffff_f000 | 0b1010);
        let state = noisy.decode();
        assert_eq!(EncodedInput::encode(&state).bits(), 0b1010);
        assert_eq!(noisy.normalized().bits(), 0b1010);
    }

    #[test]
    fn button_order_matches_bit_positions() {
        for (i, button) in Button::ALL.iter().enumerate() {
            assert_eq!(button.index(), i);
            assert_eq!(Button::from_index(i), Some(*button));
        }
        assert_eq!(Button::from_index(BUTTON_COUNT), None);
        assert_eq!(Button::Down.index(), 5);
        assert_eq!(Button::R.to_string(), "r");
    }

    #[test]
    fn press_release_and_set() {
        let mut state = PlayerState::default();
        state.press(Button::Start);
        assert!(state.is_pressed(Button::Start));
        assert_eq!(state.get(Button::Start.index()), Some(true));
        state.release(Button::Start);
        assert!(!state.is_pressed(Button::Start));
        state.set(Button::L, true);
        assert_eq!(state.pressed().collect::<Vec<_>>(), vec![Button::L]);
        assert_eq!(state.get(99), None);
    }

    #[test]
    fn empty_state_is_zero() {
        assert_eq!(EncodedInput::encode(&PlayerState::default()), EncodedInput::NONE);
        assert_eq!(EncodedInput::NONE.decode(), PlayerState::default());
        assert_eq!(EncodedInput::from_bits(0x21).to_string(), "0x0021");
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_then_encode_keeps_low_bits(bits in any::<u32>()) {
                let state = EncodedInput::from_bits(bits).decode();
                prop_assert_eq!(EncodedInput::encode(&state).bits(), bits & BUTTON_MASK);
            }
        }
    }
}
