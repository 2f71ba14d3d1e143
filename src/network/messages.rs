use serde::{Deserialize, Serialize};

use crate::input::EncodedInput;
use crate::input_history::InputWindow;
use crate::Tick;

/// Leading byte of a [`Packet::Handshake`].
pub const TAG_HANDSHAKE: u8 = 0x01;
/// Leading byte of a [`Packet::PlayerInput`].
pub const TAG_PLAYER_INPUT: u8 = 0x02;
/// Leading byte of a [`Packet::Ping`].
pub const TAG_PING: u8 = 0x03;
/// Leading byte of a [`Packet::Pong`].
pub const TAG_PONG: u8 = 0x04;
/// Leading byte of a [`Packet::SyncData`].
pub const TAG_SYNC_DATA: u8 = 0x05;

/// A checksum of the serialized simulation state at one tick.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncRecord {
    /// The synced tick the checksum was taken at.
    pub tick: Tick,
    /// CRC-32 of the serialized state.
    pub checksum: u32,
}

impl SyncRecord {
    /// Creates a record.
    #[must_use]
    pub const fn new(tick: Tick, checksum: u32) -> Self {
        Self { tick, checksum }
    }
}

/// The sender's most recent inputs, resent every tick so that a lost packet is covered by
/// the next one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInput {
    /// The sender's `current tick - confirmed tick`, taken before its live step.
    pub tick_delta: i32,
    /// The tick of the last entry in `inputs`.
    pub received_tick: Tick,
    /// Encoded inputs, oldest first; `inputs[i]` belongs to tick
    /// `received_tick - inputs.len() + 1 + i`.
    pub inputs: InputWindow,
}

impl PlayerInput {
    /// The tick of the first entry in `inputs`.
    #[must_use]
    pub fn first_tick(&self) -> Tick {
        self.received_tick - (self.inputs.len() as i64 - 1)
    }
}

impl Default for PlayerInput {
    fn default() -> Self {
        Self {
            tick_delta: 0,
            received_tick: Tick::NULL,
            inputs: InputWindow::new(),
        }
    }
}

impl std::fmt::Debug for PlayerInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            tick_delta,
            received_tick,
            inputs,
        } = self;

        f.debug_struct("PlayerInput")
            .field("tick_delta", tick_delta)
            .field("received_tick", received_tick)
            .field("inputs", &InputsDebug(inputs))
            .finish()
    }
}

struct InputsDebug<'a>(&'a [EncodedInput]);

impl std::fmt::Debug for InputsDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|input| format!("{input}")))
            .finish()
    }
}

/// Every message the two peers exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Announces a session; answered implicitly by the peer's own handshake or inputs.
    Handshake,
    /// A window of the sender's inputs.
    PlayerInput(PlayerInput),
    /// Round-trip probe carrying the sender's clock in milliseconds.
    Ping {
        /// Sender timestamp, echoed back verbatim.
        time: i64,
    },
    /// Reply to a [`Packet::Ping`].
    Pong {
        /// The timestamp of the ping being answered.
        time: i64,
    },
    /// A state checksum for the desync audit.
    SyncData(SyncRecord),
}

impl Packet {
    /// The leading tag byte of this packet on the wire.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Packet::Handshake => TAG_HANDSHAKE,
            Packet::PlayerInput(_) => TAG_PLAYER_INPUT,
            Packet::Ping { .. } => TAG_PING,
            Packet::Pong { .. } => TAG_PONG,
            Packet::SyncData(_) => TAG_SYNC_DATA,
        }
    }

    /// Name of the packet kind, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Packet::Handshake => "handshake",
            Packet::PlayerInput(_) => "player_input",
            Packet::Ping { .. } => "ping",
            Packet::Pong { .. } => "pong",
            Packet::SyncData(_) => "sync_data",
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

    #[test]
    fn first_tick_counts_back_from_received_tick() {
        let input = PlayerInput {
            tick_delta: 0,
            received_tick: Tick::new(9),
            inputs: [EncodedInput::NONE; 5].into_iter().collect(),
        };
        assert_eq!(input.first_tick(), Tick::new(5));
    }

    #[test]
    fn debug_shows_inputs_as_hex() {
        let input = PlayerInput {
            tick_delta: -1,
            received_tick: Tick::new(4),
            inputs: [EncodedInput::from_bits(33)].into_iter().collect(),
        };
        let text = format!("{input:?}");
        assert!(text.contains("tick_delta: -1"));
        assert!(text.contains("0x0021"));
    }

    #[test]
    fn tags_are_distinct_and_stable() {
        let packets = [
            Packet::Handshake,
            Packet::PlayerInput(PlayerInput::default()),
            Packet::Ping { time: 0 },
            Packet::Pong { time: 0 },
            Packet::SyncData(SyncRecord::new(Tick::new(0), 0)),
        ];
        let tags: Vec<u8> = packets.iter().map(Packet::tag).collect();
        assert_eq!(tags, vec![0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(packets[1].kind(), "player_input");
    }
}
