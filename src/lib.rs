//! # Netplay Rollback
//!
//! A two-peer rollback netplay engine written in 100% safe Rust.
//!
//! Two instances of a deterministic simulation are kept in lockstep over an unreliable,
//! unordered link. Local input is delayed by a few ticks to hide one-way latency, missing
//! remote input is predicted by repeating the last confirmed input, and once the real input
//! arrives the session restores its last confirmed snapshot and replays the mispredicted
//! ticks. A periodic CRC-32 audit of the confirmed state catches peers that diverged anyway.
//!
//! The host drives everything through [`P2PSession::update`], once per simulation tick.
//! The simulation itself is reached through the [`Simulation`] trait, and bytes move through
//! any [`NonBlockingSocket`].

#![forbid(unsafe_code)] // let us try
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use error::NetplayError;
pub use input::{Button, EncodedInput, PlayerState, BUTTON_COUNT};
pub use network::chaos_socket::{ChaosConfig, ChaosConfigBuilder, ChaosSocket, ChaosStats};
pub use network::codec::CodecError;
pub use network::memory_socket::MemorySocket;
pub use network::messages::{Packet, PlayerInput, SyncRecord};
pub use network::network_stats::NetworkStats;
pub use network::udp_socket::UdpNonBlockingSocket;
pub use sessions::builder::SessionBuilder;
pub use sessions::config::NetplayConfig;
pub use sessions::p2p_session::{P2PSession, UpdateReport};

#[doc(hidden)]
pub mod checksum;
#[doc(hidden)]
pub mod desync;
#[doc(hidden)]
pub mod error;
pub mod input;
#[doc(hidden)]
pub mod input_history;
pub mod prelude;
/// Internal random number generator module based on PCG32.
///
/// Drives the fault injection of [`ChaosSocket`] so that lossy test runs are reproducible.
pub mod rng;
#[doc(hidden)]
pub mod sync_layer;
pub mod telemetry;
#[doc(hidden)]
pub mod time_sync;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    pub mod config;
    #[doc(hidden)]
    pub mod p2p_session;
}
#[doc(hidden)]
pub mod network {
    pub mod chaos_socket;
    /// Binary codecs: the fixed little-endian packet layout and bincode helpers for state.
    pub mod codec;
    pub mod memory_socket;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod network_stats;
    #[doc(hidden)]
    pub mod udp_socket;
}

/// Internal module exposing implementation details for testing and benchmarking.
///
/// **This module is NOT part of the public API.** Nothing here is covered by semver
/// compatibility guarantees; it exists so integration tests and benches can drive the
/// engine's components directly instead of only through [`P2PSession`].
#[doc(hidden)]
pub mod __internal {
    pub use crate::checksum::{compute_checksum, crc32};
    pub use crate::desync::DesyncDetector;
    pub use crate::input_history::{
        InputHistory, InputWindow, RemoteInputHistory, RemoteInputUpdate,
    };
    pub use crate::sync_layer::{RollbackOutcome, Snapshot, SyncLayer};
    pub use crate::time_sync::TimeSync;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no tick / invalid tick.
pub const NULL_TICK: i64 = -1;

/// A tick is one discrete, deterministic step of the simulation.
///
/// Ticks start at 0 and increase by one per step. The special value [`NULL_TICK`] (-1)
/// marks "nothing yet", for example the last synced tick before the first snapshot.
///
/// # Examples
///
/// ```
/// use netplay_rollback::Tick;
///
/// let tick = Tick::new(0);
/// assert!(tick.is_valid());
/// assert!(Tick::NULL.is_null());
///
/// let next = tick + 1;
/// assert_eq!(next.as_i64(), 1);
/// assert!(next > tick);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Tick(i64);

impl Tick {
    /// The null tick constant, equivalent to [`NULL_TICK`].
    pub const NULL: Tick = Tick(NULL_TICK);

    /// Creates a new `Tick`. The value is not validated.
    #[inline]
    #[must_use]
    pub const fn new(tick: i64) -> Self {
        Tick(tick)
    }

    /// Returns the underlying `i64` value.
    #[inline]
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns `true` if this is [`Tick::NULL`].
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_TICK
    }

    /// Returns `true` if this tick is non-negative.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Number of ticks from `earlier` to `self`, saturating at the `i64` bounds.
    #[inline]
    #[must_use]
    pub const fn distance_from(self, earlier: Tick) -> i64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_TICK")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// Arithmetic operations

impl std::ops::Add<i64> for Tick {
    type Output = Tick;

    #[inline]
    fn add(self, rhs: i64) -> Self::Output {
        Tick(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i64> for Tick {
    #[inline]
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i64> for Tick {
    type Output = Tick;

    #[inline]
    fn sub(self, rhs: i64) -> Self::Output {
        Tick(self.0 - rhs)
    }
}

impl From<i64> for Tick {
    #[inline]
    fn from(value: i64) -> Self {
        Tick(value)
    }
}

impl From<Tick> for i64 {
    #[inline]
    fn from(tick: Tick) -> Self {
        tick.0
    }
}

impl PartialEq<i64> for Tick {
    #[inline]
    fn eq(&self, other: &i64) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i64> for Tick {
    #[inline]
    fn partial_cmp(&self, other: &i64) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// Index of a player slot in the simulation's input table.
///
/// A session drives exactly two ports: the one fed by the local player and the one fed by
/// the remote peer. Which physical slot each side uses is up to the host, as long as both
/// peers agree (peer A's local port is peer B's remote port).
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Port(usize);

impl Port {
    /// Creates a new `Port`.
    #[inline]
    #[must_use]
    pub const fn new(port: usize) -> Self {
        Port(port)
    }

    /// Returns the underlying `usize` value.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for Port {
    #[inline]
    fn from(value: usize) -> Self {
        Port(value)
    }
}

// #############
// #   ENUMS   #
// #############

/// Desync detection by comparing checksums between peers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DesyncDetection {
    /// Desync detection is turned on with a specified interval rate given by the user.
    On {
        /// Checksums are exchanged for every synced tick divisible by this interval.
        /// At 60hz an interval of 10 results in 6 audits a second.
        interval: u32,
    },
    /// Desync detection is turned off.
    Off,
}

/// A session is always in one of these states. You can query it via [`P2PSession::current_state`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake has been sent yet.
    Disconnected,
    /// A handshake was sent, nothing has been heard from the peer yet.
    AwaitingPeer,
    /// The peer answered; inputs, pings and checksums are being exchanged.
    Connected,
}

/// Whether the remote input used for a tick was actually received or predicted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputStatus {
    /// The input of this player for this tick is an actual received input.
    Confirmed,
    /// The input of this player for this tick is a repetition of the last confirmed input.
    Predicted,
}

/// Notifications that you can receive from the session. Handling them is up to the user.
///
/// This enum is marked `#[non_exhaustive]`; always include a wildcard arm when matching.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NetplayEvent {
    /// The peer answered the handshake.
    Connected,
    /// Checksums of the same tick differ between the peers. The session is unusable from now on.
    DesyncDetected {
        /// Tick of the checksums.
        tick: Tick,
        /// Local checksum for the given tick.
        local_checksum: u32,
        /// Remote checksum for the given tick.
        remote_checksum: u32,
    },
}

// #############
// #  TRAITS   #
// #############

/// The deterministic simulation driven by a [`P2PSession`].
///
/// The session owns the simulation and is the only caller of these methods. Before each
/// [`step`](Simulation::step) it writes both ports' inputs with
/// [`set_input_state`](Simulation::set_input_state); the step must then be a pure function
/// of the prior state and those two inputs. Hidden clocks or unseeded randomness will show
/// up as desyncs.
#[cfg(feature = "sync-send")]
pub trait Simulation: Send + Sync {
    /// Samples the physical input devices.
    fn poll_local_input(&mut self);

    /// Returns the most recently polled input for `port`.
    fn input_state(&self, port: Port) -> PlayerState;

    /// Sets the input `port` will see during the next [`step`](Simulation::step).
    fn set_input_state(&mut self, port: Port, state: PlayerState);

    /// Advances the simulation by one tick.
    fn step(&mut self);

    /// Serializes the complete simulation state.
    fn serialize(&self) -> Result<Vec<u8>, NetplayError>;

    /// Replaces the simulation state with a previously serialized one.
    fn deserialize(&mut self, state: &[u8]) -> Result<(), NetplayError>;
}

/// This [`NonBlockingSocket`] trait carries the session's packets to and from the single remote peer.
/// Packets should be sent in an UDP-like fashion: boundaries are preserved, order and delivery are not.
#[cfg(feature = "sync-send")]
pub trait NonBlockingSocket: Send + Sync {
    /// Sends one packet to the peer. Failures are the socket's concern.
    fn send(&mut self, packet: &[u8]);

    /// This method should return all packets received since the last time this method was called.
    fn receive_all_messages(&mut self) -> Vec<Vec<u8>>;
}

/// The deterministic simulation driven by a [`P2PSession`].
///
/// The session owns the simulation and is the only caller of these methods. Before each
/// [`step`](Simulation::step) it writes both ports' inputs with
/// [`set_input_state`](Simulation::set_input_state); the step must then be a pure function
/// of the prior state and those two inputs. Hidden clocks or unseeded randomness will show
/// up as desyncs.
#[cfg(not(feature = "sync-send"))]
pub trait Simulation {
    /// Samples the physical input devices.
    fn poll_local_input(&mut self);

    /// Returns the most recently polled input for `port`.
    fn input_state(&self, port: Port) -> PlayerState;

    /// Sets the input `port` will see during the next [`step`](Simulation::step).
    fn set_input_state(&mut self, port: Port, state: PlayerState);

    /// Advances the simulation by one tick.
    fn step(&mut self);

    /// Serializes the complete simulation state.
    fn serialize(&self) -> Result<Vec<u8>, NetplayError>;

    /// Replaces the simulation state with a previously serialized one.
    fn deserialize(&mut self, state: &[u8]) -> Result<(), NetplayError>;
}

/// This [`NonBlockingSocket`] trait carries the session's packets to and from the single remote peer.
/// Packets should be sent in an UDP-like fashion: boundaries are preserved, order and delivery are not.
#[cfg(not(feature = "sync-send"))]
pub trait NonBlockingSocket {
    /// Sends one packet to the peer. Failures are the socket's concern.
    fn send(&mut self, packet: &[u8]);

    /// This method should return all packets received since the last time this method was called.
    fn receive_all_messages(&mut self) -> Vec<Vec<u8>>;
}

// ###################
// # UNIT TESTS      #
// ###################

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn tick_null_and_validity() {
        assert!(Tick::NULL.is_null());
        assert!(!Tick::NULL.is_valid());
        assert!(Tick::new(0).is_valid());
        assert!(!Tick::new(-5).is_valid());
        assert_eq!(Tick::default(), Tick::new(0));
    }

    #[test]
    fn tick_arithmetic() {
        let mut tick = Tick::new(10);
        assert_eq!(tick + 5, Tick::new(15));
        assert_eq!(tick - 11, Tick::NULL);
        tick += 3;
        assert_eq!(tick, 13);
        assert_eq!(Tick::new(20).distance_from(Tick::new(7)), 13);
    }

    #[test]
    fn distance_saturates_instead_of_overflowing() {
        assert_eq!(Tick::new(i64::MIN).distance_from(Tick::new(3)), i64::MIN);
        assert_eq!(Tick::new(i64::MAX).distance_from(Tick::NULL), i64::MAX);
    }

    #[test]
    fn tick_compares_with_raw_integers() {
        assert!(Tick::new(4) > 3);
        assert!(Tick::new(4) <= 4);
        assert_eq!(i64::from(Tick::new(9)), 9);
        assert_eq!(Tick::from(9), Tick::new(9));
    }

    #[test]
    fn tick_display() {
        assert_eq!(Tick::NULL.to_string(), "NULL_TICK");
        assert_eq!(Tick::new(42).to_string(), "42");
    }

    #[test]
    fn port_roundtrip_and_display() {
        let port = Port::from(1);
        assert_eq!(port.as_usize(), 1);
        assert_eq!(port, Port::new(1));
        assert_eq!(format!("{port}"), "1");
    }

    #[test]
    fn session_state_equality() {
        assert_ne!(SessionState::Disconnected, SessionState::AwaitingPeer);
        assert_ne!(SessionState::AwaitingPeer, SessionState::Connected);
        assert_eq!(format!("{:?}", SessionState::Connected), "Connected");
    }

    #[test]
    fn desync_detection_carries_interval() {
        let on = DesyncDetection::On { interval: 10 };
        match on {
            DesyncDetection::On { interval } => assert_eq!(interval, 10),
            DesyncDetection::Off => panic!("expected On"),
        }
        assert_ne!(on, DesyncDetection::Off);
    }
}
