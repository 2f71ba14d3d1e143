//! Convenient re-exports for common usage.
//!
//! ```rust
//! use netplay_rollback::prelude::*;
//! ```
//!
//! # What's Included
//!
//! - **Session types**: [`P2PSession`], [`SessionBuilder`], [`UpdateReport`]
//! - **Core traits**: [`Simulation`], [`NonBlockingSocket`]
//! - **Socket implementations**: [`UdpNonBlockingSocket`], [`MemorySocket`], [`ChaosSocket`]
//! - **Fundamental types**: [`Tick`], [`Port`], [`PlayerState`], [`Button`], [`NULL_TICK`]
//! - **Session state**: [`SessionState`], [`InputStatus`], [`DesyncDetection`], [`NetplayEvent`]
//! - **Error handling**: [`NetplayError`]
//! - **Network monitoring**: [`NetworkStats`]
//! - **Configuration**: [`NetplayConfig`], [`ChaosConfig`]
//!
//! # Example
//!
//! ```rust
//! use netplay_rollback::prelude::*;
//!
//! #[derive(Default)]
//! struct Counter {
//!     value: u64,
//!     inputs: [PlayerState; 2],
//!     polled: PlayerState,
//! }
//!
//! impl Simulation for Counter {
//!     fn poll_local_input(&mut self) {
//!         self.polled.press(Button::A);
//!     }
//!     fn input_state(&self, _port: Port) -> PlayerState {
//!         self.polled
//!     }
//!     fn set_input_state(&mut self, port: Port, state: PlayerState) {
//!         self.inputs[port.as_usize()] = state;
//!     }
//!     fn step(&mut self) {
//!         self.value += self.inputs.iter().filter(|s| s.is_pressed(Button::A)).count() as u64;
//!     }
//!     fn serialize(&self) -> Result<Vec<u8>, NetplayError> {
//!         Ok(self.value.to_le_bytes().to_vec())
//!     }
//!     fn deserialize(&mut self, state: &[u8]) -> Result<(), NetplayError> {
//!         let bytes = state.try_into().map_err(|_| NetplayError::SerializationError {
//!             context: "expected 8 bytes".to_owned(),
//!         })?;
//!         self.value = u64::from_le_bytes(bytes);
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), NetplayError> {
//! let (socket_a, socket_b) = MemorySocket::pair();
//! let mut a = SessionBuilder::new().start_p2p_session(socket_a, Counter::default())?;
//! let mut b = SessionBuilder::new()
//!     .with_local_port(Port::new(1))
//!     .with_remote_port(Port::new(0))
//!     .start_p2p_session(socket_b, Counter::default())?;
//!
//! for _ in 0..10 {
//!     a.update()?;
//!     b.update()?;
//! }
//! assert_eq!(a.current_state(), SessionState::Connected);
//! # Ok(())
//! # }
//! ```

pub use crate::{
    Button, ChaosConfig, ChaosSocket, DesyncDetection, InputStatus, MemorySocket, NetplayConfig,
    NetplayError, NetplayEvent, NetworkStats, NonBlockingSocket, P2PSession, PlayerState, Port,
    SessionBuilder, SessionState, Simulation, Tick, UdpNonBlockingSocket, UpdateReport,
    NULL_TICK,
};
