//! Common test infrastructure shared across integration tests.
//!
//! - `stubs`: a deterministic game that folds every applied input into its state
//! - `test_utils`: session constructors, lockstep drivers and hand-built packets
//!
//! # Usage
//!
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::stubs::{tapping, GameStub};
//! use common::{loopback_pair, run_until_tick};
//! ```

pub mod stubs;
pub mod test_utils;

#[allow(unused_imports)]
pub use test_utils::{
    handshake, idle_input, init_tracing, input_window, loopback_pair, run_rounds, run_until_tick,
    start_a, start_b, sync_data, test_addr, MAX_ITERATIONS,
};
