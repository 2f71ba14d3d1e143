//! Session integration tests.
//!
//! - Two sessions over an in-memory link
//! - A single session driven by a scripted peer that hand-builds packets

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

mod sessions {
    pub mod p2p;
    pub mod scripted_peer;
}
