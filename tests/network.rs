//! Network integration tests.
//!
//! - Sessions over a ChaosSocket (loss, duplication, reordering, latency)
//! - Sessions over real UDP sockets on localhost

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

mod network {
    pub mod resilience;
    pub mod udp;
}
