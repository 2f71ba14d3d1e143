//! A socket wrapper that injects network faults.
//!
//! [`ChaosSocket`] wraps any [`NonBlockingSocket`] and drops, duplicates, delays and reorders
//! packets. Delay is counted in calls to
//! [`receive_all_messages`](NonBlockingSocket::receive_all_messages) rather than wall-clock
//! time, so a session driven once per tick sees a latency of that many ticks and a seeded run
//! is fully reproducible.
//!
//! ```
//! use netplay_rollback::{ChaosConfig, ChaosSocket, MemorySocket};
//!
//! let (a, _b) = MemorySocket::pair();
//! let config = ChaosConfig::builder()
//!     .delay_polls(3)
//!     .jitter_polls(2)
//!     .packet_loss_rate(0.05)
//!     .seed(42)
//!     .build();
//! let socket = ChaosSocket::new(a, config);
//! assert_eq!(socket.packets_in_flight(), 0);
//! ```

use std::collections::VecDeque;

use crate::rng::{Pcg32, Rng, SeedableRng};
use crate::NonBlockingSocket;

/// Fault injection settings. Rates are probabilities in `[0.0, 1.0]`; everything defaults to
/// a transparent passthrough.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChaosConfig {
    /// Receive polls every packet is held back for.
    pub delay_polls: u32,
    /// Extra random delay in `[0, jitter_polls]` polls. Packets overtake each other when set.
    pub jitter_polls: u32,
    /// Probability of dropping a packet on send.
    pub send_loss_rate: f64,
    /// Probability of dropping a packet on receive.
    pub receive_loss_rate: f64,
    /// Probability of sending a packet twice.
    pub duplication_rate: f64,
    /// Probability of swapping each delivered packet with a random one of the same batch.
    pub reorder_rate: f64,
    /// Probability of starting a burst of consecutive send losses.
    pub burst_loss_probability: f64,
    /// Number of packets a burst drops.
    pub burst_loss_length: usize,
    /// Seed for reproducible runs; taken from the clock when `None`.
    pub seed: Option<u64>,
}

impl ChaosConfig {
    /// Creates a builder starting from the passthrough configuration.
    #[must_use]
    pub fn builder() -> ChaosConfigBuilder {
        ChaosConfigBuilder::new()
    }

    /// No faults at all.
    #[must_use]
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Symmetric packet loss only.
    #[must_use]
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            send_loss_rate: loss_rate.clamp(0.0, 1.0),
            receive_loss_rate: loss_rate.clamp(0.0, 1.0),
            ..Default::default()
        }
    }

    /// A few ticks of jittery latency with light loss.
    #[must_use]
    pub fn poor_network() -> Self {
        Self {
            delay_polls: 3,
            jitter_polls: 2,
            send_loss_rate: 0.05,
            receive_loss_rate: 0.05,
            ..Default::default()
        }
    }

    /// Long, very jittery latency with heavy loss, duplication and reordering.
    #[must_use]
    pub fn terrible_network() -> Self {
        Self {
            delay_polls: 6,
            jitter_polls: 4,
            send_loss_rate: 0.15,
            receive_loss_rate: 0.15,
            duplication_rate: 0.02,
            reorder_rate: 0.1,
            ..Default::default()
        }
    }
}

/// Builder for [`ChaosConfig`].
#[derive(Debug, Clone, Default)]
pub struct ChaosConfigBuilder {
    config: ChaosConfig,
}

impl ChaosConfigBuilder {
    /// Creates a builder with the passthrough configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the constant delay in receive polls.
    #[must_use]
    pub fn delay_polls(mut self, polls: u32) -> Self {
        self.config.delay_polls = polls;
        self
    }

    /// Sets the maximum random extra delay in receive polls.
    #[must_use]
    pub fn jitter_polls(mut self, polls: u32) -> Self {
        self.config.jitter_polls = polls;
        self
    }

    /// Sets the loss rate for both directions.
    #[must_use]
    pub fn packet_loss_rate(mut self, rate: f64) -> Self {
        self.config.send_loss_rate = rate.clamp(0.0, 1.0);
        self.config.receive_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the loss rate for sending only.
    #[must_use]
    pub fn send_loss_rate(mut self, rate: f64) -> Self {
        self.config.send_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the loss rate for receiving only.
    #[must_use]
    pub fn receive_loss_rate(mut self, rate: f64) -> Self {
        self.config.receive_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the duplication rate.
    #[must_use]
    pub fn duplication_rate(mut self, rate: f64) -> Self {
        self.config.duplication_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the reorder rate.
    #[must_use]
    pub fn reorder_rate(mut self, rate: f64) -> Self {
        self.config.reorder_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Drops `length` consecutive sends whenever a burst starts (with `probability`).
    #[must_use]
    pub fn burst_loss(mut self, probability: f64, length: usize) -> Self {
        self.config.burst_loss_probability = probability.clamp(0.0, 1.0);
        self.config.burst_loss_length = length;
        self
    }

    /// Sets the seed.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Finishes the configuration.
    #[must_use]
    pub fn build(self) -> ChaosConfig {
        self.config
    }
}

/// Counters of what a [`ChaosSocket`] did to the traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChaosStats {
    /// Packets handed to `send`.
    pub packets_sent: u64,
    /// Packets dropped on send, outside bursts.
    pub packets_dropped_send: u64,
    /// Extra copies sent.
    pub packets_duplicated: u64,
    /// Packets delivered by `receive_all_messages`.
    pub packets_received: u64,
    /// Packets dropped on receive.
    pub packets_dropped_receive: u64,
    /// Swaps performed while reordering.
    pub packets_reordered: u64,
    /// Bursts started.
    pub burst_loss_events: u64,
    /// Packets dropped inside bursts.
    pub packets_dropped_burst: u64,
}

#[derive(Debug, Clone)]
struct InFlightPacket {
    bytes: Vec<u8>,
    deliver_at: u64,
}

/// Wraps a [`NonBlockingSocket`] and degrades its traffic according to a [`ChaosConfig`].
#[derive(Debug)]
pub struct ChaosSocket<S: NonBlockingSocket> {
    inner: S,
    config: ChaosConfig,
    rng: Pcg32,
    in_flight: VecDeque<InFlightPacket>,
    polls: u64,
    burst_loss_remaining: usize,
    stats: ChaosStats,
}

impl<S: NonBlockingSocket> ChaosSocket<S> {
    /// Wraps `inner`.
    pub fn new(inner: S, config: ChaosConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => Pcg32::seed_from_u64(seed),
            None => Pcg32::from_entropy(),
        };
        Self {
            inner,
            config,
            rng,
            in_flight: VecDeque::new(),
            polls: 0,
            burst_loss_remaining: 0,
            stats: ChaosStats::default(),
        }
    }

    /// The wrapped socket.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Unwraps the socket. Packets still in flight are lost.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// The active configuration.
    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    /// Replaces the configuration, e.g. to heal the link mid-test.
    pub fn set_config(&mut self, config: ChaosConfig) {
        self.config = config;
    }

    /// What has been done to the traffic so far.
    pub fn stats(&self) -> &ChaosStats {
        &self.stats
    }

    /// Packets received from the inner socket but not yet delivered.
    pub fn packets_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn roll(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.gen_bool(rate)
    }

    fn should_drop_burst(&mut self) -> bool {
        if self.burst_loss_remaining > 0 {
            self.burst_loss_remaining -= 1;
            self.stats.packets_dropped_burst += 1;
            return true;
        }
        if self.config.burst_loss_length > 0 && self.roll(self.config.burst_loss_probability) {
            self.stats.burst_loss_events += 1;
            self.burst_loss_remaining = self.config.burst_loss_length - 1;
            self.stats.packets_dropped_burst += 1;
            return true;
        }
        false
    }

    fn delivery_poll(&mut self) -> u64 {
        let jitter = if self.config.jitter_polls > 0 {
            self.rng.gen_range(0..self.config.jitter_polls + 1)
        } else {
            0
        };
        self.polls + u64::from(self.config.delay_polls) + u64::from(jitter)
    }

    fn reorder(&mut self, batch: &mut [Vec<u8>]) {
        if batch.len() < 2 || self.config.reorder_rate <= 0.0 {
            return;
        }
        for i in 0..batch.len() {
            if self.roll(self.config.reorder_rate) {
                let j = self.rng.gen_range(0..batch.len() as u32) as usize;
                if i != j {
                    batch.swap(i, j);
                    self.stats.packets_reordered += 1;
                }
            }
        }
    }
}

impl<S: NonBlockingSocket> NonBlockingSocket for ChaosSocket<S> {
    fn send(&mut self, packet: &[u8]) {
        self.stats.packets_sent += 1;

        if self.should_drop_burst() {
            return;
        }
        if self.roll(self.config.send_loss_rate) {
            self.stats.packets_dropped_send += 1;
            return;
        }

        self.inner.send(packet);
        if self.roll(self.config.duplication_rate) {
            self.stats.packets_duplicated += 1;
            self.inner.send(packet);
        }
    }

    fn receive_all_messages(&mut self) -> Vec<Vec<u8>> {
        for bytes in self.inner.receive_all_messages() {
            if self.roll(self.config.receive_loss_rate) {
                self.stats.packets_dropped_receive += 1;
                continue;
            }
            let deliver_at = self.delivery_poll();
            self.in_flight.push_back(InFlightPacket { bytes, deliver_at });
        }

        let now = self.polls;
        self.polls += 1;

        let mut ready = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.in_flight.len());
        for packet in self.in_flight.drain(..) {
            if packet.deliver_at <= now {
                ready.push(packet.bytes);
            } else {
                waiting.push_back(packet);
            }
        }
        self.in_flight = waiting;

        self.reorder(&mut ready);
        self.stats.packets_received += ready.len() as u64;
        ready
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
    use crate::MemorySocket;

    fn chaos(config: ChaosConfig) -> (MemorySocket, ChaosSocket<MemorySocket>) {
        let (plain, wrapped) = MemorySocket::pair();
        (plain, ChaosSocket::new(wrapped, config))
    }

    #[test]
    fn passthrough_delivers_everything_immediately() {
        let (mut plain, mut socket) = chaos(ChaosConfig::passthrough());
        plain.send(&[1]);
        plain.send(&[2]);
        assert_eq!(socket.receive_all_messages(), vec![vec![1], vec![2]]);
        socket.send(&[3]);
        assert_eq!(plain.receive_all_messages(), vec![vec![3]]);
        assert_eq!(socket.stats().packets_received, 2);
        assert_eq!(socket.stats().packets_sent, 1);
    }

    #[test]
    fn delay_holds_packets_for_the_given_polls() {
        let config = ChaosConfig::builder().delay_polls(2).seed(1).build();
        let (mut plain, mut socket) = chaos(config);
        plain.send(&[7]);
        assert!(socket.receive_all_messages().is_empty());
        assert_eq!(socket.packets_in_flight(), 1);
        assert!(socket.receive_all_messages().is_empty());
        assert_eq!(socket.receive_all_messages(), vec![vec![7]]);
        assert_eq!(socket.packets_in_flight(), 0);
    }

    #[test]
    fn jitter_never_delivers_early_or_later_than_the_bound() {
        let config = ChaosConfig::builder()
            .delay_polls(1)
            .jitter_polls(3)
            .seed(5)
            .build();
        let (mut plain, mut socket) = chaos(config);
        for i in 0..50_u8 {
            plain.send(&[i]);
        }
        assert!(socket.receive_all_messages().is_empty());
        let mut delivered = 0;
        for _ in 0..4 {
            delivered += socket.receive_all_messages().len();
        }
        assert_eq!(delivered, 50);
    }

    #[test]
    fn full_loss_drops_everything() {
        let (mut plain, mut socket) = chaos(ChaosConfig::lossy(1.0));
        socket.send(&[1]);
        plain.send(&[2]);
        assert!(plain.receive_all_messages().is_empty());
        assert!(socket.receive_all_messages().is_empty());
        assert_eq!(socket.stats().packets_dropped_send, 1);
        assert_eq!(socket.stats().packets_dropped_receive, 1);
    }

    #[test]
    fn full_duplication_sends_twice() {
        let config = ChaosConfig::builder().duplication_rate(1.0).seed(3).build();
        let (mut plain, mut socket) = chaos(config);
        socket.send(&[4]);
        assert_eq!(plain.receive_all_messages(), vec![vec![4], vec![4]]);
        assert_eq!(socket.stats().packets_duplicated, 1);
    }

    #[test]
    fn burst_drops_consecutive_sends() {
        let config = ChaosConfig::builder().burst_loss(1.0, 3).seed(8).build();
        let (mut plain, mut socket) = chaos(config);
        for i in 0..3_u8 {
            socket.send(&[i]);
        }
        assert!(plain.receive_all_messages().is_empty());
        assert_eq!(socket.stats().burst_loss_events, 1);
        assert_eq!(socket.stats().packets_dropped_burst, 3);
    }

    #[test]
    fn reordering_keeps_every_packet() {
        let config = ChaosConfig::builder().reorder_rate(1.0).seed(21).build();
        let (mut plain, mut socket) = chaos(config);
        for i in 0..20_u8 {
            plain.send(&[i]);
        }
        let mut received = socket.receive_all_messages();
        assert_eq!(received.len(), 20);
        assert!(socket.stats().packets_reordered > 0);
        received.sort();
        let expected: Vec<Vec<u8>> = (0..20_u8).map(|i| vec![i]).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn same_seed_same_faults() {
        let run = || {
            let (mut plain, mut socket) = chaos(ChaosConfig {
                seed: Some(99),
                ..ChaosConfig::terrible_network()
            });
            for i in 0..100_u8 {
                plain.send(&[i]);
            }
            let mut log = Vec::new();
            for _ in 0..20 {
                log.push(socket.receive_all_messages());
            }
            log
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn builder_clamps_rates() {
        let config = ChaosConfig::builder()
            .packet_loss_rate(3.0)
            .duplication_rate(-1.0)
            .build();
        assert_eq!(config.send_loss_rate, 1.0);
        assert_eq!(config.receive_loss_rate, 1.0);
        assert_eq!(config.duplication_rate, 0.0);
    }
}
