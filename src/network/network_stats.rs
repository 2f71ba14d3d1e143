/// Weight of the newest sample in [`NetworkStats::average_ping_ms`].
const PING_SMOOTHING: f64 = 0.125;

/// Milliseconds since the UNIX epoch, the timestamp carried by pings.
pub(crate) fn now_millis() -> i64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Counters and link measurements of a session, as returned by
/// [`P2PSession::network_stats`](crate::P2PSession::network_stats).
///
/// The engine never disconnects on its own; `updates_since_last_receive` is what a host
/// would use to decide that the peer is gone.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[must_use = "NetworkStats should be inspected or used after being queried"]
pub struct NetworkStats {
    /// Packets handed to the socket.
    pub packets_sent: u64,
    /// Bytes handed to the socket.
    pub bytes_sent: u64,
    /// Packets received from the socket, including malformed ones.
    pub packets_received: u64,
    /// Bytes received from the socket.
    pub bytes_received: u64,
    /// Packets that failed to decode, or input windows of the wrong length.
    pub malformed_packets: u64,
    /// Input windows older than the confirmed tick.
    pub stale_inputs: u64,
    /// Round-trip time of the most recent pong, in milliseconds.
    pub ping_ms: Option<i64>,
    /// Exponentially smoothed round-trip time, in milliseconds.
    pub average_ping_ms: Option<f64>,
    /// Number of [`update`](crate::P2PSession::update) calls since a packet last arrived.
    pub updates_since_last_receive: u32,
    /// This peer's current tick minus its confirmed tick, taken before the live step.
    pub local_tick_delta: i64,
    /// The peer's own `current tick - confirmed tick`, as it last reported.
    pub remote_tick_delta: i32,
}

impl NetworkStats {
    /// Creates zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&mut self, len: usize) {
        self.packets_sent += 1;
        self.bytes_sent += len as u64;
    }

    pub(crate) fn record_received(&mut self, len: usize) {
        self.packets_received += 1;
        self.bytes_received += len as u64;
        self.updates_since_last_receive = 0;
    }

    /// Records the reply to a ping sent at `sent_at`, observed at `now` (both in ms).
    pub(crate) fn record_pong(&mut self, sent_at: i64, now: i64) {
        let rtt = now.saturating_sub(sent_at).max(0);
        self.ping_ms = Some(rtt);
        let sample = rtt as f64;
        self.average_ping_ms = Some(match self.average_ping_ms {
            Some(avg) => avg + (sample - avg) * PING_SMOOTHING,
            None => sample,
        });
    }
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            packets_sent,
            bytes_sent,
            packets_received,
            bytes_received,
            malformed_packets,
            stale_inputs,
            ping_ms,
            average_ping_ms,
            updates_since_last_receive,
            local_tick_delta,
            remote_tick_delta,
        } = self;

        write!(
            f,
            "NetworkStats {{ sent: {packets_sent} ({bytes_sent} B), received: {packets_received} ({bytes_received} B), malformed: {malformed_packets}, stale: {stale_inputs}"
        )?;
        match ping_ms {
            Some(ping) => write!(f, ", ping: {ping}ms")?,
            None => write!(f, ", ping: None")?,
        }
        if let Some(avg) = average_ping_ms {
            write!(f, ", avg_ping: {avg:.1}ms")?;
        }
        write!(
            f,
            ", silent_updates: {updates_since_last_receive}, local_delta: {local_tick_delta}, remote_delta: {remote_tick_delta} }}"
        )
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
    fn counters_accumulate() {
        let mut stats = NetworkStats::new();
        stats.record_sent(10);
        stats.record_sent(5);
        stats.updates_since_last_receive = 7;
        stats.record_received(3);
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.bytes_sent, 15);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.bytes_received, 3);
        assert_eq!(stats.updates_since_last_receive, 0);
    }

    #[test]
    fn pong_sets_and_smooths_ping() {
        let mut stats = NetworkStats::new();
        stats.record_pong(1_000, 1_040);
        assert_eq!(stats.ping_ms, Some(40));
        assert_eq!(stats.average_ping_ms, Some(40.0));
        stats.record_pong(2_000, 2_120);
        assert_eq!(stats.ping_ms, Some(120));
        assert_eq!(stats.average_ping_ms, Some(50.0));
    }

    #[test]
    fn pong_from_the_future_clamps_to_zero() {
        let mut stats = NetworkStats::new();
        stats.record_pong(5_000, 4_000);
        assert_eq!(stats.ping_ms, Some(0));
    }

    #[test]
    fn display_without_ping() {
        let text = NetworkStats::new().to_string();
        assert!(text.contains("ping: None"));
        assert!(!text.contains("avg_ping"));
    }

    #[test]
    fn now_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }
}
