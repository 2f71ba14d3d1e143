use crate::desync::DesyncDetector;
use crate::error::NetplayError;
use crate::input_history::RemoteInputUpdate;
use crate::network::codec;
use crate::network::messages::{Packet, PlayerInput, SyncRecord};
use crate::network::network_stats::{now_millis, NetworkStats};
use crate::report_violation_to;
use crate::sessions::config::NetplayConfig;
use crate::sync_layer::{RollbackOutcome, SyncLayer};
use crate::telemetry::{ProtocolViolation, ViolationKind, ViolationObserver, ViolationSeverity};
use crate::time_sync::TimeSync;
use crate::{InputStatus, NetplayEvent, NonBlockingSocket, Port, SessionState, Simulation, Tick};
use tracing::{debug, trace};

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::sync::Arc;

/// What a single [`P2PSession::update`] call decided.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[must_use = "UpdateReport describes what the update did and should be inspected or explicitly ignored"]
pub struct UpdateReport {
    /// A live step was simulated.
    pub advanced: bool,
    /// Steps replayed to correct mispredictions before the live step.
    pub replayed_ticks: usize,
    /// The clock-sync estimator held this peer back for one tick.
    pub stalled: bool,
    /// The backpressure ceiling held this peer back: it is too far ahead of confirmed input.
    pub throttled: bool,
    /// Whether the live step used received or predicted remote input.
    pub remote_input: Option<InputStatus>,
}

/// A [`P2PSession`] keeps a local [`Simulation`] in lockstep with the same simulation running
/// on one remote peer.
///
/// Call [`update`](Self::update) once per simulation tick. Each call drains the socket, replays
/// mispredicted ticks if corrected remote input arrived, advances at most one live tick, and
/// sends this peer's newest inputs and a ping.
pub struct P2PSession<S>
where
    S: Simulation,
{
    /// The simulation being kept in sync. Only the session steps it.
    simulation: S,
    /// The [`P2PSession`] uses this socket to send and receive all messages for the remote peer.
    socket: Box<dyn NonBlockingSocket>,
    config: NetplayConfig,
    /// Internal State of the Session.
    state: SessionState,
    /// Tick cursors, input histories and the snapshot.
    sync_layer: SyncLayer,
    time_sync: TimeSync,
    desync: DesyncDetector,
    /// Checksum records produced by the last step or replay, waiting to be sent.
    pending_sync_records: Vec<SyncRecord>,
    /// Set once the desync event has been queued.
    desync_reported: bool,
    stats: NetworkStats,
    /// Contains all events to be forwarded to the user.
    event_queue: VecDeque<NetplayEvent>,
    max_event_queue_size: usize,
    /// Optional observer for protocol violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<S: Simulation> std::fmt::Debug for P2PSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2PSession")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("sync_layer", &self.sync_layer)
            .field("time_sync", &self.time_sync)
            .field("desync", &self.desync)
            .field("stats", &self.stats)
            .field("pending_events", &self.event_queue.len())
            .finish_non_exhaustive()
    }
}

impl<S: Simulation> P2PSession<S> {
    /// Internal constructor, use [`SessionBuilder`](crate::SessionBuilder).
    pub(crate) fn new(
        config: NetplayConfig,
        local_port: Port,
        remote_port: Port,
        socket: Box<dyn NonBlockingSocket>,
        simulation: S,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
        max_event_queue_size: usize,
    ) -> Self {
        Self {
            simulation,
            socket,
            config,
            state: SessionState::Disconnected,
            sync_layer: SyncLayer::new(&config, local_port, remote_port),
            time_sync: TimeSync::new(),
            desync: DesyncDetector::new(config.desync_detection),
            pending_sync_records: Vec::new(),
            desync_reported: false,
            stats: NetworkStats::new(),
            event_queue: VecDeque::new(),
            max_event_queue_size,
            violation_observer,
        }
    }

    /// Announces this peer. Moves a fresh session to [`SessionState::AwaitingPeer`].
    pub(crate) fn send_handshake(&mut self) {
        self.send_packet(&Packet::Handshake);
        if self.state == SessionState::Disconnected {
            self.state = SessionState::AwaitingPeer;
        }
    }

    /// Runs one iteration of the session. Call this once per simulation tick.
    ///
    /// # Errors
    /// - Returns [`NetplayError::Desynced`] once the peers' checksums disagreed. This is
    ///   permanent: every later call returns the same error without doing anything.
    /// - Returns an error if the simulation fails to serialize or deserialize its state.
    pub fn update(&mut self) -> Result<UpdateReport, NetplayError> {
        self.check_desync()?;

        self.stats.updates_since_last_receive =
            self.stats.updates_since_last_receive.saturating_add(1);
        self.poll_remote_clients();
        self.check_desync()?;
        if self.state == SessionState::AwaitingPeer {
            self.send_handshake();
        }

        let mut report = UpdateReport::default();
        let current_tick = self.sync_layer.local_tick();
        let mut local_tick_delta = 0;
        let mut should_update = false;

        if self.state == SessionState::Connected {
            should_update = true;
            report.replayed_ticks = self.handle_rollback()?;

            let confirmed_tick = self.sync_layer.confirmed_tick();
            local_tick_delta = current_tick.distance_from(confirmed_tick);
            self.stats.local_tick_delta = local_tick_delta;
            self.stats.remote_tick_delta = self.sync_layer.remote_tick_delta();

            if self.time_sync.should_stall(
                confirmed_tick,
                local_tick_delta,
                self.sync_layer.remote_tick_delta(),
            ) {
                trace!(
                    "stalling at tick {} (offset {:.1})",
                    current_tick,
                    self.time_sync.tick_offset()
                );
                report.stalled = true;
                should_update = false;
            }
            if should_update && !self.sync_layer.within_prediction_window() {
                trace!(
                    "tick {} is too far ahead of confirmed tick {}",
                    current_tick,
                    confirmed_tick
                );
                report.throttled = true;
                should_update = false;
            }
        }

        if should_update {
            let desync = &mut self.desync;
            let pending = &mut self.pending_sync_records;
            self.sync_layer
                .advance(&mut self.simulation, |tick, state| {
                    if let Some(record) = desync.on_synced_tick(tick, state) {
                        pending.push(record);
                    }
                })?;
            report.advanced = true;
            report.remote_input = self.sync_layer.last_remote_status();
        }

        if self.state == SessionState::Connected {
            self.send_sync_records();
            let tick_delta =
                local_tick_delta.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
            let input = self.sync_layer.outgoing_input(tick_delta);
            self.send_packet(&Packet::PlayerInput(input));
            self.send_packet(&Packet::Ping { time: now_millis() });
        }

        self.check_desync()?;
        Ok(report)
    }

    /// Drains the socket and handles every packet. [`update`](Self::update) calls this first;
    /// calling it in between is harmless.
    pub fn poll_remote_clients(&mut self) {
        for bytes in self.socket.receive_all_messages() {
            self.stats.record_received(bytes.len());
            match codec::decode_packet(&bytes) {
                Ok(packet) => self.handle_packet(packet),
                Err(err) => {
                    self.stats.malformed_packets += 1;
                    debug!("dropping malformed packet ({} bytes): {}", bytes.len(), err);
                },
            }
        }
    }

    /// Returns the current [`SessionState`] of a session.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// The next tick to be simulated.
    #[must_use]
    pub fn current_tick(&self) -> Tick {
        self.sync_layer.local_tick()
    }

    /// Highest tick for which the peer's real input has been received.
    #[must_use]
    pub fn confirmed_tick(&self) -> Tick {
        self.sync_layer.confirmed_tick()
    }

    /// The newest tick simulated from confirmed input only. States up to this tick are final.
    #[must_use]
    pub fn last_synced_tick(&self) -> Tick {
        self.sync_layer.last_synced_tick()
    }

    /// Whether the checksum audit found the peers diverged. Never resets.
    #[must_use]
    pub fn is_desynced(&self) -> bool {
        self.desync.is_desynced()
    }

    /// The most recent local checksum record, if desync detection is on.
    #[must_use]
    pub fn local_sync_record(&self) -> Option<SyncRecord> {
        self.desync.local_record()
    }

    /// The most recent checksum record received from the peer.
    #[must_use]
    pub fn remote_sync_record(&self) -> Option<SyncRecord> {
        self.desync.remote_record()
    }

    /// Returns all events that happened since last queried for events. If the number of stored
    /// events exceeds the configured queue size, the oldest events are discarded.
    pub fn events(&mut self) -> Drain<'_, NetplayEvent> {
        self.event_queue.drain(..)
    }

    /// Traffic counters and link measurements.
    pub fn network_stats(&self) -> NetworkStats {
        self.stats
    }

    /// The configuration the session was started with.
    pub fn config(&self) -> &NetplayConfig {
        &self.config
    }

    /// The simulation, e.g. for rendering.
    pub fn simulation(&self) -> &S {
        &self.simulation
    }

    /// Mutable access to the simulation. Changing state that [`Simulation::serialize`]
    /// covers outside of [`update`](Self::update) breaks determinism.
    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.simulation
    }

    /// Returns the violation observer, if one was configured.
    #[must_use]
    pub fn violation_observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.violation_observer.as_ref()
    }

    fn handle_rollback(&mut self) -> Result<usize, NetplayError> {
        let desync = &mut self.desync;
        let pending = &mut self.pending_sync_records;
        let outcome = self
            .sync_layer
            .rollback(&mut self.simulation, |tick, state| {
                if let Some(record) = desync.on_synced_tick(tick, state) {
                    pending.push(record);
                }
            })?;

        match outcome {
            RollbackOutcome::NotNeeded => Ok(0),
            RollbackOutcome::Replayed { ticks } => {
                debug!(
                    "replayed {} ticks, synced through {}",
                    ticks,
                    self.sync_layer.last_synced_tick()
                );
                Ok(ticks)
            },
            RollbackOutcome::EmptySnapshot => {
                let violation = ProtocolViolation::new(
                    ViolationSeverity::Warning,
                    ViolationKind::StateManagement,
                    "rollback skipped: snapshot is empty",
                    concat!(file!(), ":", line!()),
                )
                .with_tick(self.sync_layer.snapshot().tick());
                report_violation_to!(self.violation_observer, violation);
                Ok(0)
            },
        }
    }

    fn handle_packet(&mut self, packet: Packet) {
        trace!("received {}", packet.kind());
        match packet {
            Packet::Handshake => self.on_peer_seen(),
            Packet::PlayerInput(input) => {
                self.on_peer_seen();
                self.handle_input(&input);
            },
            Packet::Ping { time } => self.send_packet(&Packet::Pong { time }),
            Packet::Pong { time } => self.stats.record_pong(time, now_millis()),
            Packet::SyncData(record) => {
                if self.desync.on_remote_record(record) {
                    trace!("adopted remote checksum {:#010x} for tick {}", record.checksum, record.tick);
                }
            },
        }
    }

    fn handle_input(&mut self, input: &PlayerInput) {
        if input.inputs.len() != self.config.send_history_size {
            self.stats.malformed_packets += 1;
            debug!(
                "dropping input window of {} inputs, expected {}",
                input.inputs.len(),
                self.config.send_history_size
            );
            return;
        }

        // a peer's delayed input never lands before tick 0
        if !input.received_tick.is_valid() {
            self.stats.malformed_packets += 1;
            debug!(
                "dropping input window ending at negative tick {}",
                input.received_tick.as_i64()
            );
            return;
        }

        // the peer can lead by at most 2 * (input delay + rollback window) + 1 ticks
        let ahead = input.received_tick.distance_from(self.sync_layer.local_tick());
        if ahead >= self.config.history_size as i64 {
            self.stats.malformed_packets += 1;
            let violation = ProtocolViolation::new(
                ViolationSeverity::Warning,
                ViolationKind::TickSync,
                "dropped remote input further ahead than the input history holds",
                concat!(file!(), ":", line!()),
            )
            .with_tick(input.received_tick)
            .with_context("ahead", ahead.to_string());
            report_violation_to!(self.violation_observer, violation);
            return;
        }

        match self.sync_layer.add_remote_input(input) {
            RemoteInputUpdate::Stale => {
                self.stats.stale_inputs += 1;
                trace!("ignoring stale input window ending at {}", input.received_tick);
            },
            RemoteInputUpdate::Refreshed => {},
            RemoteInputUpdate::Confirmed { previous, missing } => {
                if missing > 0 {
                    let violation = ProtocolViolation::new(
                        ViolationSeverity::Warning,
                        ViolationKind::InputHistory,
                        "input window skipped ticks no packet covered",
                        concat!(file!(), ":", line!()),
                    )
                    .with_tick(input.first_tick())
                    .with_context("previous_confirmed", previous.to_string())
                    .with_context("missing", missing.to_string());
                    report_violation_to!(self.violation_observer, violation);
                }
            },
        }
    }

    fn on_peer_seen(&mut self) {
        if self.state != SessionState::Connected {
            debug!("peer connected");
            self.state = SessionState::Connected;
            self.push_event(NetplayEvent::Connected);
        }
    }

    fn send_sync_records(&mut self) {
        for record in std::mem::take(&mut self.pending_sync_records) {
            trace!("sending checksum {:#010x} for tick {}", record.checksum, record.tick);
            for _ in 0..self.config.sync_data_redundancy {
                self.send_packet(&Packet::SyncData(record));
            }
        }
    }

    fn send_packet(&mut self, packet: &Packet) {
        let bytes = codec::encode_packet(packet);
        self.stats.record_sent(bytes.len());
        self.socket.send(&bytes);
    }

    fn push_event(&mut self, event: NetplayEvent) {
        if self.event_queue.len() >= self.max_event_queue_size {
            self.event_queue.pop_front();
        }
        self.event_queue.push_back(event);
    }

    /// Queues the desync event the first time a desync is seen and turns it into an error.
    fn check_desync(&mut self) -> Result<(), NetplayError> {
        if !self.desync.is_desynced() {
            return Ok(());
        }
        let (Some(local), Some(remote)) = (self.desync.local_record(), self.desync.remote_record())
        else {
            return Err(NetplayError::Desynced {
                tick: Tick::NULL,
                local_checksum: 0,
                remote_checksum: 0,
            });
        };

        if !self.desync_reported {
            self.desync_reported = true;
            let violation = ProtocolViolation::new(
                ViolationSeverity::Critical,
                ViolationKind::ChecksumMismatch,
                "peers computed different checksums",
                concat!(file!(), ":", line!()),
            )
            .with_tick(local.tick)
            .with_context("local", format!("{:#010x}", local.checksum))
            .with_context("remote", format!("{:#010x}", remote.checksum));
            report_violation_to!(self.violation_observer, violation);
            self.push_event(NetplayEvent::DesyncDetected {
                tick: local.tick,
                local_checksum: local.checksum,
                remote_checksum: remote.checksum,
            });
        }

        Err(NetplayError::Desynced {
            tick: local.tick,
            local_checksum: local.checksum,
            remote_checksum: remote.checksum,
        })
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
    use crate::checksum::crc32;
    use crate::network::codec::{decode_packet, encode_packet};
    use crate::telemetry::CollectingObserver;
    use crate::{EncodedInput, MemorySocket, PlayerState, SessionBuilder};

    /// Counts steps; its serialized state is the step count.
    #[derive(Default)]
    struct Steps {
        steps: u64,
    }

    impl Simulation for Steps {
        fn poll_local_input(&mut self) {}
        fn input_state(&self, _port: Port) -> PlayerState {
            PlayerState::default()
        }
        fn set_input_state(&mut self, _port: Port, _state: PlayerState) {}
        fn step(&mut self) {
            self.steps += 1;
        }
        fn serialize(&self) -> Result<Vec<u8>, NetplayError> {
            Ok(self.steps.to_le_bytes().to_vec())
        }
        fn deserialize(&mut self, state: &[u8]) -> Result<(), NetplayError> {
            let bytes: [u8; 8] = state.try_into().map_err(|_| NetplayError::SerializationError {
                context: "bad state".to_owned(),
            })?;
            self.steps = u64::from_le_bytes(bytes);
            Ok(())
        }
    }

    fn session() -> (P2PSession<Steps>, MemorySocket) {
        let (socket, peer) = MemorySocket::pair();
        let session = SessionBuilder::new()
            .start_p2p_session(socket, Steps::default())
            .unwrap();
        (session, peer)
    }

    fn sent_packets(peer: &mut MemorySocket) -> Vec<Packet> {
        peer.receive_all_messages()
            .iter()
            .map(|bytes| decode_packet(bytes).unwrap())
            .collect()
    }

    fn input_packet(received_tick: i64) -> Vec<u8> {
        encode_packet(&Packet::PlayerInput(PlayerInput {
            tick_delta: 0,
            received_tick: Tick::new(received_tick),
            inputs: [EncodedInput::NONE; 5].into_iter().collect(),
        }))
    }

    #[test]
    fn awaiting_peer_resends_handshake_and_does_not_advance() {
        let (mut session, mut peer) = session();
        peer.receive_all_messages();
        let report = session.update().unwrap();
        assert!(!report.advanced);
        assert_eq!(session.current_tick(), Tick::new(0));
        assert_eq!(sent_packets(&mut peer), vec![Packet::Handshake]);
    }

    #[test]
    fn handshake_connects_once() {
        let (mut session, mut peer) = session();
        peer.send(&encode_packet(&Packet::Handshake));
        peer.send(&encode_packet(&Packet::Handshake));
        let report = session.update().unwrap();
        assert!(report.advanced);
        assert_eq!(session.current_state(), SessionState::Connected);
        let events: Vec<_> = session.events().collect();
        assert_eq!(events, vec![NetplayEvent::Connected]);
    }

    #[test]
    fn input_packet_also_connects() {
        let (mut session, mut peer) = session();
        peer.send(&input_packet(4));
        let _ = session.update().unwrap();
        assert_eq!(session.current_state(), SessionState::Connected);
        assert_eq!(session.confirmed_tick(), Tick::new(4));
    }

    #[test]
    fn connected_update_sends_input_then_ping() {
        let (mut session, mut peer) = session();
        peer.send(&encode_packet(&Packet::Handshake));
        peer.receive_all_messages();
        let _ = session.update().unwrap();
        let packets = sent_packets(&mut peer);
        // tick 0 is synced but 0 % 10 == 0, so checksums go out first
        let sync_count = packets
            .iter()
            .filter(|p| matches!(p, Packet::SyncData(_)))
            .count();
        assert_eq!(sync_count, 5);
        let tail = &packets[packets.len() - 2..];
        match &tail[0] {
            Packet::PlayerInput(input) => {
                assert_eq!(input.received_tick, Tick::new(5));
                assert_eq!(input.inputs.len(), 5);
            },
            other => panic!("expected input, got {other:?}"),
        }
        assert!(matches!(tail[1], Packet::Ping { .. }));
    }

    #[test]
    fn tick_delta_counts_ticks_ahead_of_confirmed_input() {
        let (mut session, mut peer) = session();
        peer.send(&encode_packet(&Packet::Handshake));
        for _ in 0..3 {
            let _ = session.update().unwrap();
        }
        // the third update began at tick 2 with only tick 0 confirmed
        let last = sent_packets(&mut peer)
            .into_iter()
            .filter_map(|packet| match packet {
                Packet::PlayerInput(input) => Some(input),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last.tick_delta, 2);
        assert_eq!(session.network_stats().local_tick_delta, 2);
    }

    #[test]
    fn ping_is_answered_with_the_same_time() {
        let (mut session, mut peer) = session();
        peer.receive_all_messages();
        peer.send(&encode_packet(&Packet::Ping { time: 1234 }));
        session.poll_remote_clients();
        assert_eq!(sent_packets(&mut peer), vec![Packet::Pong { time: 1234 }]);
    }

    #[test]
    fn pong_records_round_trip_time() {
        let (mut session, mut peer) = session();
        peer.send(&encode_packet(&Packet::Pong { time: now_millis() }));
        session.poll_remote_clients();
        assert!(session.network_stats().ping_ms.is_some());
    }

    #[test]
    fn malformed_packets_are_counted_not_surfaced() {
        let (mut session, mut peer) = session();
        peer.send(&[0x7f]);
        peer.send(&[0x03, 1, 2]);
        // a window of the wrong length
        peer.send(&encode_packet(&Packet::PlayerInput(PlayerInput {
            tick_delta: 0,
            received_tick: Tick::new(3),
            inputs: [EncodedInput::NONE; 2].into_iter().collect(),
        })));
        assert!(session.update().is_ok());
        let stats = session.network_stats();
        assert_eq!(stats.malformed_packets, 3);
        assert_eq!(stats.packets_received, 3);
        assert_eq!(session.confirmed_tick(), Tick::new(0));
    }

    #[test]
    fn stale_inputs_are_counted() {
        let (mut session, mut peer) = session();
        peer.send(&input_packet(8));
        let _ = session.update().unwrap();
        peer.send(&input_packet(6));
        let _ = session.update().unwrap();
        assert_eq!(session.network_stats().stale_inputs, 1);
        assert_eq!(session.confirmed_tick(), Tick::new(8));
    }

    #[test]
    fn input_gap_is_reported() {
        let observer = Arc::new(CollectingObserver::new());
        let (socket, mut peer) = MemorySocket::pair();
        let mut session = SessionBuilder::new()
            .with_violation_observer(observer.clone())
            .start_p2p_session(socket, Steps::default())
            .unwrap();
        peer.send(&input_packet(4));
        peer.send(&input_packet(20));
        let _ = session.update().unwrap();
        let gaps = observer.violations_of_kind(ViolationKind::InputHistory);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].context.get("missing").map(String::as_str), Some("11"));
    }

    #[test]
    fn silent_updates_are_counted() {
        let (mut session, mut peer) = session();
        let _ = session.update().unwrap();
        let _ = session.update().unwrap();
        assert_eq!(session.network_stats().updates_since_last_receive, 2);
        peer.send(&encode_packet(&Packet::Handshake));
        let _ = session.update().unwrap();
        assert_eq!(session.network_stats().updates_since_last_receive, 0);
    }

    #[test]
    fn mismatching_checksum_is_fatal_and_sticky() {
        let (mut session, mut peer) = session();
        peer.send(&encode_packet(&Packet::Handshake));
        let _ = session.update().unwrap();
        assert_eq!(session.last_synced_tick(), Tick::new(0));
        let local = session.local_sync_record().unwrap();
        assert_eq!(local.checksum, crc32(&1_u64.to_le_bytes()));

        peer.send(&encode_packet(&Packet::SyncData(SyncRecord::new(
            Tick::new(0),
            local.checksum ^ 1,
        ))));
        let err = session.update().unwrap_err();
        assert!(matches!(err, NetplayError::Desynced { tick, .. } if tick == Tick::new(0)));
        assert!(session.is_desynced());

        let tick = session.current_tick();
        assert!(session.update().is_err());
        assert_eq!(session.current_tick(), tick);

        let desync_events = session
            .events()
            .filter(|e| matches!(e, NetplayEvent::DesyncDetected { .. }))
            .count();
        assert_eq!(desync_events, 1);
    }

    #[test]
    fn event_queue_drops_oldest() {
        let (socket, _peer) = MemorySocket::pair();
        let mut session = SessionBuilder::new()
            .with_event_queue_size(2)
            .unwrap()
            .start_p2p_session(socket, Steps::default())
            .unwrap();
        for _ in 0..3 {
            session.push_event(NetplayEvent::Connected);
        }
        assert_eq!(session.events().count(), 2);
    }
}
