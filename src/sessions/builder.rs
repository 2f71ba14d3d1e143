use std::net::SocketAddr;
use std::sync::Arc;

use crate::{
    network::udp_socket::UdpNonBlockingSocket, sessions::config::NetplayConfig,
    telemetry::ViolationObserver, DesyncDetection, NetplayError, NonBlockingSocket, P2PSession,
    Port, Simulation,
};

const DEFAULT_LOCAL_PORT: Port = Port::new(0);
const DEFAULT_REMOTE_PORT: Port = Port::new(1);
/// Default event queue size.
/// Events older than this threshold are dropped if not polled.
const DEFAULT_EVENT_QUEUE_SIZE: usize = 100;
const MIN_EVENT_QUEUE_SIZE: usize = 2;

/// The [`SessionBuilder`] builds [`P2PSession`]s.
///
/// After setting all appropriate values, use [`SessionBuilder::start_p2p_session`] to consume
/// the builder, send the first handshake and get the session.
///
/// ```
/// use netplay_rollback::{DesyncDetection, NetplayConfig, Port, SessionBuilder};
///
/// let builder = SessionBuilder::new()
///     .with_config(NetplayConfig::lan())
///     .with_desync_detection_mode(DesyncDetection::On { interval: 30 })
///     .with_local_port(Port::new(1))
///     .with_remote_port(Port::new(0));
/// assert_eq!(builder.config().input_delay_frames, 2);
/// ```
#[must_use = "SessionBuilder must be consumed by calling start_p2p_session"]
pub struct SessionBuilder {
    config: NetplayConfig,
    local_port: Port,
    remote_port: Port,
    /// Optional observer for protocol violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
    /// Maximum number of events to queue before oldest are dropped.
    event_queue_size: usize,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            config,
            local_port,
            remote_port,
            violation_observer,
            event_queue_size,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("config", config)
            .field("local_port", local_port)
            .field("remote_port", remote_port)
            .field("has_violation_observer", &violation_observer.is_some())
            .field("event_queue_size", event_queue_size)
            .finish()
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self {
            config: NetplayConfig::default(),
            local_port: DEFAULT_LOCAL_PORT,
            remote_port: DEFAULT_REMOTE_PORT,
            violation_observer: None,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
        }
    }

    /// The configuration the session will be started with.
    pub fn config(&self) -> &NetplayConfig {
        &self.config
    }

    /// Replaces the whole configuration.
    pub fn with_config(mut self, config: NetplayConfig) -> Self {
        self.config = config;
        self
    }

    /// Change the input delay in ticks. Default is 5.
    ///
    /// Both peers must use the same value. Checked when the session starts.
    pub fn with_input_delay(mut self, delay: usize) -> Self {
        self.config.input_delay_frames = delay;
        self
    }

    /// Change how far the simulation may run ahead of confirmed remote input. Default is 10.
    pub fn with_max_rollback_window(mut self, window: usize) -> Self {
        self.config.rollback_max_frames = window;
        self
    }

    /// Change the capacity of the input histories. Default is 60.
    pub fn with_history_size(mut self, size: usize) -> Self {
        self.config.history_size = size;
        self
    }

    /// Change the number of inputs carried by each input packet. Default is 5.
    pub fn with_send_history_size(mut self, size: usize) -> Self {
        self.config.send_history_size = size;
        self
    }

    /// Sets the desync detection mode. Default is `On { interval: 10 }`.
    pub fn with_desync_detection_mode(mut self, desync_detection: DesyncDetection) -> Self {
        self.config.desync_detection = desync_detection;
        self
    }

    /// Change how often each checksum packet is sent. Default is 5.
    pub fn with_sync_data_redundancy(mut self, copies: usize) -> Self {
        self.config.sync_data_redundancy = copies;
        self
    }

    /// Sets the simulation port fed by the local player. Default is 0.
    pub fn with_local_port(mut self, port: Port) -> Self {
        self.local_port = port;
        self
    }

    /// Sets the simulation port fed by the remote peer. Default is 1.
    pub fn with_remote_port(mut self, port: Port) -> Self {
        self.remote_port = port;
        self
    }

    /// Sets a custom observer for protocol violations.
    ///
    /// If no observer is set, violations are logged via the `tracing` crate.
    ///
    /// ```
    /// use netplay_rollback::SessionBuilder;
    /// use netplay_rollback::telemetry::CollectingObserver;
    /// use std::sync::Arc;
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let builder = SessionBuilder::new().with_violation_observer(observer.clone());
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Sets how many undrained events are kept. Default is 100.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidConfig`] if `size` is smaller than 2.
    pub fn with_event_queue_size(mut self, size: usize) -> Result<Self, NetplayError> {
        if size < MIN_EVENT_QUEUE_SIZE {
            return Err(NetplayError::InvalidConfig {
                info: format!("event queue size must be at least {MIN_EVENT_QUEUE_SIZE}, got {size}"),
            });
        }
        self.event_queue_size = size;
        Ok(self)
    }

    /// Consumes the builder to construct a [`P2PSession`] and sends the first handshake.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidConfig`] if the configuration fails [`NetplayConfig::validate`].
    /// - [`NetplayError::InvalidPort`] if local and remote port are the same.
    pub fn start_p2p_session<S: Simulation>(
        self,
        socket: impl NonBlockingSocket + 'static,
        simulation: S,
    ) -> Result<P2PSession<S>, NetplayError> {
        self.config.validate()?;
        if self.local_port == self.remote_port {
            return Err(NetplayError::InvalidPort {
                port: self.remote_port,
                info: "local and remote port must differ".to_owned(),
            });
        }

        let mut session = P2PSession::new(
            self.config,
            self.local_port,
            self.remote_port,
            Box::new(socket),
            simulation,
            self.violation_observer,
            self.event_queue_size,
        );
        session.send_handshake();
        Ok(session)
    }

    /// Binds a [`UdpNonBlockingSocket`] to `local_port` talking to `peer` and starts a session
    /// on it.
    ///
    /// # Errors
    /// - [`NetplayError::SocketError`] if the socket cannot be bound.
    /// - Everything [`start_p2p_session`](Self::start_p2p_session) returns.
    pub fn start_p2p_udp_session<S: Simulation>(
        self,
        local_port: u16,
        peer: SocketAddr,
        simulation: S,
    ) -> Result<P2PSession<S>, NetplayError> {
        let socket = UdpNonBlockingSocket::bind_to_port(local_port, peer).map_err(|err| {
            NetplayError::SocketError {
                context: format!("binding UDP port {local_port} failed: {err}"),
            }
        })?;
        self.start_p2p_session(socket, simulation)
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
    use crate::network::codec::decode_packet;
    use crate::{MemorySocket, Packet, PlayerState, SessionState};

    #[derive(Default)]
    struct Idle;

    impl Simulation for Idle {
        fn poll_local_input(&mut self) {}
        fn input_state(&self, _port: Port) -> PlayerState {
            PlayerState::default()
        }
        fn set_input_state(&mut self, _port: Port, _state: PlayerState) {}
        fn step(&mut self) {}
        fn serialize(&self) -> Result<Vec<u8>, NetplayError> {
            Ok(vec![0])
        }
        fn deserialize(&mut self, _state: &[u8]) -> Result<(), NetplayError> {
            Ok(())
        }
    }

    #[test]
    fn setters_write_through_to_the_config() {
        let builder = SessionBuilder::new()
            .with_input_delay(3)
            .with_max_rollback_window(7)
            .with_history_size(40)
            .with_send_history_size(4)
            .with_sync_data_redundancy(2)
            .with_desync_detection_mode(DesyncDetection::Off);
        assert_eq!(
            *builder.config(),
            NetplayConfig {
                input_delay_frames: 3,
                rollback_max_frames: 7,
                history_size: 40,
                send_history_size: 4,
                desync_detection: DesyncDetection::Off,
                sync_data_redundancy: 2,
            }
        );
    }

    #[test]
    fn start_sends_a_handshake() {
        let (socket, mut peer) = MemorySocket::pair();
        let session = SessionBuilder::new().start_p2p_session(socket, Idle).unwrap();
        assert_eq!(session.current_state(), SessionState::AwaitingPeer);
        let sent = peer.receive_all_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(decode_packet(&sent[0]).unwrap(), Packet::Handshake);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (socket, _peer) = MemorySocket::pair();
        let result = SessionBuilder::new()
            .with_input_delay(0)
            .start_p2p_session(socket, Idle);
        assert!(matches!(result, Err(NetplayError::InvalidConfig { .. })));
    }

    #[test]
    fn equal_ports_are_rejected() {
        let (socket, _peer) = MemorySocket::pair();
        let result = SessionBuilder::new()
            .with_local_port(Port::new(1))
            .with_remote_port(Port::new(1))
            .start_p2p_session(socket, Idle);
        assert!(matches!(result, Err(NetplayError::InvalidPort { .. })));
    }

    #[test]
    fn event_queue_size_has_a_minimum() {
        assert!(SessionBuilder::new().with_event_queue_size(1).is_err());
        assert!(SessionBuilder::new().with_event_queue_size(2).is_ok());
    }

    #[test]
    fn debug_hides_the_observer() {
        let observer = Arc::new(crate::telemetry::CollectingObserver::new());
        let text = format!("{:?}", SessionBuilder::new().with_violation_observer(observer));
        assert!(text.contains("has_violation_observer: true"));
    }
}
