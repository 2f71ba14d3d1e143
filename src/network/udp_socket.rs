use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::NonBlockingSocket;

const RECV_BUFFER_SIZE: usize = 4096;
/// A packet larger than this may be fragmented, so ideally we wouldn't send packets larger than
/// this.
/// Source: <https://stackoverflow.com/a/35697810/775982>
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A non-blocking UDP socket bound to `0.0.0.0:port` that talks to exactly one peer.
///
/// Datagrams from any other address are discarded on receive.
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    peer: SocketAddr,
    /// Receive buffer - reused across recv_from calls
    recv_buffer: [u8; RECV_BUFFER_SIZE],
}

impl UdpNonBlockingSocket {
    /// Binds an UDP socket to 0.0.0.0:port, sets it to non-blocking mode and fixes the peer.
    pub fn bind_to_port(port: u16, peer: SocketAddr) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            peer,
            recv_buffer: [0; RECV_BUFFER_SIZE],
        })
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// The only address packets are sent to and accepted from.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Replaces the peer address.
    pub fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = peer;
    }
}

impl NonBlockingSocket for UdpNonBlockingSocket {
    fn send(&mut self, packet: &[u8]) {
        // fragmentation raises the loss rate but is otherwise harmless
        if packet.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Sending UDP packet of size {} bytes, which is larger than ideal ({})",
                packet.len(),
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }

        // UDP is best-effort, a failed send is a dropped packet
        if let Err(e) = self.socket.send_to(packet, self.peer) {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Failed to send UDP packet to {}: {}",
                self.peer,
                e
            );
        }
    }

    fn receive_all_messages(&mut self) -> Vec<Vec<u8>> {
        let mut received = Vec::with_capacity(4);
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((number_of_bytes, src_addr)) => {
                    if src_addr != self.peer {
                        tracing::debug!("ignoring datagram from unknown address {}", src_addr);
                        continue;
                    }
                    match self.recv_buffer.get(..number_of_bytes) {
                        Some(bytes) => received.push(bytes.to_vec()),
                        None => report_violation!(
                            ViolationSeverity::Error,
                            ViolationKind::NetworkProtocol,
                            "Received {} bytes but buffer is only {} bytes",
                            number_of_bytes,
                            RECV_BUFFER_SIZE
                        ),
                    }
                },
                // there are no more messages
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received,
                // datagram socket sometimes get this error as a result of calling the send_to method
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "Unexpected socket error: {:?}: {}",
                        err.kind(),
                        err
                    );
                    return received;
                },
            }
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

    // UDP delivery on loopback is fast but not instantaneous
    #[cfg(not(miri))]
    #[track_caller]
    fn wait_for_messages(
        socket: &mut UdpNonBlockingSocket,
        expected_count: usize,
        max_retries: u32,
    ) -> Vec<Vec<u8>> {
        let mut all_received = Vec::new();
        for _ in 0..max_retries {
            all_received.extend(socket.receive_all_messages());
            if all_received.len() >= expected_count {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        all_received
    }

    // A socket bound to 0.0.0.0 can't be sent to on every platform, use 127.0.0.1.
    #[cfg(not(miri))]
    #[track_caller]
    fn loopback(socket: &UdpNonBlockingSocket) -> SocketAddr {
        let local = socket.local_addr().unwrap();
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
    }

    #[cfg(not(miri))]
    #[track_caller]
    fn connected_pair() -> (UdpNonBlockingSocket, UdpNonBlockingSocket) {
        let placeholder = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9);
        let mut a = UdpNonBlockingSocket::bind_to_port(0, placeholder).unwrap();
        let mut b = UdpNonBlockingSocket::bind_to_port(0, placeholder).unwrap();
        let addr_a = loopback(&a);
        let addr_b = loopback(&b);
        a.set_peer(addr_b);
        b.set_peer(addr_a);
        (a, b)
    }

    #[test]
    #[cfg(not(miri))] // Miri cannot execute foreign functions like socket()
    fn receive_on_idle_socket_returns_immediately() {
        let (mut a, _b) = connected_pair();
        assert!(a.receive_all_messages().is_empty());
        assert!(a.receive_all_messages().is_empty());
    }

    #[test]
    #[cfg(not(miri))]
    fn datagrams_keep_their_boundaries() {
        let (mut a, mut b) = connected_pair();
        a.send(&[0x03, 1, 2, 3, 4, 5, 6, 7, 8]);
        a.send(&[0x01]);
        let received = wait_for_messages(&mut b, 2, 20);
        assert_eq!(received.len(), 2);
        assert!(received.contains(&vec![0x01]));
        assert!(received.contains(&vec![0x03, 1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[test]
    #[cfg(not(miri))]
    fn datagrams_from_strangers_are_dropped() {
        let (_a, mut b) = connected_pair();
        let placeholder = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9);
        let mut stranger = UdpNonBlockingSocket::bind_to_port(0, placeholder).unwrap();
        stranger.set_peer(loopback(&b));
        stranger.send(&[0x01]);
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(b.receive_all_messages().is_empty());
    }

    #[test]
    #[cfg(not(miri))]
    fn send_to_unreachable_peer_does_not_panic() {
        let invalid = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let mut socket = UdpNonBlockingSocket::bind_to_port(0, invalid).unwrap();
        socket.send(&[0x01]);
    }

    #[test]
    #[cfg(not(miri))]
    fn binds_to_unspecified_address() {
        let placeholder = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9);
        let socket = UdpNonBlockingSocket::bind_to_port(0, placeholder).unwrap();
        let local = socket.local_addr().unwrap();
        assert!(local.ip().is_unspecified());
        assert_ne!(local.port(), 0);
        assert_eq!(socket.peer(), placeholder);
    }
}
