//! An in-process, lossless transport for tests and local play.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::NonBlockingSocket;

type Queue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// One end of an in-memory datagram link created by [`MemorySocket::pair`].
///
/// Packets sent on one end are received, in order and exactly once, by the other. Both ends
/// may live on different threads.
///
/// ```
/// use netplay_rollback::{MemorySocket, NonBlockingSocket};
///
/// let (mut a, mut b) = MemorySocket::pair();
/// a.send(&[0x01]);
/// assert_eq!(b.receive_all_messages(), vec![vec![0x01]]);
/// assert!(a.receive_all_messages().is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct MemorySocket {
    inbox: Queue,
    outbox: Queue,
}

impl MemorySocket {
    /// Creates two connected ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let a_to_b = Queue::default();
        let b_to_a = Queue::default();
        (
            Self {
                inbox: Arc::clone(&b_to_a),
                outbox: Arc::clone(&a_to_b),
            },
            Self {
                inbox: a_to_b,
                outbox: b_to_a,
            },
        )
    }

    /// Number of packets waiting to be received on this end.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inbox.lock().len()
    }
}

impl NonBlockingSocket for MemorySocket {
    fn send(&mut self, packet: &[u8]) {
        self.outbox.lock().push_back(packet.to_vec());
    }

    fn receive_all_messages(&mut self) -> Vec<Vec<u8>> {
        self.inbox.lock().drain(..).collect()
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
    fn packets_arrive_in_order_on_the_other_end() {
        let (mut a, mut b) = MemorySocket::pair();
        a.send(&[1]);
        a.send(&[2, 2]);
        b.send(&[3]);
        assert_eq!(b.pending(), 2);
        assert_eq!(b.receive_all_messages(), vec![vec![1], vec![2, 2]]);
        assert_eq!(a.receive_all_messages(), vec![vec![3]]);
        assert!(b.receive_all_messages().is_empty());
    }

    #[test]
    fn ends_work_across_threads() {
        let (mut a, mut b) = MemorySocket::pair();
        std::thread::spawn(move || a.send(&[9]))
            .join()
            .unwrap();
        assert_eq!(b.receive_all_messages(), vec![vec![9]]);
    }
}
