use crate::Tick;

/// Throttles whichever peer runs ahead by stalling it one tick at a time.
///
/// Both peers report `local tick - confirmed tick` with every input window. Half the
/// difference between the two deltas is the classic symmetric clock-offset estimate; a peer
/// whose offset is at least one tick stalls every other update until the offset drops
/// below one. No round-trip timing is involved, only the exchanged tick counters.
///
/// The estimator only acts on updates that saw a newer confirmed tick, so it never reacts
/// twice to the same remote report.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSync {
    last_confirmed_tick: Tick,
    tick_offset: f32,
    syncing: bool,
    synced_last_update: bool,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self {
            last_confirmed_tick: Tick::new(0),
            tick_offset: 0.0,
            syncing: false,
            synced_last_update: false,
        }
    }
}

impl TimeSync {
    /// Creates an idle estimator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one update's counters and returns `true` if this update must stall.
    ///
    /// `local_tick_delta` is this peer's `current tick - confirmed tick`, taken before the
    /// update's live step; `remote_tick_delta` the same quantity last reported by the peer.
    pub fn should_stall(
        &mut self,
        confirmed_tick: Tick,
        local_tick_delta: i64,
        remote_tick_delta: i32,
    ) -> bool {
        if confirmed_tick <= self.last_confirmed_tick {
            return false;
        }
        self.last_confirmed_tick = confirmed_tick;

        if !self.syncing {
            self.tick_offset = (local_tick_delta - i64::from(remote_tick_delta)) as f32 / 2.0;
            self.syncing = self.tick_offset >= 1.0;
        }

        if self.syncing && !self.synced_last_update {
            self.synced_last_update = true;
            self.tick_offset -= 1.0;
            // never overshoot below one tick of advantage
            if self.tick_offset < 1.0 {
                self.syncing = false;
            }
            true
        } else {
            self.synced_last_update = false;
            false
        }
    }

    /// Whether a stall sequence is in progress.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    /// Remaining estimated advantage in ticks.
    #[must_use]
    pub fn tick_offset(&self) -> f32 {
        self.tick_offset
    }

    /// The confirmed tick of the last update the estimator acted on.
    #[must_use]
    pub fn last_confirmed_tick(&self) -> Tick {
        self.last_confirmed_tick
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod time_sync_tests {
    use super::*;

    /// Runs updates with a fresh confirmed tick each time and a fixed delta difference,
    /// returning the stall decisions until the estimator stops syncing.
    fn drive(difference: i64, max_updates: usize) -> Vec<bool> {
        let mut time_sync = TimeSync::new();
        let mut decisions = Vec::new();
        for i in 0..max_updates {
            let stall = time_sync.should_stall(Tick::new(i as i64 + 1), difference, 0);
            decisions.push(stall);
            if !time_sync.is_syncing() && i > 0 {
                break;
            }
        }
        decisions
    }

    #[test]
    fn test_no_stall_when_peers_are_even() {
        let mut time_sync = TimeSync::new();
        for i in 1..20 {
            assert!(!time_sync.should_stall(Tick::new(i), 1, 0));
        }
        assert!(!time_sync.is_syncing());
    }

    #[test]
    fn test_no_stall_without_new_confirmed_tick() {
        let mut time_sync = TimeSync::new();
        assert!(time_sync.should_stall(Tick::new(5), 10, 0));
        // same confirmed tick again: the estimator is not consulted
        assert!(!time_sync.should_stall(Tick::new(5), 10, 0));
        assert!(!time_sync.should_stall(Tick::new(4), 10, 0));
        assert!(time_sync.is_syncing());
    }

    #[test]
    fn test_never_stalls_twice_in_a_row() {
        let decisions = drive(12, 100);
        for pair in decisions.windows(2) {
            assert!(!(pair[0] && pair[1]), "consecutive stalls in {decisions:?}");
        }
    }

    #[test]
    fn test_converges_within_half_the_difference() {
        for difference in 2..=20_i64 {
            let mut time_sync = TimeSync::new();
            let mut stalls = 0;
            let mut tick = 1;
            loop {
                if time_sync.should_stall(Tick::new(tick), difference, 0) {
                    stalls += 1;
                }
                tick += 1;
                if !time_sync.is_syncing() {
                    break;
                }
                assert!(tick < 1000, "did not converge for difference {difference}");
            }
            let bound = (difference + 1) / 2;
            assert!(
                stalls <= bound,
                "difference {difference}: {stalls} stalls, bound {bound}"
            );
            assert!(time_sync.tick_offset() < 1.0);
        }
    }

    #[test]
    fn test_small_difference_does_not_sync() {
        let mut time_sync = TimeSync::new();
        assert!(!time_sync.should_stall(Tick::new(1), 1, 0));
        assert!(!time_sync.is_syncing());
        assert!((time_sync.tick_offset() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_behind_peer_never_stalls() {
        let mut time_sync = TimeSync::new();
        for i in 1..20 {
            assert!(!time_sync.should_stall(Tick::new(i), 0, 8));
        }
    }

    #[test]
    fn test_tracks_last_confirmed_tick() {
        let mut time_sync = TimeSync::new();
        time_sync.should_stall(Tick::new(7), 0, 0);
        assert_eq!(time_sync.last_confirmed_tick(), Tick::new(7));
    }
}
