//! Periodic checksum audit of the confirmed simulation state.
//!
//! Every synced tick divisible by the configured interval is checksummed and sent to the
//! peer. Once local and remote records for the same tick disagree the detector latches:
//! neither record changes again and [`DesyncDetector::is_desynced`] stays `true` for the
//! rest of the session. Nothing here influences simulation, it only reports.

use crate::checksum::crc32;
use crate::network::messages::SyncRecord;
use crate::{DesyncDetection, Tick};

/// Local and remote checksum records plus the sticky desync flag.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesyncDetector {
    interval: Option<u32>,
    local: Option<SyncRecord>,
    remote: Option<SyncRecord>,
    desynced: bool,
}

impl DesyncDetector {
    /// Creates a detector. With [`DesyncDetection::Off`] no record is ever produced.
    #[must_use]
    pub fn new(detection: DesyncDetection) -> Self {
        let interval = match detection {
            DesyncDetection::On { interval } => Some(interval.max(1)),
            DesyncDetection::Off => None,
        };
        Self {
            interval,
            local: None,
            remote: None,
            desynced: false,
        }
    }

    /// Whether checksums are produced and evaluated at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    /// Whether `tick` is one the audit samples.
    #[must_use]
    pub fn is_check_tick(&self, tick: Tick) -> bool {
        match self.interval {
            Some(interval) => tick.is_valid() && tick.as_i64() % i64::from(interval) == 0,
            None => false,
        }
    }

    /// Called with the serialized state whenever a new tick becomes synced.
    ///
    /// On sampled ticks returns the record to transmit. While desynced the frozen local
    /// record is returned instead of a fresh one.
    pub fn on_synced_tick(&mut self, tick: Tick, state: &[u8]) -> Option<SyncRecord> {
        if !self.is_check_tick(tick) {
            return None;
        }
        if !self.desynced {
            self.local = Some(SyncRecord::new(tick, crc32(state)));
        }
        self.check();
        self.local
    }

    /// Adopts a record received from the peer if it is newer than the stored one.
    ///
    /// Returns `true` if the record was adopted. Stale records and anything arriving after a
    /// desync leave the detector untouched.
    pub fn on_remote_record(&mut self, record: SyncRecord) -> bool {
        if !self.is_enabled() || self.desynced || !record.tick.is_valid() {
            return false;
        }
        if self.remote.is_some_and(|stored| record.tick <= stored.tick) {
            return false;
        }
        self.remote = Some(record);
        self.check();
        true
    }

    /// Compares the records, latching the desync flag on a mismatch at the same tick.
    pub fn check(&mut self) -> bool {
        if let (Some(local), Some(remote)) = (self.local, self.remote) {
            let comparable = self.desynced || local.tick == remote.tick;
            if local.tick.is_valid() && comparable && local.checksum != remote.checksum {
                self.desynced = true;
            }
        }
        self.desynced
    }

    /// Whether the peers were found to have diverged. Never resets.
    #[must_use]
    pub fn is_desynced(&self) -> bool {
        self.desynced
    }

    /// The most recent local record.
    #[must_use]
    pub fn local_record(&self) -> Option<SyncRecord> {
        self.local
    }

    /// The most recent remote record.
    #[must_use]
    pub fn remote_record(&self) -> Option<SyncRecord> {
        self.remote
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

    fn detector() -> DesyncDetector {
        DesyncDetector::new(DesyncDetection::On { interval: 10 })
    }

    #[test]
    fn only_sampled_ticks_produce_records() {
        let mut detector = detector();
        assert_eq!(detector.on_synced_tick(Tick::new(7), b"state"), None);
        let record = detector.on_synced_tick(Tick::new(10), b"state").unwrap();
        assert_eq!(record, SyncRecord::new(Tick::new(10), crc32(b"state")));
        assert!(detector.on_synced_tick(Tick::new(0), b"x").is_some());
        assert_eq!(detector.on_synced_tick(Tick::NULL, b"x"), None);
    }

    #[test]
    fn disabled_detector_is_inert() {
        let mut detector = DesyncDetector::new(DesyncDetection::Off);
        assert!(!detector.is_enabled());
        assert_eq!(detector.on_synced_tick(Tick::new(10), b"state"), None);
        assert!(!detector.on_remote_record(SyncRecord::new(Tick::new(10), 1)));
        assert!(!detector.is_desynced());
    }

    #[test]
    fn matching_checksums_stay_in_sync() {
        let mut detector = detector();
        detector.on_synced_tick(Tick::new(10), b"same");
        assert!(detector.on_remote_record(SyncRecord::new(Tick::new(10), crc32(b"same"))));
        assert!(!detector.is_desynced());
    }

    #[test]
    fn different_ticks_are_not_compared() {
        let mut detector = detector();
        detector.on_synced_tick(Tick::new(20), b"local");
        detector.on_remote_record(SyncRecord::new(Tick::new(10), 0));
        assert!(!detector.is_desynced());
    }

    #[test]
    fn mismatch_is_detected_from_either_side() {
        let mut remote_first = detector();
        remote_first.on_remote_record(SyncRecord::new(Tick::new(20), 1));
        remote_first.on_synced_tick(Tick::new(20), b"local");
        assert!(remote_first.is_desynced());

        let mut local_first = detector();
        local_first.on_synced_tick(Tick::new(20), b"local");
        local_first.on_remote_record(SyncRecord::new(Tick::new(20), 1));
        assert!(local_first.is_desynced());
    }

    #[test]
    fn desync_is_sticky() {
        let mut detector = detector();
        detector.on_synced_tick(Tick::new(20), b"local");
        detector.on_remote_record(SyncRecord::new(Tick::new(20), 1));
        assert!(detector.is_desynced());

        // later matching checksums change nothing
        let frozen_local = detector.local_record();
        let frozen_remote = detector.remote_record();
        assert_eq!(
            detector.on_synced_tick(Tick::new(30), b"later"),
            frozen_local
        );
        assert!(!detector.on_remote_record(SyncRecord::new(Tick::new(30), crc32(b"later"))));
        assert_eq!(detector.local_record(), frozen_local);
        assert_eq!(detector.remote_record(), frozen_remote);
        assert!(detector.check());
        assert!(detector.is_desynced());
    }

    #[test]
    fn stale_remote_records_are_ignored() {
        let mut detector = detector();
        assert!(detector.on_remote_record(SyncRecord::new(Tick::new(30), 5)));
        assert!(!detector.on_remote_record(SyncRecord::new(Tick::new(30), 6)));
        assert!(!detector.on_remote_record(SyncRecord::new(Tick::new(20), 7)));
        assert_eq!(
            detector.remote_record(),
            Some(SyncRecord::new(Tick::new(30), 5))
        );
    }

    #[test]
    fn zero_interval_is_treated_as_every_tick() {
        let detector = DesyncDetector::new(DesyncDetection::On { interval: 0 });
        assert!(detector.is_check_tick(Tick::new(3)));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: once desynced, no sequence of events clears the flag
            #[test]
            fn desync_never_resets(
                events in proptest::collection::vec((any::<bool>(), 0_i64..100, any::<u32>()), 0..50)
            ) {
                let mut detector = detector();
                detector.on_synced_tick(Tick::new(0), b"a");
                detector.on_remote_record(SyncRecord::new(Tick::new(0), crc32(b"b")));
                prop_assert!(detector.is_desynced());
                for (local, tick, value) in events {
                    if local {
                        detector.on_synced_tick(Tick::new(tick), &value.to_le_bytes());
                    } else {
                        detector.on_remote_record(SyncRecord::new(Tick::new(tick), value));
                    }
                    prop_assert!(detector.is_desynced());
                }
            }

            /// Property: a remote record never replaces a newer one
            #[test]
            fn remote_tick_never_decreases(ticks in proptest::collection::vec(0_i64..100, 0..50)) {
                let mut detector = detector();
                let mut newest: Option<Tick> = None;
                for tick in ticks {
                    detector.on_remote_record(SyncRecord::new(Tick::new(tick), 0));
                    let stored = detector.remote_record().map(|r| r.tick);
                    prop_assert!(stored >= newest);
                    newest = stored;
                }
            }
        }
    }
}
