//! Configuration for netplay sessions.
//!
//! | Preset | Input delay | Rollback window | History |
//! |--------|-------------|-----------------|---------|
//! | [`NetplayConfig::default`] | 5 | 10 | 60 |
//! | [`NetplayConfig::lan`] | 2 | 8 | 32 |
//! | [`NetplayConfig::high_latency`] | 8 | 15 | 60 |
//!
//! ```
//! use netplay_rollback::NetplayConfig;
//!
//! let config = NetplayConfig {
//!     input_delay_frames: 3,
//!     ..NetplayConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::{DesyncDetection, NetplayError};

/// Tunables of a [`P2PSession`](crate::P2PSession). Both peers must use identical values
/// for `input_delay_frames` and `send_history_size`.
///
/// # Forward Compatibility
///
/// New fields may be added to this struct in future versions. Construct it with the
/// `..NetplayConfig::default()` pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "NetplayConfig has no effect unless passed to SessionBuilder::with_config()"]
pub struct NetplayConfig {
    /// Ticks between polling a local input and simulating it. Hides one-way latency.
    ///
    /// Default: 5
    pub input_delay_frames: usize,
    /// How far the local tick may run ahead of the confirmed remote tick before the session
    /// stops advancing.
    ///
    /// Default: 10
    pub rollback_max_frames: usize,
    /// Capacity of each input history ring.
    ///
    /// Default: 60
    pub history_size: usize,
    /// Number of inputs carried by every input packet.
    ///
    /// Default: 5
    pub send_history_size: usize,
    /// Whether and how often confirmed states are checksummed and compared.
    ///
    /// Default: `On { interval: 10 }`
    pub desync_detection: DesyncDetection,
    /// How many copies of each checksum packet are sent.
    ///
    /// Default: 5
    pub sync_data_redundancy: usize,
}

impl Default for NetplayConfig {
    fn default() -> Self {
        Self {
            input_delay_frames: 5,
            rollback_max_frames: 10,
            history_size: 60,
            send_history_size: 5,
            desync_detection: DesyncDetection::On { interval: 10 },
            sync_data_redundancy: 5,
        }
    }
}

impl NetplayConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Short delay and a small window for peers on the same network.
    pub fn lan() -> Self {
        Self {
            input_delay_frames: 2,
            rollback_max_frames: 8,
            history_size: 32,
            ..Self::default()
        }
    }

    /// Long delay and a wide window for intercontinental links.
    pub fn high_latency() -> Self {
        Self {
            input_delay_frames: 8,
            rollback_max_frames: 15,
            history_size: 60,
            ..Self::default()
        }
    }

    /// Checks every constraint between the values.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidConfig`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), NetplayError> {
        let Self {
            input_delay_frames,
            rollback_max_frames,
            history_size,
            send_history_size,
            desync_detection,
            sync_data_redundancy,
        } = *self;

        if input_delay_frames < 1 {
            return Err(invalid(
                "input_delay_frames must be at least 1 (the first confirmed tick is 0)",
            ));
        }
        if send_history_size < 1 {
            return Err(invalid("send_history_size must be at least 1"));
        }
        if sync_data_redundancy < 1 {
            return Err(invalid("sync_data_redundancy must be at least 1"));
        }
        if desync_detection == (DesyncDetection::On { interval: 0 }) {
            return Err(invalid("desync detection interval must not be 0"));
        }
        if history_size < input_delay_frames + send_history_size {
            return Err(invalid(format!(
                "history_size ({history_size}) must be at least input_delay_frames + send_history_size ({})",
                input_delay_frames + send_history_size
            )));
        }
        let window = 2 * (rollback_max_frames + input_delay_frames) + 1;
        if history_size <= window {
            return Err(invalid(format!(
                "history_size ({history_size}) must exceed 2 * (rollback_max_frames + input_delay_frames) + 1 ({window})"
            )));
        }
        Ok(())
    }
}

fn invalid(info: impl Into<String>) -> NetplayError {
    NetplayError::InvalidConfig { info: info.into() }
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

    fn rejected(config: NetplayConfig) -> String {
        match config.validate() {
            Err(NetplayError::InvalidConfig { info }) => info,
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn defaults() {
        let config = NetplayConfig::default();
        assert_eq!(config.input_delay_frames, 5);
        assert_eq!(config.rollback_max_frames, 10);
        assert_eq!(config.history_size, 60);
        assert_eq!(config.send_history_size, 5);
        assert_eq!(config.desync_detection, DesyncDetection::On { interval: 10 });
        assert_eq!(config.sync_data_redundancy, 5);
        assert_eq!(config, NetplayConfig::new());
    }

    #[test]
    fn presets_are_valid() {
        for config in [
            NetplayConfig::default(),
            NetplayConfig::lan(),
            NetplayConfig::high_latency(),
        ] {
            config.validate().unwrap();
        }
    }

    #[test]
    fn zero_delay_is_rejected() {
        let info = rejected(NetplayConfig {
            input_delay_frames: 0,
            ..NetplayConfig::default()
        });
        assert!(info.contains("input_delay_frames"));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        rejected(NetplayConfig {
            send_history_size: 0,
            ..NetplayConfig::default()
        });
        rejected(NetplayConfig {
            sync_data_redundancy: 0,
            ..NetplayConfig::default()
        });
        rejected(NetplayConfig {
            desync_detection: DesyncDetection::On { interval: 0 },
            ..NetplayConfig::default()
        });
    }

    #[test]
    fn detection_off_is_valid() {
        NetplayConfig {
            desync_detection: DesyncDetection::Off,
            ..NetplayConfig::default()
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn history_must_cover_delay_and_send_window() {
        let info = rejected(NetplayConfig {
            input_delay_frames: 1,
            rollback_max_frames: 0,
            history_size: 5,
            send_history_size: 5,
            ..NetplayConfig::default()
        });
        assert!(info.contains("send_history_size"));
    }

    #[test]
    fn history_must_exceed_the_rollback_window() {
        // 2 * (10 + 5) + 1 = 31
        let info = rejected(NetplayConfig {
            history_size: 31,
            ..NetplayConfig::default()
        });
        assert!(info.contains("(31)"));
        NetplayConfig {
            history_size: 32,
            ..NetplayConfig::default()
        }
        .validate()
        .unwrap();
    }
}
