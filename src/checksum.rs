//! State checksum utilities for desync detection.
//!
//! Peers periodically exchange a checksum of their confirmed simulation state. The
//! checksum is the standard CRC-32 (IEEE 802.3, reflected, polynomial `0xEDB88320`) of
//! the bytes returned by [`Simulation::serialize`](crate::Simulation::serialize), so two
//! peers agree exactly when their serialized states are byte-identical.
//!
//! # Determinism Requirements
//!
//! - Same state → same serialized bytes → same checksum
//! - Serialization must be platform-independent (fixed-size integers)
//!
//! ```
//! use netplay_rollback::checksum::crc32;
//!
//! assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
//! ```
//!
//! For states that implement `serde::Serialize`, [`compute_checksum`] serializes through
//! the crate's bincode codec and hashes the result:
//!
//! ```
//! use netplay_rollback::checksum::compute_checksum;
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct GameState {
//!     frame: u32,
//!     player_x: i32,
//! }
//!
//! let state = GameState { frame: 100, player_x: -4 };
//! let checksum = compute_checksum(&state).expect("serialization should succeed");
//! assert_eq!(checksum, compute_checksum(&state).expect("serialization should succeed"));
//! ```

use serde::Serialize;

use crate::network::codec::{encode, CodecError};

const CRC32_POLYNOMIAL: u32 = 0xEDB8_8320;

const CRC32_TABLE: [u32; 256] = build_crc32_table();

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0_u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ CRC32_POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Computes the CRC-32 of a byte slice.
///
/// # Example
///
/// ```
/// use netplay_rollback::checksum::crc32;
///
/// assert_eq!(crc32(b""), 0);
/// assert_eq!(crc32(b"some state"), crc32(b"some state"));
/// ```
#[inline]
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xff) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

/// Computes the CRC-32 checksum of a serializable state.
///
/// The state is serialized with bincode (fixed-integer encoding) first, so the result
/// is identical across platforms.
pub fn compute_checksum<T: Serialize>(state: &T) -> Result<u32, ChecksumError> {
    let bytes = encode(state)?;
    Ok(crc32(&bytes))
}

/// Errors that can occur during checksum computation.
#[derive(Debug)]
pub enum ChecksumError {
    /// Serialization of the state failed.
    SerializationFailed(String),
}

impl From<CodecError> for ChecksumError {
    fn from(err: CodecError) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

impl std::fmt::Display for ChecksumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationFailed(msg) => write!(f, "checksum failed: {msg}"),
        }
    }
}

impl std::error::Error for ChecksumError {}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    struct TestState {
        frame: u32,
        position: (i32, i32),
        name: String,
    }

    #[test]
    fn crc32_known_vectors() {
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32(b"a"), 0xE8B7_BE43);
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(
            crc32(b"The quick brown fox jumps over the lazy dog"),
            0x414F_A339
        );
    }

    #[test]
    fn crc32_table_edges() {
        assert_eq!(CRC32_TABLE[0], 0);
        assert_eq!(CRC32_TABLE[1], 0x7707_3096);
        assert_eq!(CRC32_TABLE[255], 0x2D02_EF8D);
    }

    #[test]
    fn crc32_detects_single_bit_flip() {
        let mut data = vec![0_u8; 64];
        let before = crc32(&data);
        data[17] ^= 0x04;
        assert_ne!(before, crc32(&data));
    }

    #[test]
    fn compute_checksum_deterministic() {
        let state = TestState {
            frame: 100,
            position: (3, -7),
            name: "p1".to_owned(),
        };
        assert_eq!(
            compute_checksum(&state).unwrap(),
            compute_checksum(&state.clone()).unwrap()
        );
    }

    #[test]
    fn compute_checksum_matches_crc_of_encoding() {
        let state = TestState {
            frame: 1,
            position: (0, 0),
            name: String::new(),
        };
        let bytes = encode(&state).unwrap();
        assert_eq!(compute_checksum(&state).unwrap(), crc32(&bytes));
    }

    #[test]
    fn compute_checksum_different_states() {
        let a = TestState {
            frame: 1,
            position: (0, 0),
            name: "x".to_owned(),
        };
        let b = TestState { frame: 2, ..a.clone() };
        assert_ne!(compute_checksum(&a).unwrap(), compute_checksum(&b).unwrap());
    }

    #[test]
    fn checksum_error_display() {
        let err = ChecksumError::SerializationFailed("boom".to_owned());
        assert_eq!(err.to_string(), "checksum failed: boom");
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: crc32 is deterministic for any input
        #[test]
        fn prop_crc32_deterministic(data in any::<Vec<u8>>()) {
            prop_assert_eq!(crc32(&data), crc32(&data.clone()));
        }

        /// Property: appending the little-endian CRC of a message yields the CRC-32 residue
        #[test]
        fn prop_crc32_residue(data in any::<Vec<u8>>()) {
            let mut framed = data.clone();
            framed.extend_from_slice(&crc32(&data).to_le_bytes());
            prop_assert_eq!(crc32(&framed), 0x2144_DF1C);
        }
    }
}
