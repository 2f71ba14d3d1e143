//! Binary codecs used by the session.
//!
//! Two formats live here:
//!
//! - **The packet layout.** Every [`Packet`] has a fixed little-endian layout with one
//!   leading tag byte. This layout is the protocol: both peers must agree on it byte for
//!   byte, so it is written by hand rather than derived.
//!
//!   | tag    | packet        | payload                                            |
//!   |--------|---------------|----------------------------------------------------|
//!   | `0x01` | `Handshake`   | none                                               |
//!   | `0x02` | `PlayerInput` | `i32` tick delta, `i64` received tick, `n` × `u32`  |
//!   | `0x03` | `Ping`        | `i64` time                                         |
//!   | `0x04` | `Pong`        | `i64` time                                         |
//!   | `0x05` | `SyncData`    | `i64` tick, `u32` checksum                          |
//!
//! - **bincode helpers** ([`encode`], [`decode`], ...) with one centralized configuration,
//!   used to checksum serde states and by simulations that serialize serde state.
//!
//! # Examples
//!
//! ```
//! use netplay_rollback::network::codec::{decode_packet, encode_packet};
//! use netplay_rollback::Packet;
//!
//! let bytes = encode_packet(&Packet::Ping { time: 1234 });
//! assert_eq!(bytes.len(), 9);
//! assert_eq!(decode_packet(&bytes).expect("valid packet"), Packet::Ping { time: 1234 });
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use crate::input::EncodedInput;
use crate::input_history::InputWindow;
use crate::network::messages::{
    Packet, PlayerInput, SyncRecord, TAG_HANDSHAKE, TAG_PING, TAG_PLAYER_INPUT, TAG_PONG,
    TAG_SYNC_DATA,
};
use crate::Tick;

// Fixed-size integers keep encodings deterministic and identical on every platform.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Size of the fixed part of a `PlayerInput` packet: tag, tick delta and received tick.
pub const PLAYER_INPUT_HEADER_LEN: usize = 1 + 4 + 8;

/// Represents what operation was being performed when a codec error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Decoding a packet from the wire.
    DecodePacket,
    /// Encoding into a buffer.
    EncodeIntoBuffer,
    /// Appending to a buffer.
    AppendToBuffer,
    /// A generic encoding operation.
    Encode,
    /// A generic decoding operation.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DecodePacket => write!(f, "decoding packet"),
            Self::EncodeIntoBuffer => write!(f, "encoding into buffer"),
            Self::AppendToBuffer => write!(f, "appending to buffer"),
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode failures carry the library's message as a `String`; its error types do not
/// expose structured reasons. Packet layout failures are structured.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The provided buffer was too small.
    BufferTooSmall {
        /// The required buffer size (0 if unknown).
        required: usize,
        /// The actual buffer size provided.
        provided: usize,
    },
    /// The packet starts with a byte that is not a known tag.
    UnknownTag {
        /// The offending byte.
        tag: u8,
    },
    /// The packet is longer than its layout allows, or its input section is not a whole
    /// number of inputs.
    LengthMismatch {
        /// The packet's tag.
        tag: u8,
        /// The expected length, or the input-section granularity for `PlayerInput`.
        expected: usize,
        /// The actual length.
        actual: usize,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::BufferTooSmall { required, provided } => {
                if *required > 0 {
                    write!(
                        f,
                        "buffer too small: needed {required} bytes, but only {provided} provided"
                    )
                } else {
                    write!(f, "buffer too small: only {provided} bytes provided")
                }
            },
            Self::UnknownTag { tag } => write!(f, "unknown packet tag {tag:#04x}"),
            Self::LengthMismatch {
                tag,
                expected,
                actual,
            } => write!(
                f,
                "packet {tag:#04x} has length {actual}, layout expects {expected}"
            ),
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

// =============================================================================
// Packet layout
// =============================================================================

/// Exact encoded length of `packet`.
#[must_use]
pub fn packet_len(packet: &Packet) -> usize {
    match packet {
        Packet::Handshake => 1,
        Packet::PlayerInput(input) => PLAYER_INPUT_HEADER_LEN + 4 * input.inputs.len(),
        Packet::Ping { .. } | Packet::Pong { .. } => 1 + 8,
        Packet::SyncData(_) => 1 + 8 + 4,
    }
}

/// Encodes `packet` into a new buffer.
#[must_use]
pub fn encode_packet(packet: &Packet) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(packet_len(packet));
    encode_packet_append(packet, &mut buffer);
    buffer
}

/// Appends the encoding of `packet` to `buffer`, returning the number of bytes written.
pub fn encode_packet_append(packet: &Packet, buffer: &mut Vec<u8>) -> usize {
    let start_len = buffer.len();
    buffer.push(packet.tag());
    match packet {
        Packet::Handshake => {},
        Packet::PlayerInput(input) => {
            buffer.extend_from_slice(&input.tick_delta.to_le_bytes());
            buffer.extend_from_slice(&input.received_tick.as_i64().to_le_bytes());
            for encoded in &input.inputs {
                buffer.extend_from_slice(&encoded.bits().to_le_bytes());
            }
        },
        Packet::Ping { time } | Packet::Pong { time } => {
            buffer.extend_from_slice(&time.to_le_bytes());
        },
        Packet::SyncData(record) => {
            buffer.extend_from_slice(&record.tick.as_i64().to_le_bytes());
            buffer.extend_from_slice(&record.checksum.to_le_bytes());
        },
    }
    buffer.len() - start_len
}

/// Reads little-endian fields off the front of a packet.
struct Reader<'a> {
    bytes: &'a [u8],
    total: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            total: bytes.len(),
        }
    }

    fn take<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        match self.bytes.split_first_chunk::<N>() {
            Some((chunk, rest)) => {
                self.bytes = rest;
                Ok(*chunk)
            },
            None => Err(CodecError::BufferTooSmall {
                required: self.total - self.bytes.len() + N,
                provided: self.total,
            }),
        }
    }

    fn u8(&mut self) -> CodecResult<u8> {
        self.take::<1>().map(|[b]| b)
    }

    fn i32(&mut self) -> CodecResult<i32> {
        self.take().map(i32::from_le_bytes)
    }

    fn u32(&mut self) -> CodecResult<u32> {
        self.take().map(u32::from_le_bytes)
    }

    fn i64(&mut self) -> CodecResult<i64> {
        self.take().map(i64::from_le_bytes)
    }

    fn remaining(&self) -> usize {
        self.bytes.len()
    }

    fn finish(self, tag: u8, packet: Packet) -> CodecResult<Packet> {
        if self.bytes.is_empty() {
            Ok(packet)
        } else {
            Err(CodecError::LengthMismatch {
                tag,
                expected: self.total - self.bytes.len(),
                actual: self.total,
            })
        }
    }
}

/// Decodes one packet. The whole slice must be consumed.
///
/// A `PlayerInput` takes as many inputs as the remaining bytes hold; the session checks
/// the count against its configured window size.
pub fn decode_packet(bytes: &[u8]) -> CodecResult<Packet> {
    let mut reader = Reader::new(bytes);
    let tag = reader.u8()?;
    let packet = match tag {
        TAG_HANDSHAKE => Packet::Handshake,
        TAG_PLAYER_INPUT => {
            let tick_delta = reader.i32()?;
            let received_tick = Tick::new(reader.i64()?);
            let remaining = reader.remaining();
            if remaining % 4 != 0 {
                return Err(CodecError::LengthMismatch {
                    tag,
                    expected: 4,
                    actual: bytes.len(),
                });
            }
            let mut inputs = InputWindow::with_capacity(remaining / 4);
            for _ in 0..remaining / 4 {
                inputs.push(EncodedInput::from_bits(reader.u32()?));
            }
            Packet::PlayerInput(PlayerInput {
                tick_delta,
                received_tick,
                inputs,
            })
        },
        TAG_PING => Packet::Ping { time: reader.i64()? },
        TAG_PONG => Packet::Pong { time: reader.i64()? },
        TAG_SYNC_DATA => {
            let tick = Tick::new(reader.i64()?);
            let checksum = reader.u32()?;
            Packet::SyncData(SyncRecord::new(tick, checksum))
        },
        other => return Err(CodecError::UnknownTag { tag: other }),
    };
    reader.finish(tag, packet)
}

// =============================================================================
// bincode helpers
// =============================================================================

/// Encodes a value into a new `Vec<u8>`.
///
/// # Examples
///
/// ```
/// use netplay_rollback::network::codec::encode;
///
/// let data: u32 = 42;
/// let bytes = encode(&data).expect("encoding should succeed");
/// assert_eq!(bytes, 42_u32.to_le_bytes());
/// ```
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Encodes a value into an existing byte slice, returning the number of bytes written.
///
/// # Errors
///
/// Returns [`CodecError::BufferTooSmall`] if the buffer is not large enough.
pub fn encode_into<T: Serialize>(value: &T, buffer: &mut [u8]) -> CodecResult<usize> {
    bincode::serde::encode_into_slice(value, buffer, config()).map_err(|e| match e {
        bincode::error::EncodeError::UnexpectedEnd => CodecError::BufferTooSmall {
            required: 0, // bincode doesn't tell us the required size
            provided: buffer.len(),
        },
        other => CodecError::encode(other.to_string(), CodecOperation::EncodeIntoBuffer),
    })
}

/// Encodes a value by appending to an existing `Vec<u8>`.
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::AppendToBuffer))
}

/// Decodes a value from a byte slice, returning it with the number of bytes consumed.
///
/// # Examples
///
/// ```
/// use netplay_rollback::network::codec::{encode, decode};
///
/// let original: u32 = 42;
/// let bytes = encode(&original).expect("encoding should succeed");
/// let (decoded, bytes_read): (u32, _) = decode(&bytes).expect("decoding should succeed");
/// assert_eq!(original, decoded);
/// assert_eq!(bytes_read, bytes.len());
/// ```
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Decodes a value from a byte slice, ignoring the bytes consumed.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
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

    fn player_input(tick_delta: i32, received_tick: i64, bits: &[u32]) -> Packet {
        Packet::PlayerInput(PlayerInput {
            tick_delta,
            received_tick: Tick::new(received_tick),
            inputs: bits.iter().copied().map(EncodedInput::from_bits).collect(),
        })
    }

    #[test]
    fn test_handshake_is_a_single_byte() {
        assert_eq!(encode_packet(&Packet::Handshake), vec![0x01]);
        assert_eq!(decode_packet(&[0x01]).unwrap(), Packet::Handshake);
    }

    #[test]
    fn test_player_input_layout() {
        let packet = player_input(-2, 0x0102, &[1, 2, 3, 4, 0x21]);
        let bytes = encode_packet(&packet);
        let mut expected = vec![0x02];
        expected.extend_from_slice(&[0xfe, 0xff, 0xff, 0xff]);
        expected.extend_from_slice(&[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        for bits in [1_u32, 2, 3, 4, 0x21] {
            expected.extend_from_slice(&bits.to_le_bytes());
        }
        assert_eq!(bytes, expected);
        assert_eq!(bytes.len(), 33);
        assert_eq!(packet_len(&packet), 33);
        assert_eq!(decode_packet(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_ping_pong_layout() {
        let ping = encode_packet(&Packet::Ping { time: 1 });
        assert_eq!(ping, vec![0x03, 1, 0, 0, 0, 0, 0, 0, 0]);
        let pong = encode_packet(&Packet::Pong { time: -1 });
        assert_eq!(pong, vec![0x04, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(decode_packet(&pong).unwrap(), Packet::Pong { time: -1 });
    }

    #[test]
    fn test_sync_data_layout() {
        let packet = Packet::SyncData(SyncRecord::new(Tick::new(20), 0xcbf4_3926));
        let bytes = encode_packet(&packet);
        assert_eq!(
            bytes,
            vec![0x05, 20, 0, 0, 0, 0, 0, 0, 0, 0x26, 0x39, 0xf4, 0xcb]
        );
        assert_eq!(decode_packet(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_empty_and_unknown() {
        assert!(matches!(
            decode_packet(&[]),
            Err(CodecError::BufferTooSmall { .. })
        ));
        assert_eq!(
            decode_packet(&[0x7f, 1, 2]),
            Err(CodecError::UnknownTag { tag: 0x7f })
        );
        // the JSON form of a handshake is not a packet
        assert!(decode_packet(br#"{"code":1}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_packets() {
        let bytes = encode_packet(&Packet::SyncData(SyncRecord::new(Tick::new(5), 9)));
        for len in 1..bytes.len() {
            assert!(
                matches!(
                    decode_packet(&bytes[..len]),
                    Err(CodecError::BufferTooSmall { .. })
                ),
                "length {len} should be too short"
            );
        }
        assert!(decode_packet(&[0x02, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        assert_eq!(
            decode_packet(&[0x01, 0x00]),
            Err(CodecError::LengthMismatch {
                tag: 0x01,
                expected: 1,
                actual: 2
            })
        );
        let mut ping = encode_packet(&Packet::Ping { time: 3 });
        ping.push(0);
        assert!(matches!(
            decode_packet(&ping),
            Err(CodecError::LengthMismatch { tag: 0x03, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_partial_input() {
        let mut bytes = encode_packet(&player_input(0, 4, &[1, 2]));
        bytes.pop();
        assert!(matches!(
            decode_packet(&bytes),
            Err(CodecError::LengthMismatch { tag: 0x02, .. })
        ));
    }

    #[test]
    fn test_encode_append_reports_written_bytes() {
        let mut buffer = vec![0xaa];
        let written = encode_packet_append(&Packet::Ping { time: 7 }, &mut buffer);
        assert_eq!(written, 9);
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer[1], 0x03);
    }

    #[test]
    fn test_bincode_roundtrip_primitive() {
        let original: u32 = 12345;
        let bytes = encode(&original).unwrap();
        let (decoded, len): (u32, _) = decode(&bytes).unwrap();
        assert_eq!(original, decoded);
        assert_eq!(len, bytes.len());
        assert_eq!(decode_value::<u32>(&bytes).unwrap(), original);
    }

    #[test]
    fn test_bincode_fixed_int_encoding() {
        assert_eq!(encode(&1_u64).unwrap().len(), 8);
        assert_eq!(encode(&Tick::new(1)).unwrap(), 1_i64.to_le_bytes());
    }

    #[test]
    fn test_encode_into_buffer_too_small() {
        let mut buffer = [0_u8; 2];
        assert_eq!(
            encode_into(&7_u64, &mut buffer),
            Err(CodecError::BufferTooSmall {
                required: 0,
                provided: 2
            })
        );
        let mut buffer = [0_u8; 16];
        assert_eq!(encode_into(&7_u64, &mut buffer).unwrap(), 8);
    }

    #[test]
    fn test_encode_append() {
        let mut buffer = Vec::new();
        assert_eq!(encode_append(&42_u32, &mut buffer).unwrap(), 4);
        assert_eq!(encode_append(&1_u8, &mut buffer).unwrap(), 1);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_decode_invalid_data() {
        let result: CodecResult<(u64, usize)> = decode(&[1, 2]);
        assert!(matches!(result, Err(CodecError::DecodeError { .. })));
    }

    #[test]
    fn test_codec_error_display() {
        assert_eq!(
            CodecError::UnknownTag { tag: 0x7f }.to_string(),
            "unknown packet tag 0x7f"
        );
        assert_eq!(
            CodecError::BufferTooSmall {
                required: 13,
                provided: 4
            }
            .to_string(),
            "buffer too small: needed 13 bytes, but only 4 provided"
        );
        assert_eq!(
            CodecError::decode("eof", CodecOperation::DecodePacket).to_string(),
            "decoding failed while decoding packet: eof"
        );
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: decoding arbitrary bytes never panics
            #[test]
            fn decode_arbitrary_bytes_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
                let _ = decode_packet(&bytes);
            }

            /// Property: a decoded PlayerInput re-encodes to the same bytes
            #[test]
            fn player_input_reencodes_identically(
                tick_delta in any::<i32>(),
                tick in any::<i64>(),
                bits in proptest::collection::vec(any::<u32>(), 0..12),
            ) {
                let bytes = encode_packet(&player_input(tick_delta, tick, &bits));
                let decoded = decode_packet(&bytes).unwrap();
                prop_assert_eq!(encode_packet(&decoded), bytes);
            }
        }
    }
}
