use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::{Port, Tick};

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), NetplayError>`].
///
/// [`Result<(), NetplayError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetplayError {
    /// A configuration value is out of range or inconsistent with another one.
    InvalidConfig {
        /// Further specifies why the configuration was rejected.
        info: String,
    },
    /// A port was rejected, usually because local and remote port are the same.
    InvalidPort {
        /// The offending port.
        port: Port,
        /// A description of why the port was rejected.
        info: String,
    },
    /// Both peers computed different checksums for the same tick. This is permanent:
    /// the session refuses to advance and must be torn down by the host.
    Desynced {
        /// The tick both checksums were taken at.
        tick: Tick,
        /// The checksum computed locally.
        local_checksum: u32,
        /// The checksum reported by the peer.
        remote_checksum: u32,
    },
    /// Serialization or deserialization of data failed.
    SerializationError {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// A network socket operation failed.
    SocketError {
        /// A description of the socket error.
        context: String,
    },
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetplayError::InvalidConfig { info } => {
                write!(f, "Invalid configuration: {}", info)
            },
            NetplayError::InvalidPort { port, info } => {
                write!(f, "Invalid port {}: {}", port, info)
            },
            NetplayError::Desynced {
                tick,
                local_checksum,
                remote_checksum,
            } => {
                write!(
                    f,
                    "Peers desynced at tick {}: local checksum {:#010x}, remote checksum {:#010x}",
                    tick, local_checksum, remote_checksum
                )
            },
            NetplayError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            },
            NetplayError::SocketError { context } => {
                write!(f, "Socket error: {}", context)
            },
        }
    }
}

impl Error for NetplayError {}

impl From<CodecError> for NetplayError {
    fn from(err: CodecError) -> Self {
        NetplayError::SerializationError {
            context: err.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_details() {
        let err = NetplayError::InvalidConfig {
            info: "history_size too small".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid configuration: history_size too small"
        );

        let err = NetplayError::InvalidPort {
            port: Port::new(1),
            info: "same as local port".to_owned(),
        };
        assert_eq!(err.to_string(), "Invalid port 1: same as local port");
    }

    #[test]
    fn desynced_display_shows_hex_checksums() {
        let err = NetplayError::Desynced {
            tick: Tick::new(20),
            local_checksum: 0xdead_beef,
            remote_checksum: 0x1,
        };
        let text = err.to_string();
        assert!(text.contains("tick 20"));
        assert!(text.contains("0xdeadbeef"));
        assert!(text.contains("0x00000001"));
    }

    #[test]
    fn codec_errors_become_serialization_errors() {
        let err: NetplayError = CodecError::UnknownTag { tag: 0x7f }.into();
        match err {
            NetplayError::SerializationError { context } => assert!(context.contains("0x7f")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn error_trait_is_implemented() {
        fn assert_error<E: Error>(_: &E) {}
        assert_error(&NetplayError::SocketError {
            context: "closed".to_owned(),
        });
    }
}
