//! Error types for the conduit protocol engine.
//!
//! Every layer of the engine reports failures through [`ConduitError`]. The
//! variants follow the failure classes of an SSH session: malformed data,
//! integrity failures, negotiation failures, protocol-sequence violations,
//! argument errors, timeouts and session teardown.

use thiserror::Error;

/// Unified error type for all conduit operations
#[derive(Debug, Error)]
pub enum ConduitError {
    /// I/O error on the underlying byte stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Fewer bytes remain than a fixed-width field requires
    #[error("Truncated data: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes the field required
        needed: usize,
        /// Bytes remaining in the buffer
        available: usize,
    },

    /// Byte layout is invalid (bad length prefix, bad UTF-8, bad framing)
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// MAC or AEAD tag verification failed
    #[error("Integrity failure: {0}")]
    Integrity(String),

    /// No common algorithm or incompatible protocol version
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Message is valid in isolation but not in the current state
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Protocol violation scoped to a single channel
    #[error("Channel {channel} protocol error: {reason}")]
    ChannelProtocol {
        /// Local channel number
        channel: u32,
        /// What went wrong
        reason: String,
    },

    /// Message tag with no registered decoder
    #[error("Unknown message type: {0}")]
    UnknownMessage(u8),

    /// Invalid local construction, rejected before reaching the wire
    #[error("Invalid argument '{param}': {reason}")]
    InvalidArgument {
        /// Name of the offending parameter
        param: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// Operation did not complete within its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The session has been closed; no further operations are possible
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// The peer sent SSH_MSG_DISCONNECT
    #[error("Disconnected by peer (reason {reason_code}): {description}")]
    Disconnected {
        /// Disconnect reason code
        reason_code: u32,
        /// Human readable description
        description: String,
    },

    /// The peer refused to open a channel
    #[error("Channel open failed (reason {reason_code}): {description}")]
    ChannelOpenFailed {
        /// SSH_OPEN_* reason code
        reason_code: u32,
        /// Human readable description
        description: String,
    },

    /// Authentication failed or all methods were exhausted
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Cryptographic operation or host key check failed
    #[error("Security error: {0}")]
    Security(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Algorithm or feature not supported by this engine
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl ConduitError {
    /// Creates a [`ConduitError::InvalidArgument`].
    pub fn invalid_argument(param: &'static str, reason: impl Into<String>) -> Self {
        ConduitError::InvalidArgument {
            param,
            reason: reason.into(),
        }
    }

    /// Returns true if the error leaves the session unusable.
    ///
    /// Channel-scoped protocol errors, argument errors, timeouts and refused
    /// channel opens leave the session intact.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ConduitError::ChannelProtocol { .. }
                | ConduitError::InvalidArgument { .. }
                | ConduitError::Timeout(_)
                | ConduitError::ChannelOpenFailed { .. }
                | ConduitError::Config(_)
        )
    }

    /// Returns true for MAC/tag failures, which must never be retried.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, ConduitError::Integrity(_))
    }
}

/// Result type for conduit operations
pub type ConduitResult<T> = Result<T, ConduitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConduitError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );

        let err = ConduitError::invalid_argument("data", "buffer is required");
        assert_eq!(err.to_string(), "Invalid argument 'data': buffer is required");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ConduitError = io_err.into();
        assert!(matches!(err, ConduitError::Io(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fatality_classification() {
        assert!(ConduitError::Integrity("mac".into()).is_fatal());
        assert!(ConduitError::Integrity("mac".into()).is_integrity_failure());
        assert!(ConduitError::Truncated {
            needed: 4,
            available: 1
        }
        .is_fatal());
        assert!(!ConduitError::ChannelProtocol {
            channel: 3,
            reason: "unknown".into()
        }
        .is_fatal());
        assert!(!ConduitError::Timeout("send".into()).is_fatal());
    }

    #[test]
    fn test_result_type() {
        fn example() -> ConduitResult<i32> {
            Ok(42)
        }

        assert_eq!(example().unwrap(), 42);
    }
}
