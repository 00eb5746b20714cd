//! Transport layer generic messages (RFC 4253 Sections 10 and 11).

use bytes::{Bytes, BytesMut};
use conduit_platform::ConduitResult;

use super::message::MessageBody;
use super::wire::{SshBufMut, WireReader};

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// Host not allowed to connect
    HostNotAllowedToConnect = 1,
    /// Protocol error
    ProtocolError = 2,
    /// Key exchange failed
    KeyExchangeFailed = 3,
    /// Reserved
    Reserved = 4,
    /// MAC error
    MacError = 5,
    /// Compression error
    CompressionError = 6,
    /// Service not available
    ServiceNotAvailable = 7,
    /// Protocol version not supported
    ProtocolVersionNotSupported = 8,
    /// Host key not verifiable
    HostKeyNotVerifiable = 9,
    /// Connection lost
    ConnectionLost = 10,
    /// Disconnected by application
    ByApplication = 11,
    /// Too many connections
    TooManyConnections = 12,
    /// Authentication cancelled by user
    AuthCancelledByUser = 13,
    /// No more authentication methods available
    NoMoreAuthMethodsAvailable = 14,
    /// Illegal user name
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Converts from the wire code.
    pub fn from_u32(value: u32) -> Option<Self> {
        use DisconnectReason::*;
        let reason = match value {
            1 => HostNotAllowedToConnect,
            2 => ProtocolError,
            3 => KeyExchangeFailed,
            4 => Reserved,
            5 => MacError,
            6 => CompressionError,
            7 => ServiceNotAvailable,
            8 => ProtocolVersionNotSupported,
            9 => HostKeyNotVerifiable,
            10 => ConnectionLost,
            11 => ByApplication,
            12 => TooManyConnections,
            13 => AuthCancelledByUser,
            14 => NoMoreAuthMethodsAvailable,
            15 => IllegalUserName,
            _ => return None,
        };
        Some(reason)
    }
}

/// SSH_MSG_DISCONNECT (RFC 4253 Section 11.1).
///
/// ```text
/// byte      SSH_MSG_DISCONNECT
/// uint32    reason code
/// string    description in ISO-10646 UTF-8 encoding
/// string    language tag
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code, see [`DisconnectReason`]
    pub reason_code: u32,
    /// Human readable description
    pub description: String,
    /// RFC 3066 language tag
    pub language: String,
}

impl Disconnect {
    /// Creates a disconnect message with an empty language tag.
    pub fn new(reason: DisconnectReason, description: impl Into<String>) -> Self {
        Self {
            reason_code: reason as u32,
            description: description.into(),
            language: String::new(),
        }
    }

    /// Returns the reason if it is a known code.
    pub fn reason(&self) -> Option<DisconnectReason> {
        DisconnectReason::from_u32(self.reason_code)
    }
}

impl MessageBody for Disconnect {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_ssh_u32(self.reason_code);
        buf.put_ssh_utf8(&self.description);
        buf.put_ssh_utf8(&self.language);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let msg = Self {
            reason_code: r.read_u32()?,
            description: r.read_utf8()?,
            language: r.read_utf8()?,
        };
        r.finish("SSH_MSG_DISCONNECT")?;
        Ok(msg)
    }
}

/// SSH_MSG_IGNORE: arbitrary data the receiver must discard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ignore {
    /// Filler data
    pub data: Bytes,
}

impl MessageBody for Ignore {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_ssh_string(&self.data);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let data = r.read_string()?;
        r.finish("SSH_MSG_IGNORE")?;
        Ok(Self { data })
    }
}

/// SSH_MSG_UNIMPLEMENTED: reply to a message the peer did not recognise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unimplemented {
    /// Sequence number of the rejected packet
    pub sequence: u32,
}

impl MessageBody for Unimplemented {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_ssh_u32(self.sequence);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let sequence = r.read_u32()?;
        r.finish("SSH_MSG_UNIMPLEMENTED")?;
        Ok(Self { sequence })
    }
}

/// SSH_MSG_DEBUG
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    /// Whether the client should display the message
    pub always_display: bool,
    /// Debug text
    pub message: String,
    /// Language tag
    pub language: String,
}

impl MessageBody for DebugMessage {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_ssh_bool(self.always_display);
        buf.put_ssh_utf8(&self.message);
        buf.put_ssh_utf8(&self.language);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let msg = Self {
            always_display: r.read_bool()?,
            message: r.read_utf8()?,
            language: r.read_utf8()?,
        };
        r.finish("SSH_MSG_DEBUG")?;
        Ok(msg)
    }
}

/// SSH_MSG_SERVICE_REQUEST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Service name, e.g. `ssh-userauth`
    pub service: String,
}

impl MessageBody for ServiceRequest {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_ssh_utf8(&self.service);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let service = r.read_utf8()?;
        r.finish("SSH_MSG_SERVICE_REQUEST")?;
        Ok(Self { service })
    }
}

/// SSH_MSG_SERVICE_ACCEPT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccept {
    /// Accepted service name
    pub service: String,
}

impl MessageBody for ServiceAccept {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_ssh_utf8(&self.service);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let service = r.read_utf8()?;
        r.finish("SSH_MSG_SERVICE_ACCEPT")?;
        Ok(Self { service })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::message::Message;
    use conduit_platform::ConduitError;

    #[test]
    fn test_disconnect_wire_layout() {
        let msg = Message::Disconnect(Disconnect::new(DisconnectReason::MacError, "bad mac"));
        let wire = msg.encode();
        assert_eq!(
            &wire[..],
            b"\x01\x00\x00\x00\x05\x00\x00\x00\x07bad mac\x00\x00\x00\x00"
        );
    }

    #[test]
    fn test_disconnect_reason_codes() {
        assert_eq!(DisconnectReason::from_u32(11), Some(DisconnectReason::ByApplication));
        assert_eq!(DisconnectReason::from_u32(99), None);

        let d = Disconnect {
            reason_code: 99,
            description: String::new(),
            language: String::new(),
        };
        assert_eq!(d.reason(), None);
    }

    #[test]
    fn test_debug_message_round_trip() {
        let msg = Message::Debug(DebugMessage {
            always_display: true,
            message: "hello".into(),
            language: "en".into(),
        });
        assert_eq!(Message::decode(msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_service_accept_truncated() {
        // Declares 12 bytes of service name but carries 4
        let result = Message::decode(Bytes::from_static(b"\x06\x00\x00\x00\x0cssh-"));
        assert!(matches!(result, Err(ConduitError::InvalidFormat(_))));
    }

    #[test]
    fn test_unimplemented_truncated() {
        let result = Message::decode(Bytes::from_static(b"\x03\x00\x00"));
        assert!(matches!(result, Err(ConduitError::Truncated { .. })));
    }
}
