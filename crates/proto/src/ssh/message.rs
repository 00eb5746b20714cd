//! SSH protocol messages and the message registry (RFC 4253 Section 12).
//!
//! Every message the engine understands is one variant of the closed
//! [`Message`] sum type. The one-byte tag of each variant is fixed; the
//! registry maps an incoming tag to the decoder of its variant.
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication Generic** (50-59): Authentication protocol
//! - **User Authentication Method Specific** (60-79): Shared between methods
//! - **Connection Protocol** (80-127): Global requests and channels
//!
//! # Example
//!
//! ```rust
//! use conduit_proto::ssh::message::{Message, MessageType};
//! use conduit_proto::ssh::connection::ChannelEof;
//!
//! let msg = Message::ChannelEof(ChannelEof { recipient_channel: 3 });
//! let wire = msg.encode();
//! assert_eq!(wire[0], MessageType::ChannelEof as u8);
//! assert_eq!(Message::decode(wire).unwrap(), msg);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use conduit_platform::{ConduitError, ConduitResult};

use super::auth::{UserauthBanner, UserauthFailure, UserauthRequest};
use super::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest, ChannelSuccess,
    ChannelWindowAdjust, GlobalRequest, RequestSuccess,
};
use super::generic::{DebugMessage, Disconnect, Ignore, ServiceAccept, ServiceRequest, Unimplemented};
use super::kex::{KexEcdhInit, KexEcdhReply, KexInit};
use super::wire::WireReader;

/// SSH message types as defined in RFC 4253 Section 12.
///
/// Each message type has a unique numeric identifier used in the binary protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - can be used for padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// ECDH key exchange init.
    KexEcdhInit = 30,
    /// ECDH key exchange reply.
    KexEcdhReply = 31,

    // User authentication generic (50-59)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// Method-specific user authentication tags (60-79) have no fixed
    /// meaning and return `None`.
    ///
    /// ```rust
    /// use conduit_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexEcdhInit),
            31 => Some(MessageType::KexEcdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the message type name.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexEcdhInit => "SSH_MSG_KEX_ECDH_INIT",
            MessageType::KexEcdhReply => "SSH_MSG_KEX_ECDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Protocol layer a message number belongs to (RFC 4250 Section 4.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    /// 1-19: disconnect, ignore, debug, service request
    TransportGeneric,
    /// 20-29: KEXINIT, NEWKEYS
    AlgorithmNegotiation,
    /// 30-49: key exchange method specific
    KeyExchange,
    /// 50-59: user authentication generic
    UserauthGeneric,
    /// 60-79: user authentication method specific
    UserauthMethodSpecific,
    /// 80-127: global requests and channels
    Connection,
    /// 128-191: reserved for client protocols
    Reserved,
    /// 192-255: local extensions
    LocalExtension,
    /// 0 is never a valid message number
    Invalid,
}

impl MessageCategory {
    /// Classifies a message number.
    pub fn of(tag: u8) -> Self {
        match tag {
            0 => MessageCategory::Invalid,
            1..=19 => MessageCategory::TransportGeneric,
            20..=29 => MessageCategory::AlgorithmNegotiation,
            30..=49 => MessageCategory::KeyExchange,
            50..=59 => MessageCategory::UserauthGeneric,
            60..=79 => MessageCategory::UserauthMethodSpecific,
            80..=127 => MessageCategory::Connection,
            128..=191 => MessageCategory::Reserved,
            192..=255 => MessageCategory::LocalExtension,
        }
    }
}

/// Payload layout of a message variant, excluding the type byte.
pub trait MessageBody: Sized {
    /// Appends the variant fields to `buf`.
    fn encode_body(&self, buf: &mut BytesMut);

    /// Decodes the variant fields, consuming the whole reader.
    fn decode_body(r: &mut WireReader) -> ConduitResult<Self>;
}

/// Every message the engine can send or receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// SSH_MSG_DISCONNECT
    Disconnect(Disconnect),
    /// SSH_MSG_IGNORE
    Ignore(Ignore),
    /// SSH_MSG_UNIMPLEMENTED
    Unimplemented(Unimplemented),
    /// SSH_MSG_DEBUG
    Debug(DebugMessage),
    /// SSH_MSG_SERVICE_REQUEST
    ServiceRequest(ServiceRequest),
    /// SSH_MSG_SERVICE_ACCEPT
    ServiceAccept(ServiceAccept),
    /// SSH_MSG_KEXINIT
    KexInit(KexInit),
    /// SSH_MSG_NEWKEYS
    NewKeys,
    /// SSH_MSG_KEX_ECDH_INIT
    KexEcdhInit(KexEcdhInit),
    /// SSH_MSG_KEX_ECDH_REPLY
    KexEcdhReply(KexEcdhReply),
    /// SSH_MSG_USERAUTH_REQUEST
    UserauthRequest(UserauthRequest),
    /// SSH_MSG_USERAUTH_FAILURE
    UserauthFailure(UserauthFailure),
    /// SSH_MSG_USERAUTH_SUCCESS
    UserauthSuccess,
    /// SSH_MSG_USERAUTH_BANNER
    UserauthBanner(UserauthBanner),
    /// Tags 60-79, interpreted by the active authentication method
    UserauthMethodSpecific {
        /// Message number (60-79)
        tag: u8,
        /// Raw payload after the type byte
        body: Bytes,
    },
    /// SSH_MSG_GLOBAL_REQUEST
    GlobalRequest(GlobalRequest),
    /// SSH_MSG_REQUEST_SUCCESS
    RequestSuccess(RequestSuccess),
    /// SSH_MSG_REQUEST_FAILURE
    RequestFailure,
    /// SSH_MSG_CHANNEL_OPEN
    ChannelOpen(ChannelOpen),
    /// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
    ChannelOpenConfirmation(ChannelOpenConfirmation),
    /// SSH_MSG_CHANNEL_OPEN_FAILURE
    ChannelOpenFailure(ChannelOpenFailure),
    /// SSH_MSG_CHANNEL_WINDOW_ADJUST
    ChannelWindowAdjust(ChannelWindowAdjust),
    /// SSH_MSG_CHANNEL_DATA
    ChannelData(ChannelData),
    /// SSH_MSG_CHANNEL_EXTENDED_DATA
    ChannelExtendedData(ChannelExtendedData),
    /// SSH_MSG_CHANNEL_EOF
    ChannelEof(ChannelEof),
    /// SSH_MSG_CHANNEL_CLOSE
    ChannelClose(ChannelClose),
    /// SSH_MSG_CHANNEL_REQUEST
    ChannelRequest(ChannelRequest),
    /// SSH_MSG_CHANNEL_SUCCESS
    ChannelSuccess(ChannelSuccess),
    /// SSH_MSG_CHANNEL_FAILURE
    ChannelFailure(ChannelFailure),
}

impl Message {
    /// Returns the wire tag of this message.
    pub fn tag(&self) -> u8 {
        let ty = match self {
            Message::Disconnect(_) => MessageType::Disconnect,
            Message::Ignore(_) => MessageType::Ignore,
            Message::Unimplemented(_) => MessageType::Unimplemented,
            Message::Debug(_) => MessageType::Debug,
            Message::ServiceRequest(_) => MessageType::ServiceRequest,
            Message::ServiceAccept(_) => MessageType::ServiceAccept,
            Message::KexInit(_) => MessageType::KexInit,
            Message::NewKeys => MessageType::NewKeys,
            Message::KexEcdhInit(_) => MessageType::KexEcdhInit,
            Message::KexEcdhReply(_) => MessageType::KexEcdhReply,
            Message::UserauthRequest(_) => MessageType::UserauthRequest,
            Message::UserauthFailure(_) => MessageType::UserauthFailure,
            Message::UserauthSuccess => MessageType::UserauthSuccess,
            Message::UserauthBanner(_) => MessageType::UserauthBanner,
            Message::UserauthMethodSpecific { tag, .. } => return *tag,
            Message::GlobalRequest(_) => MessageType::GlobalRequest,
            Message::RequestSuccess(_) => MessageType::RequestSuccess,
            Message::RequestFailure => MessageType::RequestFailure,
            Message::ChannelOpen(_) => MessageType::ChannelOpen,
            Message::ChannelOpenConfirmation(_) => MessageType::ChannelOpenConfirmation,
            Message::ChannelOpenFailure(_) => MessageType::ChannelOpenFailure,
            Message::ChannelWindowAdjust(_) => MessageType::ChannelWindowAdjust,
            Message::ChannelData(_) => MessageType::ChannelData,
            Message::ChannelExtendedData(_) => MessageType::ChannelExtendedData,
            Message::ChannelEof(_) => MessageType::ChannelEof,
            Message::ChannelClose(_) => MessageType::ChannelClose,
            Message::ChannelRequest(_) => MessageType::ChannelRequest,
            Message::ChannelSuccess(_) => MessageType::ChannelSuccess,
            Message::ChannelFailure(_) => MessageType::ChannelFailure,
        };
        ty as u8
    }

    /// Protocol layer of this message.
    pub fn category(&self) -> MessageCategory {
        MessageCategory::of(self.tag())
    }

    /// Human readable name for logs.
    pub fn name(&self) -> &'static str {
        match MessageType::from_u8(self.tag()) {
            Some(ty) => ty.name(),
            None => "SSH_MSG_USERAUTH_METHOD_SPECIFIC",
        }
    }

    /// Appends the encoded message (type byte and fields) to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag());
        match self {
            Message::Disconnect(m) => m.encode_body(buf),
            Message::Ignore(m) => m.encode_body(buf),
            Message::Unimplemented(m) => m.encode_body(buf),
            Message::Debug(m) => m.encode_body(buf),
            Message::ServiceRequest(m) => m.encode_body(buf),
            Message::ServiceAccept(m) => m.encode_body(buf),
            Message::KexInit(m) => m.encode_body(buf),
            Message::NewKeys | Message::UserauthSuccess | Message::RequestFailure => {}
            Message::KexEcdhInit(m) => m.encode_body(buf),
            Message::KexEcdhReply(m) => m.encode_body(buf),
            Message::UserauthRequest(m) => m.encode_body(buf),
            Message::UserauthFailure(m) => m.encode_body(buf),
            Message::UserauthBanner(m) => m.encode_body(buf),
            Message::UserauthMethodSpecific { body, .. } => buf.put_slice(body),
            Message::GlobalRequest(m) => m.encode_body(buf),
            Message::RequestSuccess(m) => m.encode_body(buf),
            Message::ChannelOpen(m) => m.encode_body(buf),
            Message::ChannelOpenConfirmation(m) => m.encode_body(buf),
            Message::ChannelOpenFailure(m) => m.encode_body(buf),
            Message::ChannelWindowAdjust(m) => m.encode_body(buf),
            Message::ChannelData(m) => m.encode_body(buf),
            Message::ChannelExtendedData(m) => m.encode_body(buf),
            Message::ChannelEof(m) => m.encode_body(buf),
            Message::ChannelClose(m) => m.encode_body(buf),
            Message::ChannelRequest(m) => m.encode_body(buf),
            Message::ChannelSuccess(m) => m.encode_body(buf),
            Message::ChannelFailure(m) => m.encode_body(buf),
        }
    }

    /// Encodes the message to its exact wire payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decodes a packet payload.
    ///
    /// Variable-length fields of the result share storage with `payload`.
    ///
    /// # Errors
    ///
    /// - [`ConduitError::UnknownMessage`] if no variant is registered for the tag
    /// - [`ConduitError::Truncated`] / [`ConduitError::InvalidFormat`] on bad layout
    pub fn decode(payload: Bytes) -> ConduitResult<Self> {
        let mut r = WireReader::new(payload);
        let tag = r.read_u8()?;
        let decode = decoder(tag).ok_or(ConduitError::UnknownMessage(tag))?;
        decode(tag, &mut r)
    }
}

/// Decoder for the payload following a type byte.
pub type Decoder = fn(u8, &mut WireReader) -> ConduitResult<Message>;

/// Looks up the decoder registered for `tag`.
pub fn decoder(tag: u8) -> Option<Decoder> {
    REGISTRY[tag as usize]
}

/// Returns true if a variant is registered for `tag`.
pub fn is_registered(tag: u8) -> bool {
    decoder(tag).is_some()
}

fn decode_unit(tag: u8, r: &mut WireReader) -> ConduitResult<Message> {
    r.finish("empty message")?;
    match tag {
        21 => Ok(Message::NewKeys),
        52 => Ok(Message::UserauthSuccess),
        82 => Ok(Message::RequestFailure),
        other => Err(ConduitError::UnknownMessage(other)),
    }
}

fn decode_method_specific(tag: u8, r: &mut WireReader) -> ConduitResult<Message> {
    Ok(Message::UserauthMethodSpecific {
        tag,
        body: r.read_remaining(),
    })
}

macro_rules! body_decoders {
    ($($fn_name:ident => $variant:ident($ty:ty);)*) => {
        $(
            fn $fn_name(_tag: u8, r: &mut WireReader) -> ConduitResult<Message> {
                <$ty as MessageBody>::decode_body(r).map(Message::$variant)
            }
        )*
    };
}

body_decoders! {
    decode_disconnect => Disconnect(Disconnect);
    decode_ignore => Ignore(Ignore);
    decode_unimplemented => Unimplemented(Unimplemented);
    decode_debug => Debug(DebugMessage);
    decode_service_request => ServiceRequest(ServiceRequest);
    decode_service_accept => ServiceAccept(ServiceAccept);
    decode_kexinit => KexInit(KexInit);
    decode_kex_ecdh_init => KexEcdhInit(KexEcdhInit);
    decode_kex_ecdh_reply => KexEcdhReply(KexEcdhReply);
    decode_userauth_request => UserauthRequest(UserauthRequest);
    decode_userauth_failure => UserauthFailure(UserauthFailure);
    decode_userauth_banner => UserauthBanner(UserauthBanner);
    decode_global_request => GlobalRequest(GlobalRequest);
    decode_request_success => RequestSuccess(RequestSuccess);
    decode_channel_open => ChannelOpen(ChannelOpen);
    decode_channel_open_confirmation => ChannelOpenConfirmation(ChannelOpenConfirmation);
    decode_channel_open_failure => ChannelOpenFailure(ChannelOpenFailure);
    decode_channel_window_adjust => ChannelWindowAdjust(ChannelWindowAdjust);
    decode_channel_data => ChannelData(ChannelData);
    decode_channel_extended_data => ChannelExtendedData(ChannelExtendedData);
    decode_channel_eof => ChannelEof(ChannelEof);
    decode_channel_close => ChannelClose(ChannelClose);
    decode_channel_request => ChannelRequest(ChannelRequest);
    decode_channel_success => ChannelSuccess(ChannelSuccess);
    decode_channel_failure => ChannelFailure(ChannelFailure);
}

/// Tag-indexed decoder table.
static REGISTRY: [Option<Decoder>; 256] = build_registry();

const fn build_registry() -> [Option<Decoder>; 256] {
    let mut table: [Option<Decoder>; 256] = [None; 256];
    table[1] = Some(decode_disconnect as Decoder);
    table[2] = Some(decode_ignore as Decoder);
    table[3] = Some(decode_unimplemented as Decoder);
    table[4] = Some(decode_debug as Decoder);
    table[5] = Some(decode_service_request as Decoder);
    table[6] = Some(decode_service_accept as Decoder);
    table[20] = Some(decode_kexinit as Decoder);
    table[21] = Some(decode_unit as Decoder);
    table[30] = Some(decode_kex_ecdh_init as Decoder);
    table[31] = Some(decode_kex_ecdh_reply as Decoder);
    table[50] = Some(decode_userauth_request as Decoder);
    table[51] = Some(decode_userauth_failure as Decoder);
    table[52] = Some(decode_unit as Decoder);
    table[53] = Some(decode_userauth_banner as Decoder);
    let mut tag = 60;
    while tag <= 79 {
        table[tag] = Some(decode_method_specific as Decoder);
        tag += 1;
    }
    table[80] = Some(decode_global_request as Decoder);
    table[81] = Some(decode_request_success as Decoder);
    table[82] = Some(decode_unit as Decoder);
    table[90] = Some(decode_channel_open as Decoder);
    table[91] = Some(decode_channel_open_confirmation as Decoder);
    table[92] = Some(decode_channel_open_failure as Decoder);
    table[93] = Some(decode_channel_window_adjust as Decoder);
    table[94] = Some(decode_channel_data as Decoder);
    table[95] = Some(decode_channel_extended_data as Decoder);
    table[96] = Some(decode_channel_eof as Decoder);
    table[97] = Some(decode_channel_close as Decoder);
    table[98] = Some(decode_channel_request as Decoder);
    table[99] = Some(decode_channel_success as Decoder);
    table[100] = Some(decode_channel_failure as Decoder);
    table
}
