//! SSH connection protocol messages (RFC 4254).
//!
//! This module defines the channel and global request messages:
//! - Channel types: session, direct-tcpip, forwarded-tcpip, x11
//! - Channel flow control (window adjust)
//! - Channel data as zero-copy views over a caller-owned buffer
//! - Channel requests: exec, shell, pty-req, env, exit-status, exit-signal
//! - Global requests: tcpip-forward, cancel-tcpip-forward
//!
//! Types and requests this engine does not model are kept as raw bytes in an
//! `Other` variant so they re-encode exactly.
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use conduit_proto::ssh::connection::ChannelData;
//!
//! let buffer = Bytes::from_static(b"hello, world");
//! let msg = ChannelData::builder(5)
//!     .data(buffer)
//!     .offset(7)
//!     .size(5)
//!     .build()
//!     .unwrap();
//! assert_eq!(msg.data(), b"world");
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use conduit_platform::{ConduitError, ConduitResult};

use super::message::MessageBody;
use super::wire::{SshBufMut, WireReader};

/// Default initial window size for channels opened by this engine (2 MB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default maximum packet size advertised for channels (32 KB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Channel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (interactive shell, exec, subsystem).
    Session,
    /// Direct TCP/IP channel (port forwarding).
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Forwarded TCP/IP channel (reverse port forwarding).
    ForwardedTcpip {
        /// Connected address
        connected_address: String,
        /// Connected port
        connected_port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// X11 forwarding channel.
    X11 {
        /// Originator address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Any other channel type, with its raw type-specific data.
    Other {
        /// Channel type name
        name: String,
        /// Raw type-specific data
        data: Bytes,
    },
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelType::X11 { .. } => "x11",
            ChannelType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN message (RFC 4254 Section 5.1).
///
/// ```text
/// byte      SSH_MSG_CHANNEL_OPEN (90)
/// string    channel type
/// uint32    sender channel
/// uint32    initial window size
/// uint32    maximum packet size
/// ....      channel type specific data
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type
    pub channel_type: ChannelType,
    /// Sender channel number
    pub sender_channel: u32,
    /// Initial window size
    pub initial_window_size: u32,
    /// Maximum packet size
    pub maximum_packet_size: u32,
}

impl MessageBody for ChannelOpen {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_ssh_utf8(self.channel_type.name());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);

        match &self.channel_type {
            ChannelType::Session => {}
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                buf.put_ssh_utf8(host);
                buf.put_u32(*port);
                buf.put_ssh_utf8(originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                buf.put_ssh_utf8(connected_address);
                buf.put_u32(*connected_port);
                buf.put_ssh_utf8(originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::X11 {
                originator_address,
                originator_port,
            } => {
                buf.put_ssh_utf8(originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::Other { data, .. } => buf.put_slice(data),
        }
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let type_name = r.read_utf8()?;
        let sender_channel = r.read_u32()?;
        let initial_window_size = r.read_u32()?;
        let maximum_packet_size = r.read_u32()?;

        let channel_type = match type_name.as_str() {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip {
                host: r.read_utf8()?,
                port: r.read_u32()?,
                originator_address: r.read_utf8()?,
                originator_port: r.read_u32()?,
            },
            "forwarded-tcpip" => ChannelType::ForwardedTcpip {
                connected_address: r.read_utf8()?,
                connected_port: r.read_u32()?,
                originator_address: r.read_utf8()?,
                originator_port: r.read_u32()?,
            },
            "x11" => ChannelType::X11 {
                originator_address: r.read_utf8()?,
                originator_port: r.read_u32()?,
            },
            _ => ChannelType::Other {
                name: type_name,
                data: r.read_remaining(),
            },
        };
        r.finish("SSH_MSG_CHANNEL_OPEN")?;

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Our channel number
    pub recipient_channel: u32,
    /// The peer's channel number
    pub sender_channel: u32,
    /// Initial window size granted by the peer
    pub initial_window_size: u32,
    /// Maximum packet size accepted by the peer
    pub maximum_packet_size: u32,
    /// Channel type specific data
    pub extra: Bytes,
}

impl ChannelOpenConfirmation {
    /// Creates a confirmation without type-specific data.
    pub fn new(
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            recipient_channel,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
            extra: Bytes::new(),
        }
    }
}

impl MessageBody for ChannelOpenConfirmation {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.put_slice(&self.extra);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        Ok(Self {
            recipient_channel: r.read_u32()?,
            sender_channel: r.read_u32()?,
            initial_window_size: r.read_u32()?,
            maximum_packet_size: r.read_u32()?,
            extra: r.read_remaining(),
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Channel number from the failed open request
    pub recipient_channel: u32,
    /// Reason code, see [`ChannelOpenFailureReason`]
    pub reason_code: u32,
    /// Human readable description
    pub description: String,
    /// Language tag
    pub language: String,
}

impl ChannelOpenFailure {
    /// Creates a failure reply with an empty language tag.
    pub fn new(
        recipient_channel: u32,
        reason: ChannelOpenFailureReason,
        description: impl Into<String>,
    ) -> Self {
        Self {
            recipient_channel,
            reason_code: reason as u32,
            description: description.into(),
            language: String::new(),
        }
    }

    /// Returns the reason if it is a known code.
    pub fn reason(&self) -> Option<ChannelOpenFailureReason> {
        ChannelOpenFailureReason::from_u32(self.reason_code)
    }
}

impl MessageBody for ChannelOpenFailure {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code);
        buf.put_ssh_utf8(&self.description);
        buf.put_ssh_utf8(&self.language);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let msg = Self {
            recipient_channel: r.read_u32()?,
            reason_code: r.read_u32()?,
            description: r.read_utf8()?,
            language: r.read_utf8()?,
        };
        r.finish("SSH_MSG_CHANNEL_OPEN_FAILURE")?;
        Ok(msg)
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Bytes added to the window
    pub bytes_to_add: u32,
}

impl MessageBody for ChannelWindowAdjust {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let msg = Self {
            recipient_channel: r.read_u32()?,
            bytes_to_add: r.read_u32()?,
        };
        r.finish("SSH_MSG_CHANNEL_WINDOW_ADJUST")?;
        Ok(msg)
    }
}

/// SSH_MSG_CHANNEL_DATA message (RFC 4254 Section 5.2).
///
/// The payload is a view `(offset, size)` into a shared buffer, so a large
/// transfer can be cut into window-sized segments without copying.
///
/// ```text
/// byte      SSH_MSG_CHANNEL_DATA (94)
/// uint32    recipient channel
/// string    data
/// ```
#[derive(Clone)]
pub struct ChannelData {
    recipient_channel: u32,
    buffer: Bytes,
    offset: usize,
    size: usize,
}

impl ChannelData {
    /// Creates a message whose payload is the whole of `data`.
    pub fn new(recipient_channel: u32, data: Bytes) -> Self {
        let size = data.len();
        Self {
            recipient_channel,
            buffer: data,
            offset: 0,
            size,
        }
    }

    /// Creates a message whose payload is `data[offset..offset + size]`.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::InvalidArgument`] naming `offset` or `size`
    /// if the range falls outside the buffer.
    pub fn with_range(
        recipient_channel: u32,
        data: Bytes,
        offset: usize,
        size: usize,
    ) -> ConduitResult<Self> {
        if offset > data.len() {
            return Err(ConduitError::invalid_argument(
                "offset",
                format!("offset {} exceeds buffer length {}", offset, data.len()),
            ));
        }
        match offset.checked_add(size) {
            Some(end) if end <= data.len() => {}
            _ => {
                return Err(ConduitError::invalid_argument(
                    "size",
                    format!(
                        "offset {} + size {} exceeds buffer length {}",
                        offset,
                        size,
                        data.len()
                    ),
                ))
            }
        }

        Ok(Self {
            recipient_channel,
            buffer: data,
            offset,
            size,
        })
    }

    /// Starts building a message for `recipient_channel`.
    pub fn builder(recipient_channel: u32) -> ChannelDataBuilder {
        ChannelDataBuilder {
            recipient_channel,
            data: None,
            offset: 0,
            size: None,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the viewed payload.
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.size]
    }

    /// Returns the payload as an owned handle sharing the buffer.
    pub fn payload(&self) -> Bytes {
        self.buffer.slice(self.offset..self.offset + self.size)
    }

    /// Returns the underlying buffer.
    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    /// Start of the view within the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the view.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Encoded length: type byte, channel, length prefix and payload.
    pub fn encoded_len(&self) -> usize {
        1 + 4 + 4 + self.size
    }
}

impl PartialEq for ChannelData {
    fn eq(&self, other: &Self) -> bool {
        self.recipient_channel == other.recipient_channel && self.data() == other.data()
    }
}

impl Eq for ChannelData {}

impl std::fmt::Debug for ChannelData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelData")
            .field("recipient_channel", &self.recipient_channel)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

impl MessageBody for ChannelData {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.recipient_channel);
        buf.put_ssh_string(self.data());
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let recipient_channel = r.read_u32()?;
        let data = r.read_string()?;
        r.finish("SSH_MSG_CHANNEL_DATA")?;
        Ok(Self::new(recipient_channel, data))
    }
}

/// Builder for [`ChannelData`] views.
#[derive(Debug, Clone)]
pub struct ChannelDataBuilder {
    recipient_channel: u32,
    data: Option<Bytes>,
    offset: usize,
    size: Option<usize>,
}

impl ChannelDataBuilder {
    /// Sets the backing buffer.
    pub fn data(mut self, data: Bytes) -> Self {
        self.data = Some(data);
        self
    }

    /// Sets the start of the view (default 0).
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Sets the view length (default: to the end of the buffer).
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Validates the view and builds the message.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::InvalidArgument`] naming `data` when no buffer
    /// was supplied, or `offset`/`size` when the view is out of bounds.
    pub fn build(self) -> ConduitResult<ChannelData> {
        let data = self
            .data
            .ok_or_else(|| ConduitError::invalid_argument("data", "payload buffer is required"))?;
        let size = match self.size {
            Some(size) => size,
            None => data.len().checked_sub(self.offset).ok_or_else(|| {
                ConduitError::invalid_argument(
                    "offset",
                    format!("offset {} exceeds buffer length {}", self.offset, data.len()),
                )
            })?,
        };
        ChannelData::with_range(self.recipient_channel, data, self.offset, size)
    }
}

/// Extended data type code (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExtendedDataType {
    /// Stderr data
    Stderr = 1,
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Data type code; 1 is stderr
    pub data_type_code: u32,
    /// Payload
    pub data: Bytes,
}

impl MessageBody for ChannelExtendedData {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.data_type_code);
        buf.put_ssh_string(&self.data);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let msg = Self {
            recipient_channel: r.read_u32()?,
            data_type_code: r.read_u32()?,
            data: r.read_string()?,
        };
        r.finish("SSH_MSG_CHANNEL_EXTENDED_DATA")?;
        Ok(msg)
    }
}

macro_rules! channel_only_message {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            /// Recipient channel number
            pub recipient_channel: u32,
        }

        impl MessageBody for $name {
            fn encode_body(&self, buf: &mut BytesMut) {
                buf.put_u32(self.recipient_channel);
            }

            fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
                let recipient_channel = r.read_u32()?;
                r.finish($label)?;
                Ok(Self { recipient_channel })
            }
        }
    };
}

channel_only_message!(
    /// SSH_MSG_CHANNEL_EOF message (RFC 4254 Section 5.3).
    ChannelEof,
    "SSH_MSG_CHANNEL_EOF"
);
channel_only_message!(
    /// SSH_MSG_CHANNEL_CLOSE message (RFC 4254 Section 5.3).
    ChannelClose,
    "SSH_MSG_CHANNEL_CLOSE"
);
channel_only_message!(
    /// SSH_MSG_CHANNEL_SUCCESS message (RFC 4254 Section 5.4).
    ChannelSuccess,
    "SSH_MSG_CHANNEL_SUCCESS"
);
channel_only_message!(
    /// SSH_MSG_CHANNEL_FAILURE message (RFC 4254 Section 5.4).
    ChannelFailure,
    "SSH_MSG_CHANNEL_FAILURE"
);

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// PTY request (pseudoterminal allocation)
    PtyReq {
        /// Terminal type (e.g., "xterm")
        term: String,
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
        /// Encoded terminal modes
        modes: Bytes,
    },
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Start interactive shell
    Shell,
    /// Start subsystem (e.g., "sftp")
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Terminal size change
    WindowChange {
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
    },
    /// Deliver a signal to the remote process
    Signal {
        /// Signal name without the "SIG" prefix
        signal_name: String,
    },
    /// Exit status
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Exit signal
    ExitSignal {
        /// Signal name
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
        /// Language tag
        language_tag: String,
    },
    /// Any other request, with its raw type-specific data.
    Other {
        /// Request name
        name: String,
        /// Raw type-specific data
        data: Bytes,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::Signal { .. } => "signal",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST message (RFC 4254 Section 6).
///
/// ```text
/// byte      SSH_MSG_CHANNEL_REQUEST (98)
/// uint32    recipient channel
/// string    request type
/// boolean   want reply
/// ....      type-specific data
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Whether the sender expects SSH_MSG_CHANNEL_SUCCESS/FAILURE
    pub want_reply: bool,
    /// Request type and data
    pub request: ChannelRequestType,
}

impl MessageBody for ChannelRequest {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.recipient_channel);
        buf.put_ssh_utf8(self.request.name());
        buf.put_ssh_bool(self.want_reply);

        match &self.request {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes,
            } => {
                buf.put_ssh_utf8(term);
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
                buf.put_ssh_string(modes);
            }
            ChannelRequestType::Env { name, value } => {
                buf.put_ssh_utf8(name);
                buf.put_ssh_utf8(value);
            }
            ChannelRequestType::Exec { command } => buf.put_ssh_utf8(command),
            ChannelRequestType::Shell => {}
            ChannelRequestType::Subsystem { name } => buf.put_ssh_utf8(name),
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
            } => {
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
            }
            ChannelRequestType::Signal { signal_name } => buf.put_ssh_utf8(signal_name),
            ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                language_tag,
            } => {
                buf.put_ssh_utf8(signal_name);
                buf.put_ssh_bool(*core_dumped);
                buf.put_ssh_utf8(error_message);
                buf.put_ssh_utf8(language_tag);
            }
            ChannelRequestType::Other { data, .. } => buf.put_slice(data),
        }
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let recipient_channel = r.read_u32()?;
        let name = r.read_utf8()?;
        let want_reply = r.read_bool()?;

        let request = match name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: r.read_utf8()?,
                width_chars: r.read_u32()?,
                height_rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
                modes: r.read_string()?,
            },
            "env" => ChannelRequestType::Env {
                name: r.read_utf8()?,
                value: r.read_utf8()?,
            },
            "exec" => ChannelRequestType::Exec {
                command: r.read_utf8()?,
            },
            "shell" => ChannelRequestType::Shell,
            "subsystem" => ChannelRequestType::Subsystem {
                name: r.read_utf8()?,
            },
            "window-change" => ChannelRequestType::WindowChange {
                width_chars: r.read_u32()?,
                height_rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
            },
            "signal" => ChannelRequestType::Signal {
                signal_name: r.read_utf8()?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: r.read_u32()?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                signal_name: r.read_utf8()?,
                core_dumped: r.read_bool()?,
                error_message: r.read_utf8()?,
                language_tag: r.read_utf8()?,
            },
            _ => ChannelRequestType::Other {
                name,
                data: r.read_remaining(),
            },
        };
        r.finish("SSH_MSG_CHANNEL_REQUEST")?;

        Ok(Self {
            recipient_channel,
            want_reply,
            request,
        })
    }
}

/// Global request type (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequestType {
    /// Ask the server to listen for forwarded connections
    TcpipForward {
        /// Address to bind
        address: String,
        /// Port to bind; 0 lets the server choose
        port: u32,
    },
    /// Cancel a previous `tcpip-forward`
    CancelTcpipForward {
        /// Bound address
        address: String,
        /// Bound port
        port: u32,
    },
    /// Any other request, e.g. `keepalive@openssh.com`
    Other {
        /// Request name
        name: String,
        /// Raw request-specific data
        data: Bytes,
    },
}

impl GlobalRequestType {
    /// Returns the request name.
    pub fn name(&self) -> &str {
        match self {
            GlobalRequestType::TcpipForward { .. } => "tcpip-forward",
            GlobalRequestType::CancelTcpipForward { .. } => "cancel-tcpip-forward",
            GlobalRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_GLOBAL_REQUEST message (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Whether the sender expects SSH_MSG_REQUEST_SUCCESS/FAILURE
    pub want_reply: bool,
    /// Request type and data
    pub request: GlobalRequestType,
}

impl MessageBody for GlobalRequest {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_ssh_utf8(self.request.name());
        buf.put_ssh_bool(self.want_reply);
        match &self.request {
            GlobalRequestType::TcpipForward { address, port }
            | GlobalRequestType::CancelTcpipForward { address, port } => {
                buf.put_ssh_utf8(address);
                buf.put_u32(*port);
            }
            GlobalRequestType::Other { data, .. } => buf.put_slice(data),
        }
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let name = r.read_utf8()?;
        let want_reply = r.read_bool()?;
        let request = match name.as_str() {
            "tcpip-forward" => GlobalRequestType::TcpipForward {
                address: r.read_utf8()?,
                port: r.read_u32()?,
            },
            "cancel-tcpip-forward" => GlobalRequestType::CancelTcpipForward {
                address: r.read_utf8()?,
                port: r.read_u32()?,
            },
            _ => GlobalRequestType::Other {
                name,
                data: r.read_remaining(),
            },
        };
        r.finish("SSH_MSG_GLOBAL_REQUEST")?;
        Ok(Self {
            want_reply,
            request,
        })
    }
}

/// SSH_MSG_REQUEST_SUCCESS message with its response-specific data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestSuccess {
    /// Response data, e.g. the bound port of a `tcpip-forward` with port 0
    pub data: Bytes,
}

impl MessageBody for RequestSuccess {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.data);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        Ok(Self {
            data: r.read_remaining(),
        })
    }
}
