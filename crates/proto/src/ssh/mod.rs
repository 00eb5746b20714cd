//! SSH-2 client protocol engine (RFC 4251-4254).
//!
//! # Architecture
//!
//! The engine is layered:
//!
//! 1. **Codec** ([`wire`], [`message`]) - SSH data types and the closed
//!    [`Message`] set with its tag registry
//! 2. **Packets** ([`packet`]) - Binary packet framing (RFC 4253 Section 6)
//! 3. **Transport** ([`transport`], [`keys`], [`crypto`]) - Sequence numbers,
//!    encryption, MAC and per-direction key switching
//! 4. **Key exchange** ([`kex`], [`kex_dh`]) - Negotiation, exchange hash,
//!    key derivation and rekeying (RFC 4253 Sections 7-9)
//! 5. **Authentication** ([`auth`]) - User authentication (RFC 4252)
//! 6. **Connection** ([`connection`], [`multiplexer`], [`channel`]) - Channels
//!    with flow control (RFC 4254)
//! 7. **Session** ([`session`], [`dispatcher`], [`client`]) - Lifecycle, the
//!    single reader loop and the application API
//!
//! One task reads from the connection and routes every message; any number
//! of tasks send through the shared [`PacketWriter`], which holds back
//! non-key-exchange traffic while a key exchange runs.
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use conduit_proto::ssh::{frame, unframe, Message, ChannelData, MAX_PACKET_SIZE};
//!
//! let msg = Message::ChannelData(ChannelData::new(3, Bytes::from_static(b"hello")));
//! let packet = frame(msg.encode(), 8, false).unwrap();
//! let payload = unframe(packet, MAX_PACKET_SIZE).unwrap();
//! assert_eq!(Message::decode(payload).unwrap(), msg);
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [RFC 5647](https://datatracker.ietf.org/doc/html/rfc5647) - AES-GCM for SSH

pub mod auth;
pub mod channel;
pub mod client;
pub mod connection;
pub mod crypto;
pub mod dispatcher;
pub mod generic;
pub mod kex;
pub mod kex_dh;
pub mod keys;
pub mod message;
pub mod multiplexer;
pub mod packet;
pub mod session;
pub mod transport;
pub mod version;
pub mod wire;

pub use auth::{AuthContext, AuthMethodData, AuthStrategy, NoneAuth, PasswordAuth};
pub use channel::{ChannelEvent, ChannelHandle, ChannelState, ChannelStatus};
pub use client::{SshClient, SshClientConfig};
pub use connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequest,
    ChannelRequestType, ChannelSuccess, ChannelType, ChannelWindowAdjust, ExtendedDataType,
    GlobalRequest, GlobalRequestType,
};
pub use crypto::{AlgorithmCategory, AlgorithmProvider, DefaultAlgorithmProvider};
pub use dispatcher::{DispatchPolicy, MessageDispatcher, SessionContext};
pub use generic::{Disconnect, DisconnectReason};
pub use kex::{
    AcceptAnyHostKey, HostKeyVerifier, KexCoordinator, KexInit, KexOutcome, NegotiatedAlgorithms,
    PinnedHostKey,
};
pub use keys::{DirectionKeys, KeySlot};
pub use message::{Message, MessageCategory, MessageType};
pub use multiplexer::{MessageSink, Multiplexer, MultiplexerConfig};
pub use packet::{frame, unframe, Packet, MAX_CHANNEL_DATA, MAX_PACKET_SIZE};
pub use session::{
    KeepaliveTask, RekeyPolicy, SessionEvent, SessionState, SessionStatus, UnknownMessagePolicy,
};
pub use transport::{PacketReader, PacketWriter, SharedWriter, TransportConfig};
pub use version::Version;
pub use wire::{SshBufMut, WireReader};
