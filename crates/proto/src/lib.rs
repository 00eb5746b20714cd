//! Client-side SSH-2 protocol engine.
//!
//! This crate speaks the SSH-2 protocol from the client side over any
//! async byte stream:
//!
//! - **Codec** - RFC 4251 data types and every message the client handles
//! - **Transport** - binary packets, encryption, MAC, sequence numbers
//! - **Key exchange** - curve25519-sha256 with rekeying in both directions
//! - **Channels** - multiplexed channels with window-based flow control
//!
//! # Features
//!
//! - `ssh` (default) - the SSH engine
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use conduit_proto::ssh::{Message, ChannelData};
//!
//! let msg = Message::ChannelData(ChannelData::new(0, Bytes::from_static(b"ls\n")));
//! let wire = msg.encode();
//! assert_eq!(wire[0], 94); // SSH_MSG_CHANNEL_DATA
//! assert_eq!(Message::decode(wire).unwrap(), msg);
//! ```
//!
//! # Security
//!
//! - Cryptographic primitives come from vetted libraries (`ring`, `dalek`,
//!   RustCrypto)
//! - MAC tags are compared in constant time
//! - Key material is zeroized on drop and never logged
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
