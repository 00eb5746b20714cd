//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! # Constraints
//!
//! - `packet_length`: Does NOT include `mac` or `packet_length` field itself
//! - `padding_length`: Length of padding (minimum 4, maximum 255 bytes)
//! - `packet_length + 4` is a multiple of `max(block size, 8)`. When the
//!   cipher sends the length in clear (AEAD), `packet_length` alone is.
//! - Maximum packet size: 35000 bytes (RFC 4253 Section 6.1)
//!
//! This module only deals with plaintext framing. Encryption and MAC are
//! applied by [`transport`](super::transport).
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use conduit_proto::ssh::packet::Packet;
//!
//! let packet = Packet::new(Bytes::from_static(b"\x05payload")).unwrap();
//! let bytes = packet.to_bytes();
//! assert_eq!(bytes.len() % 8, 0);
//!
//! let parsed = Packet::from_bytes(Bytes::from(bytes)).unwrap();
//! assert_eq!(&parsed.payload()[..], b"\x05payload");
//! ```

use bytes::{BufMut, Bytes};
use conduit_platform::{ConduitError, ConduitResult};
use rand::RngCore;

/// Maximum packet size in bytes (RFC 4253 Section 6.1).
///
/// This limit prevents denial-of-service attacks via extremely large packets.
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: usize = 255;

/// Smallest alignment the protocol allows, even for stream ciphers.
pub const MIN_BLOCK_SIZE: usize = 8;

/// Header of SSH_MSG_CHANNEL_EXTENDED_DATA: tag, recipient, data type and
/// string length. Plain channel data needs four bytes less.
const CHANNEL_DATA_HEADER: usize = 1 + 4 + 4 + 4;

/// Largest channel data payload that fits one packet of
/// [`MAX_PACKET_SIZE`] whatever padding the sender picks.
///
/// Outbound segments are cut to this size, and a channel may not advertise
/// a larger maximum packet size since the peer's packets would then be
/// rejected by the transport.
pub const MAX_CHANNEL_DATA: usize = MAX_PACKET_SIZE - 1 - CHANNEL_DATA_HEADER - MAX_PADDING_LEN;

/// Computes the padding length for a payload.
///
/// Padding is the smallest value of at least [`MIN_PADDING_LEN`] that
/// aligns the packet to `block_size`.
///
/// ```rust
/// use conduit_proto::ssh::packet::padding_len;
///
/// // 4 + 1 + 3 + 8 = 16
/// assert_eq!(padding_len(3, 8, false), 8);
/// // length in clear: 1 + 3 + 12 = 16
/// assert_eq!(padding_len(3, 16, true), 12);
/// ```
pub fn padding_len(payload_len: usize, block_size: usize, length_in_clear: bool) -> usize {
    let block_size = block_size.max(MIN_BLOCK_SIZE);
    let header = if length_in_clear { 1 } else { 5 };
    let unpadded = header + payload_len + MIN_PADDING_LEN;
    let extra = (block_size - unpadded % block_size) % block_size;
    MIN_PADDING_LEN + extra
}

/// Validates a received `packet_length` against the size limit and the
/// cipher alignment.
pub fn check_packet_length(
    packet_length: usize,
    block_size: usize,
    length_in_clear: bool,
    max_packet_size: usize,
) -> ConduitResult<()> {
    if packet_length < 1 + MIN_PADDING_LEN {
        return Err(ConduitError::InvalidFormat(format!(
            "packet length {} below minimum",
            packet_length
        )));
    }
    if packet_length > max_packet_size {
        return Err(ConduitError::InvalidFormat(format!(
            "packet length {} exceeds maximum {}",
            packet_length, max_packet_size
        )));
    }
    let block_size = block_size.max(MIN_BLOCK_SIZE);
    let aligned = if length_in_clear {
        packet_length
    } else {
        packet_length + 4
    };
    if aligned % block_size != 0 {
        return Err(ConduitError::InvalidFormat(format!(
            "packet length {} not aligned to block size {}",
            packet_length, block_size
        )));
    }
    Ok(())
}

/// SSH binary packet in plaintext form.
///
/// # Invariants
///
/// - Padding length is between 4 and 255 bytes
/// - Total packet size is at most [`MAX_PACKET_SIZE`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Bytes,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a packet aligned to the default 8-byte block size.
    pub fn new(payload: Bytes) -> ConduitResult<Self> {
        Self::with_alignment(payload, MIN_BLOCK_SIZE, false)
    }

    /// Creates a packet with random padding for the given cipher alignment.
    pub fn with_alignment(
        payload: Bytes,
        block_size: usize,
        length_in_clear: bool,
    ) -> ConduitResult<Self> {
        let pad = padding_len(payload.len(), block_size, length_in_clear);
        let packet_length = 1 + payload.len() + pad;
        if packet_length > MAX_PACKET_SIZE {
            return Err(ConduitError::invalid_argument(
                "payload",
                format!(
                    "packet of {} bytes exceeds maximum {}",
                    packet_length, MAX_PACKET_SIZE
                ),
            ));
        }

        let mut padding = vec![0u8; pad];
        rand::thread_rng().fill_bytes(&mut padding);

        Ok(Self { payload, padding })
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the packet, returning its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Value of the `packet_length` field.
    pub fn packet_length(&self) -> usize {
        1 + self.payload.len() + self.padding.len()
    }

    /// Serializes to `packet_length || padding_length || payload || padding`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = self.packet_length();
        // Leave room for a MAC or AEAD tag without reallocating
        let mut buf = Vec::with_capacity(4 + packet_length + 64);
        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        buf
    }

    /// Parses a complete plaintext packet, without MAC.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Truncated`] if fewer than 5 bytes are given,
    /// and [`ConduitError::InvalidFormat`] if the length fields disagree with
    /// the data or the padding is out of range.
    pub fn from_bytes(data: Bytes) -> ConduitResult<Self> {
        Self::from_bytes_with_limit(data, MAX_PACKET_SIZE)
    }

    /// Like [`from_bytes`](Self::from_bytes) with a custom size limit.
    pub fn from_bytes_with_limit(data: Bytes, max_packet_size: usize) -> ConduitResult<Self> {
        if data.len() < 5 {
            return Err(ConduitError::Truncated {
                needed: 5,
                available: data.len(),
            });
        }

        let packet_length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if packet_length > max_packet_size {
            return Err(ConduitError::InvalidFormat(format!(
                "packet length {} exceeds maximum {}",
                packet_length, max_packet_size
            )));
        }
        if data.len() != 4 + packet_length {
            return Err(ConduitError::InvalidFormat(format!(
                "packet length {} does not match {} bytes of data",
                packet_length,
                data.len() - 4
            )));
        }

        let padding_length = data[4] as usize;
        if padding_length < MIN_PADDING_LEN {
            return Err(ConduitError::InvalidFormat(format!(
                "padding length {} below minimum {}",
                padding_length, MIN_PADDING_LEN
            )));
        }
        if padding_length + 1 > packet_length {
            return Err(ConduitError::InvalidFormat(format!(
                "padding length {} exceeds packet length {}",
                padding_length, packet_length
            )));
        }

        let payload_end = 4 + packet_length - padding_length;
        Ok(Self {
            payload: data.slice(5..payload_end),
            padding: data[payload_end..].to_vec(),
        })
    }
}

/// Frames a payload into a plaintext packet buffer.
pub fn frame(payload: Bytes, block_size: usize, length_in_clear: bool) -> ConduitResult<Vec<u8>> {
    Ok(Packet::with_alignment(payload, block_size, length_in_clear)?.to_bytes())
}

/// Extracts the payload from a plaintext `packet_length || ... || padding`
/// buffer.
pub fn unframe(plain: Vec<u8>, max_packet_size: usize) -> ConduitResult<Bytes> {
    Packet::from_bytes_with_limit(Bytes::from(plain), max_packet_size).map(Packet::into_payload)
}
