//! SSH packet transport (RFC 4253 Section 6).
//!
//! The transport is the only code that touches the raw byte stream. It is
//! split into a [`PacketReader`], owned by the single reader loop, and a
//! [`PacketWriter`], shared by every sender behind a FIFO lock
//! ([`SharedWriter`]).
//!
//! # Send path
//!
//! 1. Compress the payload
//! 2. Frame and pad to the cipher block size
//! 3. MAC over `seq || packet` (unencrypted)
//! 4. Encrypt (AEAD ciphers append their tag)
//! 5. Write `ciphertext || mac`
//!
//! The receive path mirrors it. A MAC or tag mismatch is an
//! [`Integrity`](ConduitError::Integrity) error and ends the session.
//!
//! # Sequence numbers
//!
//! Each direction counts packets from zero, wrapping at 2^32. The counter
//! advances exactly once per packet and is never reset by a key exchange.
//!
//! # Key exchange pause
//!
//! Between sending SSH_MSG_KEXINIT and SSH_MSG_NEWKEYS only transport
//! generic and key exchange messages may be sent. [`PacketWriter::send`]
//! queues everything else while the writer is paused and flushes the queue,
//! in order, when [`PacketWriter::resume`] is called under the new keys.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use conduit_platform::{ConduitError, ConduitResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::keys::KeySlot;
use super::message::Message;
use super::packet::{check_packet_length, frame, unframe, MAX_PACKET_SIZE, MIN_BLOCK_SIZE};

type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Writer shared between the reader loop, channels and the key exchange.
pub type SharedWriter = Arc<Mutex<PacketWriter>>;

/// Per-transport limits.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest `packet_length` accepted from the peer.
    pub max_packet_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

/// Returns true if a message may be sent while a key exchange is running
/// (RFC 4253 Section 7.1).
///
/// ```rust
/// use conduit_proto::ssh::transport::permitted_during_kex;
///
/// assert!(permitted_during_kex(2));   // SSH_MSG_IGNORE
/// assert!(permitted_during_kex(30));  // SSH_MSG_KEX_ECDH_INIT
/// assert!(!permitted_during_kex(5));  // SSH_MSG_SERVICE_REQUEST
/// assert!(!permitted_during_kex(94)); // SSH_MSG_CHANNEL_DATA
/// ```
pub fn permitted_during_kex(tag: u8) -> bool {
    matches!(tag, 1..=4 | 20..=49)
}

/// A decrypted, verified packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Sequence number the packet was received under
    pub seq: u32,
    /// Decompressed payload, starting with the message tag
    pub payload: Bytes,
}

/// Inbound half of the transport.
pub struct PacketReader {
    stream: BoxedReader,
    keys: KeySlot,
    seq: u32,
    packets: u64,
    bytes: u64,
    config: TransportConfig,
}

impl std::fmt::Debug for PacketReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReader")
            .field("seq", &self.seq)
            .field("keys", &self.keys)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl PacketReader {
    /// Wraps the read half of a connection, starting in cleartext.
    pub fn new<R>(stream: R, config: TransportConfig) -> Self
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        Self {
            stream: Box::new(stream),
            keys: KeySlot::new(),
            seq: 0,
            packets: 0,
            bytes: 0,
            config,
        }
    }

    /// Sequence number of the next packet.
    pub fn sequence(&self) -> u32 {
        self.seq
    }

    /// Packets received so far.
    pub fn packets_received(&self) -> u64 {
        self.packets
    }

    /// Bytes received so far, including framing and MAC.
    pub fn bytes_received(&self) -> u64 {
        self.bytes
    }

    /// Inbound keys.
    pub fn keys(&self) -> &KeySlot {
        &self.keys
    }

    /// Mutable inbound keys, for staging and switching after a key exchange.
    pub fn keys_mut(&mut self) -> &mut KeySlot {
        &mut self.keys
    }

    #[cfg(test)]
    pub(crate) fn set_sequence(&mut self, seq: u32) {
        self.seq = seq;
    }

    /// Reads, decrypts and verifies the next packet.
    pub async fn read_packet(&mut self) -> ConduitResult<InboundPacket> {
        let seq = self.seq;
        let max = self.config.max_packet_size;
        let keys = self.keys.current_mut();
        let block = keys.cipher().block_size().max(MIN_BLOCK_SIZE);
        let mut wire_len;

        let packet = if keys.cipher().length_in_clear() {
            let mut len_bytes = [0u8; 4];
            self.stream.read_exact(&mut len_bytes).await?;
            let packet_length = u32::from_be_bytes(len_bytes) as usize;
            check_packet_length(packet_length, block, true, max)?;

            let tag = keys.cipher().tag_size();
            let mut packet = Vec::with_capacity(4 + packet_length + tag);
            packet.extend_from_slice(&len_bytes);
            packet.resize(4 + packet_length + tag, 0);
            self.stream.read_exact(&mut packet[4..]).await?;
            wire_len = packet.len();

            keys.cipher_mut().open(seq, &mut packet)?;
            packet
        } else {
            let mut packet = vec![0u8; block];
            self.stream.read_exact(&mut packet).await?;
            keys.cipher_mut().decrypt(seq, &mut packet)?;

            let packet_length =
                u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]) as usize;
            check_packet_length(packet_length, block, false, max)?;

            packet.resize(4 + packet_length, 0);
            self.stream.read_exact(&mut packet[block..]).await?;
            keys.cipher_mut().decrypt(seq, &mut packet[block..])?;
            wire_len = packet.len();

            if let Some(mac) = keys.mac() {
                let mut received = vec![0u8; mac.mac_size()];
                self.stream.read_exact(&mut received).await?;
                wire_len += received.len();
                if !mac.verify(seq, &packet, &received) {
                    return Err(ConduitError::Integrity(format!(
                        "MAC mismatch on inbound packet {}",
                        seq
                    )));
                }
            }
            packet
        };

        let payload = unframe(packet, max)?;
        let payload = keys.compression_mut().decompress(payload)?;

        self.seq = seq.wrapping_add(1);
        self.packets += 1;
        self.bytes += wire_len as u64;
        trace!(seq, len = payload.len(), "packet received");

        Ok(InboundPacket { seq, payload })
    }
}

/// Outbound half of the transport.
pub struct PacketWriter {
    stream: BoxedWriter,
    keys: KeySlot,
    seq: u32,
    packets: u64,
    bytes: u64,
    paused: bool,
    deferred: VecDeque<Bytes>,
    closed: bool,
}

impl std::fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter")
            .field("seq", &self.seq)
            .field("keys", &self.keys)
            .field("paused", &self.paused)
            .field("deferred", &self.deferred.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl PacketWriter {
    /// Wraps the write half of a connection, starting in cleartext.
    pub fn new<W>(stream: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            stream: Box::new(stream),
            keys: KeySlot::new(),
            seq: 0,
            packets: 0,
            bytes: 0,
            paused: false,
            deferred: VecDeque::new(),
            closed: false,
        }
    }

    /// Wraps the writer for sharing.
    pub fn shared(self) -> SharedWriter {
        Arc::new(Mutex::new(self))
    }

    /// Sequence number of the next packet.
    pub fn sequence(&self) -> u32 {
        self.seq
    }

    /// Packets sent so far.
    pub fn packets_sent(&self) -> u64 {
        self.packets
    }

    /// Bytes sent so far, including framing and MAC.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes
    }

    /// Outbound keys.
    pub fn keys(&self) -> &KeySlot {
        &self.keys
    }

    /// Mutable outbound keys.
    pub fn keys_mut(&mut self) -> &mut KeySlot {
        &mut self.keys
    }

    #[cfg(test)]
    pub(crate) fn set_sequence(&mut self, seq: u32) {
        self.seq = seq;
    }

    /// Frames, protects and writes one payload, bypassing the pause.
    pub async fn write_payload(&mut self, payload: Bytes) -> ConduitResult<()> {
        if self.closed {
            return Err(ConduitError::SessionClosed(
                "transport is closed".to_string(),
            ));
        }

        let seq = self.seq;
        let keys = self.keys.current_mut();
        let payload = keys.compression_mut().compress(payload)?;
        let mut packet = frame(
            payload,
            keys.cipher().block_size(),
            keys.cipher().length_in_clear(),
        )?;

        let mac = keys.mac().map(|m| m.compute(seq, &packet));
        keys.cipher_mut().seal(seq, &mut packet)?;
        if let Some(mac) = mac {
            packet.extend_from_slice(&mac);
        }

        self.stream.write_all(&packet).await?;
        self.stream.flush().await?;

        self.seq = seq.wrapping_add(1);
        self.packets += 1;
        self.bytes += packet.len() as u64;
        trace!(seq, len = packet.len(), "packet sent");
        Ok(())
    }

    /// Sends a message, queueing it if a key exchange forbids it right now.
    pub async fn send(&mut self, msg: &Message) -> ConduitResult<()> {
        if self.closed {
            return Err(ConduitError::SessionClosed(
                "transport is closed".to_string(),
            ));
        }
        let payload = msg.encode();
        if self.paused && !permitted_during_kex(msg.tag()) {
            trace!(msg = msg.name(), "deferred until key exchange completes");
            self.deferred.push_back(payload);
            return Ok(());
        }
        self.write_payload(payload).await
    }

    /// True while a key exchange holds back ordinary messages.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Number of messages waiting for the key exchange to finish.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Starts holding back non key exchange messages.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Stops holding back messages and flushes the queue in order.
    pub async fn resume(&mut self) -> ConduitResult<()> {
        self.paused = false;
        if !self.deferred.is_empty() {
            debug!(count = self.deferred.len(), "flushing deferred messages");
        }
        while let Some(payload) = self.deferred.pop_front() {
            self.write_payload(payload).await?;
        }
        Ok(())
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Refuses all further sends and shuts the stream down.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.deferred.clear();
        if let Err(e) = self.stream.shutdown().await {
            debug!("transport shutdown: {}", e);
        }
    }
}
