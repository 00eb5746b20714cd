//! Per-direction session keys.
//!
//! Each direction owns a [`KeySlot`] holding the keys in use and, during a
//! key exchange, the keys waiting to take over. The two slots switch
//! independently: outbound when we send SSH_MSG_NEWKEYS, inbound when the
//! peer's SSH_MSG_NEWKEYS arrives.

use conduit_platform::{ConduitError, ConduitResult};

use super::crypto::{Compression, NoCompression, NoneCipher, PacketCipher, PacketMac};

/// Cipher, MAC and compression for one direction.
pub struct DirectionKeys {
    cipher: Box<dyn PacketCipher>,
    mac: Option<Box<dyn PacketMac>>,
    compression: Box<dyn Compression>,
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("cipher", &self.cipher.name())
            .field("mac", &self.mac.as_ref().map(|m| m.name().to_string()))
            .field("compression", &self.compression.name())
            .finish()
    }
}

impl DirectionKeys {
    /// Creates a key set from provider objects.
    pub fn new(
        cipher: Box<dyn PacketCipher>,
        mac: Option<Box<dyn PacketMac>>,
        compression: Box<dyn Compression>,
    ) -> Self {
        Self {
            cipher,
            mac,
            compression,
        }
    }

    /// The cleartext key set used before the first key exchange.
    pub fn cleartext() -> Self {
        Self::new(Box::new(NoneCipher), None, Box::new(NoCompression))
    }

    /// Cipher of this direction.
    pub fn cipher(&self) -> &dyn PacketCipher {
        self.cipher.as_ref()
    }

    /// Mutable cipher of this direction.
    pub fn cipher_mut(&mut self) -> &mut dyn PacketCipher {
        self.cipher.as_mut()
    }

    /// MAC of this direction, `None` for AEAD ciphers and cleartext.
    pub fn mac(&self) -> Option<&dyn PacketMac> {
        self.mac.as_deref()
    }

    /// Compression of this direction.
    pub fn compression_mut(&mut self) -> &mut dyn Compression {
        self.compression.as_mut()
    }

    /// Length of the trailer after the encrypted packet.
    pub fn trailer_len(&self) -> usize {
        self.cipher.tag_size() + self.mac.as_ref().map_or(0, |m| m.mac_size())
    }
}

/// Current and pending keys of one direction.
///
/// ```rust
/// use conduit_proto::ssh::keys::{DirectionKeys, KeySlot};
///
/// let mut slot = KeySlot::new();
/// slot.stage(DirectionKeys::cleartext()).unwrap();
/// assert!(slot.has_pending());
///
/// slot.activate().unwrap();
/// assert!(!slot.has_pending());
/// assert_eq!(slot.generation(), 1);
/// ```
#[derive(Debug)]
pub struct KeySlot {
    current: DirectionKeys,
    pending: Option<DirectionKeys>,
    generation: u32,
}

impl Default for KeySlot {
    fn default() -> Self {
        Self::new()
    }
}

impl KeySlot {
    /// Starts with cleartext keys and nothing pending.
    pub fn new() -> Self {
        Self {
            current: DirectionKeys::cleartext(),
            pending: None,
            generation: 0,
        }
    }

    /// Keys in use.
    pub fn current(&self) -> &DirectionKeys {
        &self.current
    }

    /// Mutable keys in use.
    pub fn current_mut(&mut self) -> &mut DirectionKeys {
        &mut self.current
    }

    /// True between [`stage`](Self::stage) and [`activate`](Self::activate).
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Number of completed switchovers.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Installs the keys derived by a key exchange, without using them yet.
    pub fn stage(&mut self, keys: DirectionKeys) -> ConduitResult<()> {
        if self.pending.is_some() {
            return Err(ConduitError::Protocol(
                "new keys staged twice in one key exchange".to_string(),
            ));
        }
        self.pending = Some(keys);
        Ok(())
    }

    /// Switches to the staged keys, retiring the current set.
    pub fn activate(&mut self) -> ConduitResult<()> {
        let next = self.pending.take().ok_or_else(|| {
            ConduitError::Protocol("SSH_MSG_NEWKEYS without a completed key exchange".to_string())
        })?;
        self.current = next;
        self.generation = self.generation.wrapping_add(1);
        Ok(())
    }
}
