//! Algorithm provider interface and the default algorithm set.
//!
//! The transport and key exchange never look inside an algorithm: they ask
//! an [`AlgorithmProvider`] for an object by negotiated name and drive it
//! through the [`PacketCipher`], [`PacketMac`], [`Compression`] and
//! [`KeyExchangeMethod`] traits.
//!
//! # Supported Algorithms
//!
//! [`DefaultAlgorithmProvider`] supports:
//! - Key exchange: `curve25519-sha256`, `curve25519-sha256@libssh.org`
//! - Host key: `ssh-ed25519`
//! - Ciphers: `aes256-gcm@openssh.com`, `aes128-gcm@openssh.com`,
//!   `aes256-ctr`, `aes128-ctr`, `none`
//! - MACs: `hmac-sha2-256`, `hmac-sha2-512`, `none`
//! - Compression: `none`
//!
//! # Security
//!
//! - MAC verification is constant-time ([`subtle`])
//! - AEAD via `ring`, counter mode via the `aes` block cipher
//! - Key material never appears in `Debug` output

use bytes::Bytes;
use cipher::{BlockEncrypt, KeyInit};
use conduit_platform::{ConduitError, ConduitResult};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

use super::kex_dh::{Curve25519Exchange, KexHash};
use super::wire::{SshBufMut, WireReader};

/// Name of the identity algorithm for every category.
pub const NONE: &str = "none";

/// Ed25519 host key algorithm name.
pub const SSH_ED25519: &str = "ssh-ed25519";

/// Encrypts and decrypts binary packets for one direction.
///
/// Non-AEAD ciphers treat the packet as one continuous stream: the
/// transport decrypts the first block to learn the length, then the rest.
/// AEAD ciphers receive the whole packet at once through [`open`].
///
/// [`open`]: PacketCipher::open
pub trait PacketCipher: Send + Sync {
    /// Negotiated algorithm name.
    fn name(&self) -> &str;

    /// Cipher block size in bytes.
    fn block_size(&self) -> usize;

    /// Length of the authentication tag appended by AEAD ciphers.
    fn tag_size(&self) -> usize {
        0
    }

    /// True if the packet length field is sent unencrypted.
    fn length_in_clear(&self) -> bool {
        false
    }

    /// Encrypts a framed packet in place. AEAD ciphers append their tag.
    fn seal(&mut self, seq: u32, packet: &mut Vec<u8>) -> ConduitResult<()>;

    /// Decrypts the next part of a packet in place (non-AEAD only).
    fn decrypt(&mut self, seq: u32, data: &mut [u8]) -> ConduitResult<()>;

    /// Authenticates and decrypts `length || ciphertext || tag` in place,
    /// removing the tag (AEAD only).
    fn open(&mut self, _seq: u32, _packet: &mut Vec<u8>) -> ConduitResult<()> {
        Err(ConduitError::Unsupported(format!(
            "{} is not an AEAD cipher",
            self.name()
        )))
    }
}

/// Computes and verifies packet MACs for one direction.
pub trait PacketMac: Send + Sync {
    /// Negotiated algorithm name.
    fn name(&self) -> &str;

    /// MAC length in bytes.
    fn mac_size(&self) -> usize;

    /// Computes `MAC(key, seq || packet)` over the unencrypted packet.
    fn compute(&self, seq: u32, packet: &[u8]) -> Vec<u8>;

    /// Verifies a received MAC in constant time.
    fn verify(&self, seq: u32, packet: &[u8], mac: &[u8]) -> bool {
        let expected = self.compute(seq, packet);
        expected.ct_eq(mac).into()
    }
}

/// Payload compression for one direction.
pub trait Compression: Send + Sync {
    /// Negotiated algorithm name.
    fn name(&self) -> &str;

    /// Compresses an outgoing payload.
    fn compress(&mut self, payload: Bytes) -> ConduitResult<Bytes>;

    /// Decompresses an incoming payload.
    fn decompress(&mut self, payload: Bytes) -> ConduitResult<Bytes>;
}

/// One run of an ephemeral key agreement.
pub trait KeyExchangeMethod: Send {
    /// Negotiated algorithm name.
    fn name(&self) -> &str;

    /// Hash used for the exchange hash and key derivation.
    fn hash(&self) -> KexHash;

    /// Our ephemeral public value (Q_C).
    fn client_public(&self) -> &[u8];

    /// Computes the shared secret K from the peer's public value.
    fn compute_shared_secret(&mut self, peer_public: &[u8]) -> ConduitResult<Vec<u8>>;
}

/// Algorithm categories negotiated by KEXINIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmCategory {
    /// Key exchange methods
    KeyExchange,
    /// Server host key algorithms
    HostKey,
    /// Encryption algorithms
    Cipher,
    /// MAC algorithms
    Mac,
    /// Compression algorithms
    Compression,
}

/// Key material sizes of a cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSpec {
    /// Key length in bytes
    pub key_len: usize,
    /// IV length in bytes
    pub iv_len: usize,
    /// Whether the cipher authenticates packets itself (no separate MAC)
    pub aead: bool,
}

/// Source of algorithm implementations, looked up by negotiated name.
pub trait AlgorithmProvider: Send + Sync {
    /// Names this provider implements, most preferred first.
    fn supported(&self, category: AlgorithmCategory) -> Vec<String>;

    /// Starts a key exchange.
    fn key_exchange(&self, name: &str) -> ConduitResult<Box<dyn KeyExchangeMethod>>;

    /// Key and IV lengths for a cipher.
    fn cipher_spec(&self, name: &str) -> ConduitResult<CipherSpec>;

    /// Creates a keyed cipher.
    fn cipher(&self, name: &str, key: &[u8], iv: &[u8]) -> ConduitResult<Box<dyn PacketCipher>>;

    /// Key length for a MAC.
    fn mac_key_len(&self, name: &str) -> ConduitResult<usize>;

    /// Creates a keyed MAC, or `None` for `none`.
    fn mac(&self, name: &str, key: &[u8]) -> ConduitResult<Option<Box<dyn PacketMac>>>;

    /// Creates a compressor.
    fn compression(&self, name: &str) -> ConduitResult<Box<dyn Compression>>;

    /// Verifies the server's signature over the exchange hash.
    fn verify_host_signature(
        &self,
        algorithm: &str,
        host_key: &[u8],
        signature: &[u8],
        exchange_hash: &[u8],
    ) -> ConduitResult<()>;
}

/// The identity cipher used before the first key exchange.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneCipher;

impl PacketCipher for NoneCipher {
    fn name(&self) -> &str {
        NONE
    }

    fn block_size(&self) -> usize {
        8
    }

    fn seal(&mut self, _seq: u32, _packet: &mut Vec<u8>) -> ConduitResult<()> {
        Ok(())
    }

    fn decrypt(&mut self, _seq: u32, _data: &mut [u8]) -> ConduitResult<()> {
        Ok(())
    }
}

enum AesCore {
    Aes128(aes::Aes128),
    Aes256(aes::Aes256),
}

/// AES in counter mode (RFC 4344), as a continuous keystream per direction.
pub struct AesCtrCipher {
    name: &'static str,
    core: AesCore,
    counter: u128,
    keystream: [u8; 16],
    used: usize,
}

impl std::fmt::Debug for AesCtrCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCtrCipher")
            .field("name", &self.name)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl AesCtrCipher {
    /// Creates the cipher from a 16 or 32 byte key and a 16 byte IV.
    pub fn new(key: &[u8], iv: &[u8]) -> ConduitResult<Self> {
        let (name, core) = match key.len() {
            16 => (
                "aes128-ctr",
                AesCore::Aes128(
                    <aes::Aes128 as KeyInit>::new_from_slice(key)
                        .map_err(|_| ConduitError::Security("Invalid AES-128 key".to_string()))?,
                ),
            ),
            32 => (
                "aes256-ctr",
                AesCore::Aes256(
                    <aes::Aes256 as KeyInit>::new_from_slice(key)
                        .map_err(|_| ConduitError::Security("Invalid AES-256 key".to_string()))?,
                ),
            ),
            n => {
                return Err(ConduitError::Security(format!(
                    "AES-CTR key must be 16 or 32 bytes, got {}",
                    n
                )))
            }
        };
        let iv: [u8; 16] = iv.try_into().map_err(|_| {
            ConduitError::Security(format!("AES-CTR IV must be 16 bytes, got {}", iv.len()))
        })?;

        Ok(Self {
            name,
            core,
            counter: u128::from_be_bytes(iv),
            keystream: [0u8; 16],
            used: 16,
        })
    }

    fn refill(&mut self) {
        let mut block = aes::Block::clone_from_slice(&self.counter.to_be_bytes());
        match &self.core {
            AesCore::Aes128(c) => c.encrypt_block(&mut block),
            AesCore::Aes256(c) => c.encrypt_block(&mut block),
        }
        self.keystream.copy_from_slice(&block);
        self.counter = self.counter.wrapping_add(1);
        self.used = 0;
    }

    fn apply_keystream(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            if self.used == 16 {
                self.refill();
            }
            *byte ^= self.keystream[self.used];
            self.used += 1;
        }
    }
}

impl PacketCipher for AesCtrCipher {
    fn name(&self) -> &str {
        self.name
    }

    fn block_size(&self) -> usize {
        16
    }

    fn seal(&mut self, _seq: u32, packet: &mut Vec<u8>) -> ConduitResult<()> {
        self.apply_keystream(packet);
        Ok(())
    }

    fn decrypt(&mut self, _seq: u32, data: &mut [u8]) -> ConduitResult<()> {
        self.apply_keystream(data);
        Ok(())
    }
}

/// AES-GCM as used by `aesNNN-gcm@openssh.com` (RFC 5647).
///
/// The packet length is sent in clear and authenticated as associated
/// data. The 12-byte nonce is a 4-byte fixed field followed by a 64-bit
/// invocation counter incremented after every packet.
pub struct AesGcmCipher {
    name: &'static str,
    key: LessSafeKey,
    nonce: [u8; 12],
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher")
            .field("name", &self.name)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl AesGcmCipher {
    /// AEAD tag length.
    pub const TAG_LEN: usize = 16;

    /// Creates the cipher from a 16 or 32 byte key and a 12 byte IV.
    pub fn new(key: &[u8], iv: &[u8]) -> ConduitResult<Self> {
        let (name, algorithm) = match key.len() {
            16 => ("aes128-gcm@openssh.com", &AES_128_GCM),
            32 => ("aes256-gcm@openssh.com", &AES_256_GCM),
            n => {
                return Err(ConduitError::Security(format!(
                    "AES-GCM key must be 16 or 32 bytes, got {}",
                    n
                )))
            }
        };
        let unbound = UnboundKey::new(algorithm, key)
            .map_err(|_| ConduitError::Security("Failed to create AES-GCM key".to_string()))?;
        let nonce: [u8; 12] = iv.try_into().map_err(|_| {
            ConduitError::Security(format!("AES-GCM IV must be 12 bytes, got {}", iv.len()))
        })?;

        Ok(Self {
            name,
            key: LessSafeKey::new(unbound),
            nonce,
        })
    }

    fn next_nonce(&mut self) -> Nonce {
        let current = Nonce::assume_unique_for_key(self.nonce);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.nonce[4..]);
        let next = u64::from_be_bytes(counter).wrapping_add(1);
        self.nonce[4..].copy_from_slice(&next.to_be_bytes());
        current
    }
}

impl PacketCipher for AesGcmCipher {
    fn name(&self) -> &str {
        self.name
    }

    fn block_size(&self) -> usize {
        16
    }

    fn tag_size(&self) -> usize {
        Self::TAG_LEN
    }

    fn length_in_clear(&self) -> bool {
        true
    }

    fn seal(&mut self, _seq: u32, packet: &mut Vec<u8>) -> ConduitResult<()> {
        if packet.len() < 4 {
            return Err(ConduitError::InvalidFormat("packet shorter than length field".into()));
        }
        let mut aad = [0u8; 4];
        aad.copy_from_slice(&packet[..4]);
        let nonce = self.next_nonce();
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::from(aad), &mut packet[4..])
            .map_err(|_| ConduitError::Security("AES-GCM encryption failed".to_string()))?;
        packet.extend_from_slice(tag.as_ref());
        Ok(())
    }

    fn decrypt(&mut self, _seq: u32, _data: &mut [u8]) -> ConduitResult<()> {
        Err(ConduitError::Unsupported(
            "AES-GCM packets must be opened whole".to_string(),
        ))
    }

    fn open(&mut self, _seq: u32, packet: &mut Vec<u8>) -> ConduitResult<()> {
        if packet.len() < 4 + Self::TAG_LEN {
            return Err(ConduitError::InvalidFormat(
                "AES-GCM packet shorter than tag".to_string(),
            ));
        }
        let mut aad = [0u8; 4];
        aad.copy_from_slice(&packet[..4]);
        let nonce = self.next_nonce();
        let plaintext_len = self
            .key
            .open_in_place(nonce, Aad::from(aad), &mut packet[4..])
            .map_err(|_| ConduitError::Integrity("AES-GCM tag mismatch".to_string()))?
            .len();
        packet.truncate(4 + plaintext_len);
        Ok(())
    }
}

enum HmacInner {
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

/// HMAC-SHA2 packet MAC (RFC 6668).
pub struct HmacSha2 {
    inner: HmacInner,
}

impl std::fmt::Debug for HmacSha2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSha2")
            .field("name", &self.name())
            .field("key", &"<redacted>")
            .finish()
    }
}

impl HmacSha2 {
    /// Creates `hmac-sha2-256` or `hmac-sha2-512` keyed with `key`.
    pub fn new(name: &str, key: &[u8]) -> ConduitResult<Self> {
        let bad_key = |_| ConduitError::Security(format!("Invalid {} key", name));
        let inner = match name {
            "hmac-sha2-256" => {
                HmacInner::Sha256(<Hmac<Sha256> as Mac>::new_from_slice(key).map_err(bad_key)?)
            }
            "hmac-sha2-512" => {
                HmacInner::Sha512(<Hmac<Sha512> as Mac>::new_from_slice(key).map_err(bad_key)?)
            }
            other => {
                return Err(ConduitError::Unsupported(format!(
                    "MAC algorithm '{}'",
                    other
                )))
            }
        };
        Ok(Self { inner })
    }
}

impl PacketMac for HmacSha2 {
    fn name(&self) -> &str {
        match self.inner {
            HmacInner::Sha256(_) => "hmac-sha2-256",
            HmacInner::Sha512(_) => "hmac-sha2-512",
        }
    }

    fn mac_size(&self) -> usize {
        match self.inner {
            HmacInner::Sha256(_) => 32,
            HmacInner::Sha512(_) => 64,
        }
    }

    fn compute(&self, seq: u32, packet: &[u8]) -> Vec<u8> {
        match &self.inner {
            HmacInner::Sha256(keyed) => {
                let mut mac = keyed.clone();
                mac.update(&seq.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            HmacInner::Sha512(keyed) => {
                let mut mac = keyed.clone();
                mac.update(&seq.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

/// The `none` compression method.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl Compression for NoCompression {
    fn name(&self) -> &str {
        NONE
    }

    fn compress(&mut self, payload: Bytes) -> ConduitResult<Bytes> {
        Ok(payload)
    }

    fn decompress(&mut self, payload: Bytes) -> ConduitResult<Bytes> {
        Ok(payload)
    }
}

/// Encodes an Ed25519 public key as an SSH host key blob.
pub fn ed25519_host_key_blob(public_key: &[u8; 32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(51);
    blob.put_ssh_utf8(SSH_ED25519);
    blob.put_ssh_string(public_key);
    blob
}

/// Encodes an Ed25519 signature as an SSH signature blob.
pub fn ed25519_signature_blob(signature: &[u8; 64]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(83);
    blob.put_ssh_utf8(SSH_ED25519);
    blob.put_ssh_string(signature);
    blob
}

fn parse_typed_blob(blob: &[u8], expected_type: &str, len: usize) -> ConduitResult<Bytes> {
    let mut r = WireReader::new(Bytes::copy_from_slice(blob));
    let key_type = r.read_utf8()?;
    if key_type != expected_type {
        return Err(ConduitError::Security(format!(
            "expected {} blob, got '{}'",
            expected_type, key_type
        )));
    }
    let data = r.read_string()?;
    r.finish(expected_type)?;
    if data.len() != len {
        return Err(ConduitError::Security(format!(
            "{} blob must carry {} bytes, got {}",
            expected_type,
            len,
            data.len()
        )));
    }
    Ok(data)
}

fn verify_ed25519(host_key: &[u8], signature: &[u8], message: &[u8]) -> ConduitResult<()> {
    let key = parse_typed_blob(host_key, SSH_ED25519, 32)?;
    let sig = parse_typed_blob(signature, SSH_ED25519, 64)?;

    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(&key);
    let mut sig_bytes = [0u8; 64];
    sig_bytes.copy_from_slice(&sig);

    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| ConduitError::Security(format!("Invalid Ed25519 public key: {}", e)))?;
    let signature = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify(message, &signature)
        .map_err(|_| ConduitError::Security("Ed25519 signature verification failed".to_string()))
}

/// Algorithms implemented by this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAlgorithmProvider;

impl AlgorithmProvider for DefaultAlgorithmProvider {
    fn supported(&self, category: AlgorithmCategory) -> Vec<String> {
        let names: &[&str] = match category {
            AlgorithmCategory::KeyExchange => &["curve25519-sha256", "curve25519-sha256@libssh.org"],
            AlgorithmCategory::HostKey => &[SSH_ED25519],
            AlgorithmCategory::Cipher => &[
                "aes256-gcm@openssh.com",
                "aes128-gcm@openssh.com",
                "aes256-ctr",
                "aes128-ctr",
            ],
            AlgorithmCategory::Mac => &["hmac-sha2-256", "hmac-sha2-512"],
            AlgorithmCategory::Compression => &[NONE],
        };
        names.iter().map(|s| s.to_string()).collect()
    }

    fn key_exchange(&self, name: &str) -> ConduitResult<Box<dyn KeyExchangeMethod>> {
        match name {
            "curve25519-sha256" | "curve25519-sha256@libssh.org" => {
                Ok(Box::new(Curve25519Exchange::new(name)?))
            }
            other => Err(ConduitError::Unsupported(format!(
                "key exchange method '{}'",
                other
            ))),
        }
    }

    fn cipher_spec(&self, name: &str) -> ConduitResult<CipherSpec> {
        let spec = match name {
            NONE => CipherSpec {
                key_len: 0,
                iv_len: 0,
                aead: false,
            },
            "aes128-ctr" => CipherSpec {
                key_len: 16,
                iv_len: 16,
                aead: false,
            },
            "aes256-ctr" => CipherSpec {
                key_len: 32,
                iv_len: 16,
                aead: false,
            },
            "aes128-gcm@openssh.com" => CipherSpec {
                key_len: 16,
                iv_len: 12,
                aead: true,
            },
            "aes256-gcm@openssh.com" => CipherSpec {
                key_len: 32,
                iv_len: 12,
                aead: true,
            },
            other => {
                return Err(ConduitError::Unsupported(format!("cipher '{}'", other)));
            }
        };
        Ok(spec)
    }

    fn cipher(&self, name: &str, key: &[u8], iv: &[u8]) -> ConduitResult<Box<dyn PacketCipher>> {
        match name {
            NONE => Ok(Box::new(NoneCipher)),
            "aes128-ctr" | "aes256-ctr" => Ok(Box::new(AesCtrCipher::new(key, iv)?)),
            "aes128-gcm@openssh.com" | "aes256-gcm@openssh.com" => {
                Ok(Box::new(AesGcmCipher::new(key, iv)?))
            }
            other => Err(ConduitError::Unsupported(format!("cipher '{}'", other))),
        }
    }

    fn mac_key_len(&self, name: &str) -> ConduitResult<usize> {
        match name {
            NONE => Ok(0),
            "hmac-sha2-256" => Ok(32),
            "hmac-sha2-512" => Ok(64),
            other => Err(ConduitError::Unsupported(format!(
                "MAC algorithm '{}'",
                other
            ))),
        }
    }

    fn mac(&self, name: &str, key: &[u8]) -> ConduitResult<Option<Box<dyn PacketMac>>> {
        if name == NONE {
            return Ok(None);
        }
        Ok(Some(Box::new(HmacSha2::new(name, key)?)))
    }

    fn compression(&self, name: &str) -> ConduitResult<Box<dyn Compression>> {
        match name {
            NONE => Ok(Box::new(NoCompression)),
            other => Err(ConduitError::Unsupported(format!(
                "compression '{}'",
                other
            ))),
        }
    }

    fn verify_host_signature(
        &self,
        algorithm: &str,
        host_key: &[u8],
        signature: &[u8],
        exchange_hash: &[u8],
    ) -> ConduitResult<()> {
        match algorithm {
            SSH_ED25519 => verify_ed25519(host_key, signature, exchange_hash),
            other => Err(ConduitError::Unsupported(format!(
                "host key algorithm '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn framed(len: usize) -> Vec<u8> {
        let mut packet = ((len - 4) as u32).to_be_bytes().to_vec();
        packet.extend((0..len - 4).map(|i| i as u8));
        packet
    }

    #[test]
    fn test_aes_ctr_split_decrypt_matches_whole() {
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let mut enc = AesCtrCipher::new(&key, &iv).unwrap();
        let mut dec = AesCtrCipher::new(&key, &iv).unwrap();

        let plain = framed(48);
        let mut data = plain.clone();
        enc.seal(0, &mut data).unwrap();
        assert_ne!(data, plain);

        // First block, then the remainder, as the transport does
        let (head, tail) = data.split_at_mut(16);
        dec.decrypt(0, head).unwrap();
        dec.decrypt(0, tail).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn test_aes_ctr_stream_continues_across_packets() {
        let key = [1u8; 32];
        let iv = [0xffu8; 16];
        let mut enc = AesCtrCipher::new(&key, &iv).unwrap();
        let mut dec = AesCtrCipher::new(&key, &iv).unwrap();

        for _ in 0..3 {
            let plain = framed(32);
            let mut data = plain.clone();
            enc.seal(0, &mut data).unwrap();
            dec.decrypt(0, &mut data).unwrap();
            assert_eq!(data, plain);
        }
    }

    #[test]
    fn test_aes_ctr_rejects_bad_key() {
        assert!(AesCtrCipher::new(&[0u8; 20], &[0u8; 16]).is_err());
        assert!(AesCtrCipher::new(&[0u8; 16], &[0u8; 8]).is_err());
    }

    #[test]
    fn test_aes_gcm_seal_open() {
        let key = [3u8; 32];
        let iv = [4u8; 12];
        let mut enc = AesGcmCipher::new(&key, &iv).unwrap();
        let mut dec = AesGcmCipher::new(&key, &iv).unwrap();

        let plain = framed(36);
        let mut data = plain.clone();
        enc.seal(5, &mut data).unwrap();
        assert_eq!(data.len(), plain.len() + AesGcmCipher::TAG_LEN);
        // Length stays in clear
        assert_eq!(&data[..4], &plain[..4]);

        dec.open(5, &mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn test_aes_gcm_detects_tampering() {
        let key = [3u8; 16];
        let iv = [4u8; 12];
        let mut enc = AesGcmCipher::new(&key, &iv).unwrap();
        let mut dec = AesGcmCipher::new(&key, &iv).unwrap();

        let mut data = framed(20);
        enc.seal(0, &mut data).unwrap();
        data[8] ^= 0x01;
        assert!(matches!(
            dec.open(0, &mut data),
            Err(ConduitError::Integrity(_))
        ));
    }

    #[test]
    fn test_aes_gcm_nonce_advances() {
        let key = [3u8; 16];
        let iv = [4u8; 12];
        let mut enc = AesGcmCipher::new(&key, &iv).unwrap();

        let mut a = framed(20);
        let mut b = framed(20);
        enc.seal(0, &mut a).unwrap();
        enc.seal(1, &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hmac_sequence_number_is_authenticated() {
        let mac = HmacSha2::new("hmac-sha2-256", &[0x11; 32]).unwrap();
        let packet = framed(16);
        let tag = mac.compute(7, &packet);

        assert_eq!(tag.len(), mac.mac_size());
        assert!(mac.verify(7, &packet, &tag));
        assert!(!mac.verify(8, &packet, &tag));

        let mut flipped = packet.clone();
        flipped[10] ^= 0x80;
        assert!(!mac.verify(7, &flipped, &tag));
    }

    #[test]
    fn test_hmac_sha512_size() {
        let mac = HmacSha2::new("hmac-sha2-512", &[0x22; 64]).unwrap();
        assert_eq!(mac.compute(0, b"x").len(), 64);
        assert!(HmacSha2::new("hmac-md5", &[0; 16]).is_err());
    }

    #[test]
    fn test_ed25519_host_signature() {
        let signing = SigningKey::from_bytes(&[0x5a; 32]);
        let public = signing.verifying_key().to_bytes();
        let hash = [0x42u8; 32];
        let sig = signing.sign(&hash).to_bytes();

        let provider = DefaultAlgorithmProvider;
        let host_key = ed25519_host_key_blob(&public);
        let sig_blob = ed25519_signature_blob(&sig);

        provider
            .verify_host_signature(SSH_ED25519, &host_key, &sig_blob, &hash)
            .unwrap();

        let wrong = [0x43u8; 32];
        assert!(provider
            .verify_host_signature(SSH_ED25519, &host_key, &sig_blob, &wrong)
            .is_err());
    }

    #[test]
    fn test_provider_lookup() {
        let provider = DefaultAlgorithmProvider;
        assert_eq!(provider.cipher_spec("aes256-ctr").unwrap().key_len, 32);
        assert!(provider.cipher_spec("aes128-gcm@openssh.com").unwrap().aead);
        assert!(provider.mac(NONE, &[]).unwrap().is_none());
        assert!(matches!(
            provider.cipher("3des-cbc", &[], &[]),
            Err(ConduitError::Unsupported(_))
        ));
        assert_eq!(
            provider.key_exchange("curve25519-sha256").unwrap().name(),
            "curve25519-sha256"
        );
    }
}
