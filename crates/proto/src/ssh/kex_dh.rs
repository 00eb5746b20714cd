//! Elliptic-curve Diffie-Hellman key exchange (RFC 5656, RFC 8731).
//!
//! This module implements:
//! - Curve25519-SHA256 (`curve25519-sha256`, `curve25519-sha256@libssh.org`)
//! - The exchange hash H over the ECDH transcript
//! - Key derivation (RFC 4253 Section 7.2)
//!
//! # Key Derivation
//!
//! Keys are derived with the key exchange hash:
//!
//! ```text
//! Initial IV client to server:     HASH(K || H || "A" || session_id)
//! Initial IV server to client:     HASH(K || H || "B" || session_id)
//! Encryption key client to server: HASH(K || H || "C" || session_id)
//! Encryption key server to client: HASH(K || H || "D" || session_id)
//! Integrity key client to server:  HASH(K || H || "E" || session_id)
//! Integrity key server to client:  HASH(K || H || "F" || session_id)
//! ```
//!
//! Longer keys are extended with `HASH(K || H || K1 || K2 ...)`.

use bytes::BytesMut;
use conduit_platform::{ConduitError, ConduitResult};
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256, Sha512};

use super::crypto::KeyExchangeMethod;
use super::wire::SshBufMut;

/// Hash function of a key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexHash {
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
}

impl KexHash {
    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            KexHash::Sha256 => 32,
            KexHash::Sha512 => 64,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            KexHash::Sha256 => {
                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
            KexHash::Sha512 => {
                let mut hasher = Sha512::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
        }
    }
}

/// Curve25519 key exchange (RFC 8731).
///
/// The ephemeral private key is consumed by the first call to
/// [`KeyExchangeMethod::compute_shared_secret`].
pub struct Curve25519Exchange {
    name: String,
    private_key: Option<EphemeralPrivateKey>,
    public_key: [u8; 32],
}

impl std::fmt::Debug for Curve25519Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Curve25519Exchange")
            .field("name", &self.name)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl Curve25519Exchange {
    /// Generates a fresh ephemeral key pair.
    ///
    /// ```rust
    /// use conduit_proto::ssh::kex_dh::Curve25519Exchange;
    /// use conduit_proto::ssh::crypto::KeyExchangeMethod;
    ///
    /// let exchange = Curve25519Exchange::new("curve25519-sha256").unwrap();
    /// assert_eq!(exchange.client_public().len(), 32);
    /// ```
    pub fn new(name: &str) -> ConduitResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| ConduitError::Security("Failed to generate Curve25519 key".to_string()))?;

        let public_key = private_key.compute_public_key().map_err(|_| {
            ConduitError::Security("Failed to compute Curve25519 public key".to_string())
        })?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            name: name.to_string(),
            private_key: Some(private_key),
            public_key: public_key_bytes,
        })
    }
}

impl KeyExchangeMethod for Curve25519Exchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn hash(&self) -> KexHash {
        KexHash::Sha256
    }

    fn client_public(&self) -> &[u8] {
        &self.public_key
    }

    fn compute_shared_secret(&mut self, peer_public: &[u8]) -> ConduitResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(ConduitError::Security(format!(
                "Curve25519 public key must be 32 bytes, got {}",
                peer_public.len()
            )));
        }
        let private_key = self.private_key.take().ok_or_else(|| {
            ConduitError::Protocol("Curve25519 key already used".to_string())
        })?;
        let peer_public_key = UnparsedPublicKey::new(&X25519, peer_public);

        agree_ephemeral(private_key, &peer_public_key, |key_material| {
            key_material.to_vec()
        })
        .map_err(|_| ConduitError::Security("Curve25519 key agreement failed".to_string()))
    }
}

/// Transcript covered by the exchange hash (RFC 5656 Section 4).
#[derive(Debug, Clone, Copy)]
pub struct ExchangeHashInput<'a> {
    /// Client identification string, without CR LF
    pub client_version: &'a [u8],
    /// Server identification string, without CR LF
    pub server_version: &'a [u8],
    /// Payload of the client's SSH_MSG_KEXINIT
    pub client_kexinit: &'a [u8],
    /// Payload of the server's SSH_MSG_KEXINIT
    pub server_kexinit: &'a [u8],
    /// Server host key blob
    pub host_key: &'a [u8],
    /// Client ephemeral public key
    pub client_public: &'a [u8],
    /// Server ephemeral public key
    pub server_public: &'a [u8],
    /// Shared secret K as an unsigned big-endian integer
    pub shared_secret: &'a [u8],
}

/// Computes H for an ECDH key exchange.
pub fn exchange_hash(hash: KexHash, input: &ExchangeHashInput<'_>) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(1024);
    buf.put_ssh_string(input.client_version);
    buf.put_ssh_string(input.server_version);
    buf.put_ssh_string(input.client_kexinit);
    buf.put_ssh_string(input.server_kexinit);
    buf.put_ssh_string(input.host_key);
    buf.put_ssh_string(input.client_public);
    buf.put_ssh_string(input.server_public);
    buf.put_mpint_unsigned(input.shared_secret);
    hash.digest(&[&buf[..]])
}

/// Derives key material (RFC 4253 Section 7.2).
///
/// ```rust
/// use conduit_proto::ssh::kex_dh::{derive_key, KexHash};
///
/// let shared_secret = vec![0x42; 32];
/// let exchange_hash = vec![0x01; 32];
/// let session_id = vec![0x02; 32];
///
/// let key = derive_key(KexHash::Sha256, &shared_secret, &exchange_hash, &session_id, b'C', 64);
/// assert_eq!(key.len(), 64);
/// ```
pub fn derive_key(
    hash: KexHash,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    key_type: u8,
    key_length: usize,
) -> Vec<u8> {
    let mut k_mpint = BytesMut::with_capacity(shared_secret.len() + 5);
    k_mpint.put_mpint_unsigned(shared_secret);

    let mut key = hash.digest(&[&k_mpint[..], exchange_hash, &[key_type], session_id]);
    while key.len() < key_length {
        let block = hash.digest(&[&k_mpint[..], exchange_hash, &key[..]]);
        key.extend_from_slice(&block);
    }

    key.truncate(key_length);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curve25519_key_exchange() {
        let mut client = Curve25519Exchange::new("curve25519-sha256").unwrap();
        let mut server = Curve25519Exchange::new("curve25519-sha256").unwrap();

        let client_public = client.client_public().to_vec();
        let server_public = server.client_public().to_vec();

        let client_secret = client.compute_shared_secret(&server_public).unwrap();
        let server_secret = server.compute_shared_secret(&client_public).unwrap();

        assert_eq!(client_secret, server_secret);
        assert_eq!(client_secret.len(), 32);
    }

    #[test]
    fn test_curve25519_key_is_single_use() {
        let mut client = Curve25519Exchange::new("curve25519-sha256").unwrap();
        let server = Curve25519Exchange::new("curve25519-sha256").unwrap();
        let server_public = server.client_public().to_vec();

        client.compute_shared_secret(&server_public).unwrap();
        assert!(client.compute_shared_secret(&server_public).is_err());
    }

    #[test]
    fn test_curve25519_rejects_short_key() {
        let mut client = Curve25519Exchange::new("curve25519-sha256").unwrap();
        assert!(client.compute_shared_secret(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_derive_key_lengths() {
        let k = vec![0x42; 32];
        let h = vec![0x01; 32];

        let short = derive_key(KexHash::Sha256, &k, &h, &h, b'A', 12);
        let long = derive_key(KexHash::Sha256, &k, &h, &h, b'A', 80);
        assert_eq!(short.len(), 12);
        assert_eq!(long.len(), 80);
        // Extension keeps the first block as prefix
        assert_eq!(&long[..12], &short[..]);
    }

    #[test]
    fn test_derive_key_letters_differ() {
        let k = vec![0x42; 32];
        let h = vec![0x01; 32];
        let c = derive_key(KexHash::Sha256, &k, &h, &h, b'C', 32);
        let d = derive_key(KexHash::Sha256, &k, &h, &h, b'D', 32);
        assert_ne!(c, d);
    }

    #[test]
    fn test_derive_key_first_block() {
        let k = [0x80u8; 4];
        let h = [0x05u8; 32];
        let sid = [0x06u8; 32];

        // mpint with a leading zero because the high bit is set
        let k_mpint = [0, 0, 0, 5, 0, 0x80, 0x80, 0x80, 0x80];
        let expected = KexHash::Sha256.digest(&[&k_mpint[..], &h[..], &b"E"[..], &sid[..]]);

        assert_eq!(derive_key(KexHash::Sha256, &k, &h, &sid, b'E', 32), expected);
    }

    #[test]
    fn test_exchange_hash_is_deterministic() {
        let input = ExchangeHashInput {
            client_version: b"SSH-2.0-a",
            server_version: b"SSH-2.0-b",
            client_kexinit: &[20, 1],
            server_kexinit: &[20, 2],
            host_key: b"key",
            client_public: &[1; 32],
            server_public: &[2; 32],
            shared_secret: &[3; 32],
        };
        let h1 = exchange_hash(KexHash::Sha256, &input);
        let h2 = exchange_hash(KexHash::Sha256, &input);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 32);

        let other = ExchangeHashInput {
            server_public: &[4; 32],
            ..input
        };
        assert_ne!(exchange_hash(KexHash::Sha256, &other), h1);
    }
}
