//! SSH key exchange (KEX) implementation (RFC 4253 Section 7).
//!
//! This module implements SSH key exchange, including:
//! - SSH_MSG_KEXINIT and the ECDH messages (RFC 5656)
//! - Algorithm negotiation
//! - The [`KexCoordinator`] state machine driving initial exchange and rekey
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first match wins)
//! 3. Key exchange (ECDH)
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Each direction switches to the new keys at its own NEWKEYS
//!
//! # Example
//!
//! ```rust
//! use conduit_proto::ssh::kex::KexInit;
//! use conduit_proto::ssh::message::Message;
//!
//! let kexinit = KexInit::new_default();
//! assert!(kexinit.kex_algorithms().contains(&"curve25519-sha256".to_string()));
//!
//! let bytes = Message::KexInit(kexinit).encode();
//! assert_eq!(bytes[0], 20);
//! ```

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use conduit_platform::{ConduitError, ConduitResult};
use rand::RngCore;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::crypto::{AlgorithmCategory, AlgorithmProvider, DefaultAlgorithmProvider, KeyExchangeMethod};
use super::kex_dh::{derive_key, exchange_hash, ExchangeHashInput, KexHash};
use super::keys::{DirectionKeys, KeySlot};
use super::message::{Message, MessageBody};
use super::transport::SharedWriter;
use super::wire::{SshBufMut, WireReader};

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference (most preferred first).
///
/// ```text
/// byte         SSH_MSG_KEXINIT (20)
/// byte[16]     cookie (random bytes)
/// name-list    kex_algorithms
/// name-list    server_host_key_algorithms
/// name-list    encryption_algorithms_client_to_server
/// name-list    encryption_algorithms_server_to_client
/// name-list    mac_algorithms_client_to_server
/// name-list    mac_algorithms_server_to_client
/// name-list    compression_algorithms_client_to_server
/// name-list    compression_algorithms_server_to_client
/// name-list    languages_client_to_server
/// name-list    languages_server_to_client
/// boolean      first_kex_packet_follows
/// uint32       0 (reserved for future extension)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
    reserved: u32,
}

fn random_cookie() -> [u8; 16] {
    let mut cookie = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut cookie);
    cookie
}

impl KexInit {
    /// Creates a KEXINIT proposing the same lists in both directions.
    pub fn new(
        kex: Vec<String>,
        host_key: Vec<String>,
        ciphers: Vec<String>,
        macs: Vec<String>,
        compression: Vec<String>,
    ) -> Self {
        Self {
            cookie: random_cookie(),
            kex_algorithms: kex,
            server_host_key_algorithms: host_key,
            encryption_algorithms_client_to_server: ciphers.clone(),
            encryption_algorithms_server_to_client: ciphers,
            mac_algorithms_client_to_server: macs.clone(),
            mac_algorithms_server_to_client: macs,
            compression_algorithms_client_to_server: compression.clone(),
            compression_algorithms_server_to_client: compression,
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
            reserved: 0,
        }
    }

    /// Proposes everything a provider supports, in its preference order.
    pub fn from_provider(provider: &dyn AlgorithmProvider) -> Self {
        Self::new(
            provider.supported(AlgorithmCategory::KeyExchange),
            provider.supported(AlgorithmCategory::HostKey),
            provider.supported(AlgorithmCategory::Cipher),
            provider.supported(AlgorithmCategory::Mac),
            provider.supported(AlgorithmCategory::Compression),
        )
    }

    /// Proposes the algorithms of [`DefaultAlgorithmProvider`].
    ///
    /// ```rust
    /// use conduit_proto::ssh::kex::KexInit;
    ///
    /// let kexinit = KexInit::new_default();
    /// assert_eq!(kexinit.cookie().len(), 16);
    /// ```
    pub fn new_default() -> Self {
        Self::from_provider(&DefaultAlgorithmProvider)
    }

    /// Sets the `first_kex_packet_follows` flag.
    pub fn with_first_kex_packet_follows(mut self, follows: bool) -> Self {
        self.first_kex_packet_follows = follows;
        self
    }

    /// Copy of this proposal with a new random cookie.
    pub fn with_fresh_cookie(&self) -> Self {
        Self {
            cookie: random_cookie(),
            ..self.clone()
        }
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns the compression algorithms (client to server).
    pub fn compression_algorithms_client_to_server(&self) -> &[String] {
        &self.compression_algorithms_client_to_server
    }

    /// Returns the compression algorithms (server to client).
    pub fn compression_algorithms_server_to_client(&self) -> &[String] {
        &self.compression_algorithms_server_to_client
    }

    /// Returns whether first KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }
}

impl MessageBody for KexInit {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.cookie);
        buf.put_name_list(&self.kex_algorithms);
        buf.put_name_list(&self.server_host_key_algorithms);
        buf.put_name_list(&self.encryption_algorithms_client_to_server);
        buf.put_name_list(&self.encryption_algorithms_server_to_client);
        buf.put_name_list(&self.mac_algorithms_client_to_server);
        buf.put_name_list(&self.mac_algorithms_server_to_client);
        buf.put_name_list(&self.compression_algorithms_client_to_server);
        buf.put_name_list(&self.compression_algorithms_server_to_client);
        buf.put_name_list(&self.languages_client_to_server);
        buf.put_name_list(&self.languages_server_to_client);
        buf.put_ssh_bool(self.first_kex_packet_follows);
        buf.put_ssh_u32(self.reserved);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&r.read_fixed(16)?);

        let msg = Self {
            cookie,
            kex_algorithms: r.read_name_list()?,
            server_host_key_algorithms: r.read_name_list()?,
            encryption_algorithms_client_to_server: r.read_name_list()?,
            encryption_algorithms_server_to_client: r.read_name_list()?,
            mac_algorithms_client_to_server: r.read_name_list()?,
            mac_algorithms_server_to_client: r.read_name_list()?,
            compression_algorithms_client_to_server: r.read_name_list()?,
            compression_algorithms_server_to_client: r.read_name_list()?,
            languages_client_to_server: r.read_name_list()?,
            languages_server_to_client: r.read_name_list()?,
            first_kex_packet_follows: r.read_bool()?,
            reserved: r.read_u32()?,
        };
        r.finish("SSH_MSG_KEXINIT")?;
        Ok(msg)
    }
}

/// SSH_MSG_KEX_ECDH_INIT (RFC 5656 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexEcdhInit {
    /// Client ephemeral public key Q_C
    pub client_public: Bytes,
}

impl MessageBody for KexEcdhInit {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_ssh_string(&self.client_public);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let client_public = r.read_string()?;
        r.finish("SSH_MSG_KEX_ECDH_INIT")?;
        Ok(Self { client_public })
    }
}

/// SSH_MSG_KEX_ECDH_REPLY (RFC 5656 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexEcdhReply {
    /// Server public host key K_S
    pub host_key: Bytes,
    /// Server ephemeral public key Q_S
    pub server_public: Bytes,
    /// Signature over the exchange hash
    pub signature: Bytes,
}

impl MessageBody for KexEcdhReply {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_ssh_string(&self.host_key);
        buf.put_ssh_string(&self.server_public);
        buf.put_ssh_string(&self.signature);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let msg = Self {
            host_key: r.read_string()?,
            server_public: r.read_string()?,
            signature: r.read_string()?,
        };
        r.finish("SSH_MSG_KEX_ECDH_REPLY")?;
        Ok(msg)
    }
}

/// Negotiates algorithms between client and server.
///
/// Uses the first matching algorithm from the client's list that also appears
/// in the server's list (RFC 4253 Section 7.1).
///
/// # Errors
///
/// Returns [`ConduitError::Negotiation`] if no common algorithm is found.
///
/// # Example
///
/// ```rust
/// use conduit_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes128".to_string(), "aes256".to_string()];
/// let server = vec!["aes256".to_string(), "chacha20".to_string()];
///
/// assert_eq!(negotiate_algorithm(&client, &server).unwrap(), "aes256");
/// ```
pub fn negotiate_algorithm(client_list: &[String], server_list: &[String]) -> ConduitResult<String> {
    for client_alg in client_list {
        if server_list.contains(client_alg) {
            return Ok(client_alg.clone());
        }
    }

    Err(ConduitError::Negotiation(format!(
        "No common algorithm: client={:?}, server={:?}",
        client_list, server_list
    )))
}

fn negotiate_category(
    category: &str,
    client_list: &[String],
    server_list: &[String],
) -> ConduitResult<String> {
    negotiate_algorithm(client_list, server_list).map_err(|e| match e {
        ConduitError::Negotiation(detail) => {
            ConduitError::Negotiation(format!("{}: {}", category, detail))
        }
        other => other,
    })
}

/// Algorithms chosen by one key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method
    pub kex: String,
    /// Server host key algorithm
    pub host_key: String,
    /// Cipher client to server
    pub cipher_client_to_server: String,
    /// Cipher server to client
    pub cipher_server_to_client: String,
    /// MAC client to server, `None` when the cipher is AEAD
    pub mac_client_to_server: Option<String>,
    /// MAC server to client, `None` when the cipher is AEAD
    pub mac_server_to_client: Option<String>,
    /// Compression client to server
    pub compression_client_to_server: String,
    /// Compression server to client
    pub compression_server_to_client: String,
}

impl NegotiatedAlgorithms {
    /// Negotiates every category of the two proposals.
    ///
    /// The MAC of a direction is not negotiated when its cipher is AEAD.
    pub fn negotiate(
        client: &KexInit,
        server: &KexInit,
        provider: &dyn AlgorithmProvider,
    ) -> ConduitResult<Self> {
        let kex = negotiate_category("kex", &client.kex_algorithms, &server.kex_algorithms)?;
        let host_key = negotiate_category(
            "host key",
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
        )?;
        let cipher_c2s = negotiate_category(
            "cipher client to server",
            &client.encryption_algorithms_client_to_server,
            &server.encryption_algorithms_client_to_server,
        )?;
        let cipher_s2c = negotiate_category(
            "cipher server to client",
            &client.encryption_algorithms_server_to_client,
            &server.encryption_algorithms_server_to_client,
        )?;

        let mac_c2s = if provider.cipher_spec(&cipher_c2s)?.aead {
            None
        } else {
            Some(negotiate_category(
                "mac client to server",
                &client.mac_algorithms_client_to_server,
                &server.mac_algorithms_client_to_server,
            )?)
        };
        let mac_s2c = if provider.cipher_spec(&cipher_s2c)?.aead {
            None
        } else {
            Some(negotiate_category(
                "mac server to client",
                &client.mac_algorithms_server_to_client,
                &server.mac_algorithms_server_to_client,
            )?)
        };

        Ok(Self {
            kex,
            host_key,
            cipher_client_to_server: cipher_c2s,
            cipher_server_to_client: cipher_s2c,
            mac_client_to_server: mac_c2s,
            mac_server_to_client: mac_s2c,
            compression_client_to_server: negotiate_category(
                "compression client to server",
                &client.compression_algorithms_client_to_server,
                &server.compression_algorithms_client_to_server,
            )?,
            compression_server_to_client: negotiate_category(
                "compression server to client",
                &client.compression_algorithms_server_to_client,
                &server.compression_algorithms_server_to_client,
            )?,
        })
    }

    /// True if the peer's `first_kex_packet_follows` guess was wrong and
    /// its next key exchange packet must be ignored (RFC 4253 Section 7).
    pub fn guess_was_wrong(&self, guesser: &KexInit) -> bool {
        guesser.first_kex_packet_follows
            && (guesser.kex_algorithms.first() != Some(&self.kex)
                || guesser.server_host_key_algorithms.first() != Some(&self.host_key))
    }
}

/// Decides whether a server host key is trusted.
///
/// Called after the server's signature over the exchange hash has been
/// verified, so the server is known to hold the private key.
pub trait HostKeyVerifier: Send + Sync {
    /// Returns an error to reject the key.
    fn verify(&self, algorithm: &str, host_key: &[u8]) -> ConduitResult<()>;
}

/// Trusts every host key. Only suitable for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, algorithm: &str, _host_key: &[u8]) -> ConduitResult<()> {
        warn!(algorithm, "accepting host key without verification");
        Ok(())
    }
}

/// Trusts exactly one host key blob.
#[derive(Debug, Clone)]
pub struct PinnedHostKey {
    blob: Vec<u8>,
}

impl PinnedHostKey {
    /// Pins the given SSH host key blob.
    pub fn new(blob: impl Into<Vec<u8>>) -> Self {
        Self { blob: blob.into() }
    }
}

impl HostKeyVerifier for PinnedHostKey {
    fn verify(&self, algorithm: &str, host_key: &[u8]) -> ConduitResult<()> {
        if host_key == self.blob.as_slice() {
            Ok(())
        } else {
            Err(ConduitError::Security(format!(
                "{} host key does not match the pinned key",
                algorithm
            )))
        }
    }
}

/// Key exchange coordinator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexState {
    /// No KEXINIT pair for the current exchange yet
    Idle,
    /// Both KEXINITs seen, algorithms negotiated
    AlgorithmsExchanged,
    /// Our ephemeral key has been sent
    KeyExchangeInProgress,
    /// Keys derived, our NEWKEYS sent, waiting for the peer's
    KeysDerived,
    /// Both directions run on the keys of the last exchange
    Active,
}

/// Result of a completed key exchange.
#[derive(Debug, Clone)]
pub struct KexOutcome {
    /// Negotiated algorithms
    pub algorithms: NegotiatedAlgorithms,
    /// Session identifier (H of the first exchange)
    pub session_id: Bytes,
    /// Number of completed exchanges, including this one
    pub generation: u64,
}

/// Fixed inputs of every key exchange on one connection.
#[derive(Clone)]
pub struct KexParams {
    /// Our algorithm proposal; the cookie is refreshed per exchange
    pub preferences: KexInit,
    /// Algorithm implementations
    pub provider: Arc<dyn AlgorithmProvider>,
    /// Host key trust policy
    pub verifier: Arc<dyn HostKeyVerifier>,
    /// Our identification string, without CR LF
    pub client_version: String,
    /// Peer identification string, without CR LF
    pub server_version: String,
}

#[derive(Default)]
struct KexRun {
    client_kexinit: Option<(KexInit, Bytes)>,
    server_kexinit: Option<(KexInit, Bytes)>,
    negotiated: Option<NegotiatedAlgorithms>,
    method: Option<Box<dyn KeyExchangeMethod>>,
    discard_next: bool,
}

/// Drives key exchanges over the transport.
///
/// The reader loop feeds every key exchange message to [`handle`]; a rekey
/// is started with [`start`]. Inbound keys are staged into the reader's
/// [`KeySlot`] and switched when the peer's NEWKEYS arrives. Outbound keys
/// switch right after our NEWKEYS is written, under the writer lock.
///
/// [`handle`]: KexCoordinator::handle
/// [`start`]: KexCoordinator::start
pub struct KexCoordinator {
    params: KexParams,
    writer: SharedWriter,
    state: KexState,
    run: Option<KexRun>,
    session_id: Option<Bytes>,
    last: Option<NegotiatedAlgorithms>,
    completed: watch::Sender<u64>,
}

impl std::fmt::Debug for KexCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexCoordinator")
            .field("state", &self.state)
            .field("in_progress", &self.run.is_some())
            .field("algorithms", &self.last)
            .finish()
    }
}

impl KexCoordinator {
    /// Creates a coordinator for a connection whose versions are exchanged.
    pub fn new(params: KexParams, writer: SharedWriter) -> Self {
        let (completed, _) = watch::channel(0);
        Self {
            params,
            writer,
            state: KexState::Idle,
            run: None,
            session_id: None,
            last: None,
            completed,
        }
    }

    /// Current state.
    pub fn state(&self) -> KexState {
        self.state
    }

    /// True between the first KEXINIT of an exchange and its completion.
    pub fn is_in_progress(&self) -> bool {
        self.run.is_some()
    }

    /// Session identifier, once the first exchange has derived keys.
    pub fn session_id(&self) -> Option<&Bytes> {
        self.session_id.as_ref()
    }

    /// Algorithms of the last completed exchange.
    pub fn algorithms(&self) -> Option<&NegotiatedAlgorithms> {
        self.last.as_ref()
    }

    /// Watches the number of completed exchanges.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.completed.subscribe()
    }

    /// Starts an exchange by sending our KEXINIT. Does nothing if one is
    /// already running and ours has been sent.
    pub async fn start(&mut self) -> ConduitResult<()> {
        if self
            .run
            .as_ref()
            .map_or(false, |run| run.client_kexinit.is_some())
        {
            return Ok(());
        }
        self.begin_run();
        self.send_kexinit().await?;
        self.try_negotiate().await
    }

    fn begin_run(&mut self) {
        if self.run.is_none() {
            self.run = Some(KexRun::default());
            self.state = KexState::Idle;
        }
    }

    fn run_mut(&mut self) -> ConduitResult<&mut KexRun> {
        self.run
            .as_mut()
            .ok_or_else(|| ConduitError::Protocol("no key exchange in progress".to_string()))
    }

    async fn send_kexinit(&mut self) -> ConduitResult<()> {
        let kexinit = self.params.preferences.with_fresh_cookie();
        let msg = Message::KexInit(kexinit.clone());
        let payload = msg.encode();
        {
            let mut writer = self.writer.lock().await;
            writer.pause();
            writer.write_payload(payload.clone()).await?;
        }
        debug!("SSH_MSG_KEXINIT sent");
        self.run_mut()?.client_kexinit = Some((kexinit, payload));
        Ok(())
    }

    async fn try_negotiate(&mut self) -> ConduitResult<()> {
        let provider = Arc::clone(&self.params.provider);
        let run = self.run_mut()?;
        let (client, server) = match (&run.client_kexinit, &run.server_kexinit) {
            (Some((client, _)), Some((server, _))) => (client, server),
            _ => return Ok(()),
        };

        let negotiated = NegotiatedAlgorithms::negotiate(client, server, provider.as_ref())?;
        run.discard_next = negotiated.guess_was_wrong(server);
        if run.discard_next {
            debug!("peer guessed the key exchange wrongly, ignoring its next packet");
        }
        debug!(?negotiated, "algorithms negotiated");

        let method = provider.key_exchange(&negotiated.kex)?;
        let init = Message::KexEcdhInit(KexEcdhInit {
            client_public: Bytes::copy_from_slice(method.client_public()),
        });
        run.negotiated = Some(negotiated);
        run.method = Some(method);
        self.state = KexState::AlgorithmsExchanged;

        self.writer.lock().await.send(&init).await?;
        self.state = KexState::KeyExchangeInProgress;
        Ok(())
    }

    /// Handles an inbound key exchange message.
    ///
    /// Returns the outcome when the exchange completes with the peer's
    /// NEWKEYS. `payload` must be the raw packet payload of `msg`.
    pub async fn handle(
        &mut self,
        msg: Message,
        payload: &Bytes,
        inbound: &mut KeySlot,
    ) -> ConduitResult<Option<KexOutcome>> {
        if let Some(run) = self.run.as_mut() {
            if run.discard_next && (30..=49).contains(&msg.tag()) {
                run.discard_next = false;
                debug!(msg = msg.name(), "discarding wrongly guessed key exchange packet");
                return Ok(None);
            }
        }

        match msg {
            Message::KexInit(server) => {
                self.begin_run();
                let run = self.run_mut()?;
                if run.server_kexinit.is_some() {
                    return Err(ConduitError::Protocol(
                        "second SSH_MSG_KEXINIT in one key exchange".to_string(),
                    ));
                }
                run.server_kexinit = Some((server, payload.clone()));
                let ours_sent = run.client_kexinit.is_some();
                debug!("SSH_MSG_KEXINIT received");
                if !ours_sent {
                    self.send_kexinit().await?;
                }
                self.try_negotiate().await?;
                Ok(None)
            }
            Message::KexEcdhReply(reply) => {
                if self.state != KexState::KeyExchangeInProgress {
                    return Err(ConduitError::Protocol(format!(
                        "SSH_MSG_KEX_ECDH_REPLY in state {:?}",
                        self.state
                    )));
                }
                self.complete_exchange(reply, inbound).await?;
                Ok(None)
            }
            Message::NewKeys => {
                if self.state != KexState::KeysDerived {
                    return Err(ConduitError::Protocol(format!(
                        "SSH_MSG_NEWKEYS in state {:?}",
                        self.state
                    )));
                }
                inbound.activate()?;
                self.finish()
            }
            other => Err(ConduitError::Protocol(format!(
                "unexpected {} during key exchange",
                other.name()
            ))),
        }
    }

    async fn complete_exchange(
        &mut self,
        reply: KexEcdhReply,
        inbound: &mut KeySlot,
    ) -> ConduitResult<()> {
        let provider = Arc::clone(&self.params.provider);
        let verifier = Arc::clone(&self.params.verifier);
        let client_version = self.params.client_version.clone();
        let server_version = self.params.server_version.clone();
        let existing_session_id = self.session_id.clone();

        let run = self.run_mut()?;
        let negotiated = run
            .negotiated
            .clone()
            .ok_or_else(|| ConduitError::Protocol("reply before negotiation".to_string()))?;
        let mut method = run
            .method
            .take()
            .ok_or_else(|| ConduitError::Protocol("key exchange method consumed".to_string()))?;
        let (client_payload, server_payload) = match (&run.client_kexinit, &run.server_kexinit) {
            (Some((_, c)), Some((_, s))) => (c.clone(), s.clone()),
            _ => {
                return Err(ConduitError::Protocol(
                    "reply before both KEXINITs".to_string(),
                ))
            }
        };

        let hash = method.hash();
        let shared_secret = Zeroizing::new(method.compute_shared_secret(&reply.server_public)?);
        let h = exchange_hash(
            hash,
            &ExchangeHashInput {
                client_version: client_version.as_bytes(),
                server_version: server_version.as_bytes(),
                client_kexinit: &client_payload,
                server_kexinit: &server_payload,
                host_key: &reply.host_key,
                client_public: method.client_public(),
                server_public: &reply.server_public,
                shared_secret: &shared_secret,
            },
        );

        provider.verify_host_signature(&negotiated.host_key, &reply.host_key, &reply.signature, &h)?;
        verifier.verify(&negotiated.host_key, &reply.host_key)?;

        let session_id = existing_session_id.unwrap_or_else(|| Bytes::from(h.clone()));
        let material = KeyMaterial {
            hash,
            shared_secret: &shared_secret,
            exchange_hash: &h,
            session_id: &session_id,
        };

        let outbound = material.direction(
            provider.as_ref(),
            &negotiated.cipher_client_to_server,
            negotiated.mac_client_to_server.as_deref(),
            &negotiated.compression_client_to_server,
            [b'A', b'C', b'E'],
        )?;
        let inbound_keys = material.direction(
            provider.as_ref(),
            &negotiated.cipher_server_to_client,
            negotiated.mac_server_to_client.as_deref(),
            &negotiated.compression_server_to_client,
            [b'B', b'D', b'F'],
        )?;

        inbound.stage(inbound_keys)?;
        {
            let mut writer = self.writer.lock().await;
            writer.keys_mut().stage(outbound)?;
            writer.write_payload(Message::NewKeys.encode()).await?;
            writer.keys_mut().activate()?;
            writer.resume().await?;
        }
        debug!("SSH_MSG_NEWKEYS sent, outbound keys switched");

        self.session_id = Some(session_id);
        self.state = KexState::KeysDerived;
        Ok(())
    }

    fn finish(&mut self) -> ConduitResult<Option<KexOutcome>> {
        let run = self
            .run
            .take()
            .ok_or_else(|| ConduitError::Protocol("no key exchange in progress".to_string()))?;
        let algorithms = run
            .negotiated
            .ok_or_else(|| ConduitError::Protocol("no negotiated algorithms".to_string()))?;
        let session_id = self
            .session_id
            .clone()
            .ok_or_else(|| ConduitError::Protocol("no session identifier".to_string()))?;

        self.state = KexState::Active;
        self.last = Some(algorithms.clone());
        let generation = *self.completed.borrow() + 1;
        self.completed.send_replace(generation);
        info!(
            generation,
            cipher = %algorithms.cipher_client_to_server,
            "key exchange complete"
        );

        Ok(Some(KexOutcome {
            algorithms,
            session_id,
            generation,
        }))
    }
}

struct KeyMaterial<'a> {
    hash: KexHash,
    shared_secret: &'a [u8],
    exchange_hash: &'a [u8],
    session_id: &'a [u8],
}

impl KeyMaterial<'_> {
    fn derive(&self, letter: u8, len: usize) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(derive_key(
            self.hash,
            self.shared_secret,
            self.exchange_hash,
            self.session_id,
            letter,
            len,
        ))
    }

    /// Builds one direction from the letters for IV, key and MAC key.
    fn direction(
        &self,
        provider: &dyn AlgorithmProvider,
        cipher: &str,
        mac: Option<&str>,
        compression: &str,
        letters: [u8; 3],
    ) -> ConduitResult<DirectionKeys> {
        let spec = provider.cipher_spec(cipher)?;
        let iv = self.derive(letters[0], spec.iv_len);
        let key = self.derive(letters[1], spec.key_len);
        let cipher = provider.cipher(cipher, &key, &iv)?;

        let mac = match mac {
            Some(name) => {
                let mac_key = self.derive(letters[2], provider.mac_key_len(name)?);
                provider.mac(name, &mac_key)?
            }
            None => None,
        };

        Ok(DirectionKeys::new(cipher, mac, provider.compression(compression)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::transport::{PacketReader, PacketWriter, TransportConfig};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn proposal(ciphers: &[&str]) -> KexInit {
        KexInit::new(
            names(&["curve25519-sha256"]),
            names(&["ssh-ed25519"]),
            names(ciphers),
            names(&["hmac-sha2-256"]),
            names(&["none"]),
        )
    }

    #[test]
    fn test_kexinit_new_default() {
        let kexinit = KexInit::new_default();
        assert_eq!(kexinit.cookie().len(), 16);
        assert!(kexinit
            .kex_algorithms()
            .contains(&"curve25519-sha256".to_string()));
        assert!(kexinit
            .server_host_key_algorithms()
            .contains(&"ssh-ed25519".to_string()));
        assert!(!kexinit.first_kex_packet_follows());
    }

    #[test]
    fn test_kexinit_round_trip_is_byte_exact() {
        let original = KexInit::new_default().with_first_kex_packet_follows(true);
        let wire = Message::KexInit(original.clone()).encode();
        assert_eq!(wire[0], 20);
        assert_eq!(&wire[1..17], original.cookie());

        let parsed = Message::decode(wire.clone()).unwrap();
        assert_eq!(parsed, Message::KexInit(original));
        assert_eq!(parsed.encode(), wire);
    }

    #[test]
    fn test_kexinit_preserves_reserved_field() {
        let mut wire = Message::KexInit(proposal(&["aes128-ctr"])).encode().to_vec();
        let n = wire.len();
        wire[n - 1] = 7;
        let parsed = Message::decode(Bytes::from(wire.clone())).unwrap();
        assert_eq!(&parsed.encode()[..], &wire[..]);
    }

    #[test]
    fn test_kexinit_parse_too_short() {
        let result = Message::decode(Bytes::from_static(&[20, 1, 2, 3]));
        assert!(matches!(result, Err(ConduitError::Truncated { .. })));
    }

    #[test]
    fn test_fresh_cookie_keeps_lists() {
        let a = KexInit::new_default();
        let b = a.with_fresh_cookie();
        assert_ne!(a.cookie(), b.cookie());
        assert_eq!(a.kex_algorithms(), b.kex_algorithms());
    }

    #[test]
    fn test_negotiate_first_client_preference() {
        let client = names(&["aes128", "aes256"]);
        let server = names(&["aes256", "chacha20"]);
        assert_eq!(negotiate_algorithm(&client, &server).unwrap(), "aes256");
    }

    #[test]
    fn test_negotiate_no_match_is_negotiation_error() {
        let client = names(&["aes256-ctr"]);
        let server = names(&["aes128-ctr"]);
        assert!(matches!(
            negotiate_algorithm(&client, &server),
            Err(ConduitError::Negotiation(_))
        ));
    }

    #[test]
    fn test_negotiate_all_categories() {
        let client = proposal(&["aes256-ctr", "aes128-ctr"]);
        let server = proposal(&["aes128-ctr", "aes256-ctr"]);
        let n = NegotiatedAlgorithms::negotiate(&client, &server, &DefaultAlgorithmProvider)
            .unwrap();
        assert_eq!(n.cipher_client_to_server, "aes256-ctr");
        assert_eq!(n.mac_client_to_server.as_deref(), Some("hmac-sha2-256"));
        assert_eq!(n.compression_server_to_client, "none");
    }

    #[test]
    fn test_aead_cipher_skips_mac_negotiation() {
        let client = proposal(&["aes128-gcm@openssh.com"]);
        let server = KexInit::new(
            names(&["curve25519-sha256"]),
            names(&["ssh-ed25519"]),
            names(&["aes128-gcm@openssh.com"]),
            names(&["hmac-sha1"]),
            names(&["none"]),
        );
        let n = NegotiatedAlgorithms::negotiate(&client, &server, &DefaultAlgorithmProvider)
            .unwrap();
        assert_eq!(n.mac_client_to_server, None);
    }

    #[test]
    fn test_missing_category_names_it() {
        let client = proposal(&["aes128-ctr"]);
        let server = proposal(&["chacha20-poly1305@openssh.com"]);
        match NegotiatedAlgorithms::negotiate(&client, &server, &DefaultAlgorithmProvider) {
            Err(ConduitError::Negotiation(msg)) => assert!(msg.contains("cipher")),
            other => panic!("expected negotiation error, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_guess_detection() {
        let client = proposal(&["aes128-ctr"]);
        let server = KexInit::new(
            names(&["ecdh-sha2-nistp256", "curve25519-sha256"]),
            names(&["ssh-ed25519"]),
            names(&["aes128-ctr"]),
            names(&["hmac-sha2-256"]),
            names(&["none"]),
        )
        .with_first_kex_packet_follows(true);
        let n = NegotiatedAlgorithms::negotiate(&client, &server, &DefaultAlgorithmProvider)
            .unwrap();
        assert!(n.guess_was_wrong(&server));
        assert!(!n.guess_was_wrong(&server.clone().with_first_kex_packet_follows(false)));
    }

    #[test]
    fn test_pinned_host_key() {
        let verifier = PinnedHostKey::new(b"blob".to_vec());
        assert!(verifier.verify("ssh-ed25519", b"blob").is_ok());
        assert!(matches!(
            verifier.verify("ssh-ed25519", b"other"),
            Err(ConduitError::Security(_))
        ));
    }

    fn coordinator() -> (KexCoordinator, PacketReader) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let writer = PacketWriter::new(client).shared();
        let reader = PacketReader::new(server, TransportConfig::default());
        let params = KexParams {
            preferences: KexInit::new_default(),
            provider: Arc::new(DefaultAlgorithmProvider),
            verifier: Arc::new(AcceptAnyHostKey),
            client_version: "SSH-2.0-test".to_string(),
            server_version: "SSH-2.0-peer".to_string(),
        };
        (KexCoordinator::new(params, writer), reader)
    }

    #[tokio::test]
    async fn test_start_sends_kexinit_and_pauses_writer() {
        let (mut kex, mut peer) = coordinator();
        kex.start().await.unwrap();
        assert!(kex.is_in_progress());
        assert_eq!(kex.state(), KexState::Idle);
        assert!(kex.writer.lock().await.is_paused());

        let packet = peer.read_packet().await.unwrap();
        assert!(matches!(
            Message::decode(packet.payload).unwrap(),
            Message::KexInit(_)
        ));

        // A second start while running sends nothing new
        kex.start().await.unwrap();
        assert_eq!(kex.writer.lock().await.packets_sent(), 1);
    }

    #[tokio::test]
    async fn test_peer_kexinit_triggers_ours_and_ecdh_init() {
        let (mut kex, mut peer) = coordinator();
        let server = KexInit::new_default();
        let payload = Message::KexInit(server.clone()).encode();
        let mut inbound = KeySlot::new();

        let outcome = kex
            .handle(Message::KexInit(server), &payload, &mut inbound)
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(kex.state(), KexState::KeyExchangeInProgress);

        let first = Message::decode(peer.read_packet().await.unwrap().payload).unwrap();
        let second = Message::decode(peer.read_packet().await.unwrap().payload).unwrap();
        assert!(matches!(first, Message::KexInit(_)));
        match second {
            Message::KexEcdhInit(init) => assert_eq!(init.client_public.len(), 32),
            other => panic!("expected ECDH init, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_newkeys_out_of_order_is_protocol_error() {
        let (mut kex, _peer) = coordinator();
        let mut inbound = KeySlot::new();
        let result = kex
            .handle(Message::NewKeys, &Message::NewKeys.encode(), &mut inbound)
            .await;
        assert!(matches!(result, Err(ConduitError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_no_common_cipher_fails_negotiation() {
        let (mut kex, _peer) = coordinator();
        let server = proposal(&["3des-cbc"]);
        let payload = Message::KexInit(server.clone()).encode();
        let mut inbound = KeySlot::new();
        let result = kex
            .handle(Message::KexInit(server), &payload, &mut inbound)
            .await;
        assert!(matches!(result, Err(ConduitError::Negotiation(_))));
    }
}
