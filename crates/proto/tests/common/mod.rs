//! In-process SSH server used to script the peer side of integration tests.
//!
//! The server runs the real transport: version exchange, curve25519-sha256
//! with an Ed25519 host key, encrypted packets. Tests drive it step by step
//! and assert on what the client sends.

#![allow(dead_code)]

use bytes::Bytes;
use conduit_proto::ssh::crypto::{
    ed25519_host_key_blob, ed25519_signature_blob, AlgorithmProvider, KeyExchangeMethod,
};
use conduit_proto::ssh::kex::{KexEcdhReply, KexInit};
use conduit_proto::ssh::kex_dh::{derive_key, exchange_hash, ExchangeHashInput, KexHash};
use conduit_proto::ssh::kex_dh::Curve25519Exchange;
use conduit_proto::ssh::{
    ChannelOpenConfirmation, DefaultAlgorithmProvider, DirectionKeys, Message,
    NegotiatedAlgorithms, PacketReader, PacketWriter, TransportConfig, Version,
};
use conduit_proto::ssh::auth::{UserauthBanner, UserauthFailure, UserauthRequest};
use conduit_proto::ssh::generic::ServiceAccept;
use conduit_proto::ssh::version::{read_version, write_version};
use ed25519_dalek::{Signer, SigningKey};
use tokio::io::DuplexStream;

pub const HOST_KEY_SEED: [u8; 32] = [7; 32];

/// Peer side of a session.
pub struct ScriptedServer {
    pub reader: PacketReader,
    pub writer: PacketWriter,
    host_key: SigningKey,
    pub kexinit: KexInit,
    pub client_version: String,
    pub server_version: String,
    pub session_id: Option<Bytes>,
}

/// A key exchange between `kex_begin` and `kex_finish`.
pub struct PendingKex {
    ours: KexInit,
    ours_payload: Bytes,
    theirs: KexInit,
    theirs_payload: Bytes,
    client_public: Bytes,
}

/// Connected client/server stream pair.
pub fn pipe() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(1 << 20)
}

/// Host key blob the server presents.
pub fn host_key_blob() -> Vec<u8> {
    let key = SigningKey::from_bytes(&HOST_KEY_SEED);
    ed25519_host_key_blob(&key.verifying_key().to_bytes())
}

impl ScriptedServer {
    /// Exchanges identification strings.
    pub async fn accept(stream: DuplexStream) -> Self {
        Self::accept_with(stream, KexInit::new_default()).await
    }

    /// Exchanges identification strings, proposing `kexinit` later.
    pub async fn accept_with(stream: DuplexStream, kexinit: KexInit) -> Self {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let version = Version::new("ScriptedServer_1.0", None);
        write_version(&mut write_half, &version).await.unwrap();
        let client = read_version(&mut read_half).await.unwrap();

        Self {
            reader: PacketReader::new(read_half, TransportConfig::default()),
            writer: PacketWriter::new(write_half),
            host_key: SigningKey::from_bytes(&HOST_KEY_SEED),
            kexinit,
            client_version: client.line,
            server_version: version.to_string(),
            session_id: None,
        }
    }

    /// Sends one message.
    pub async fn send(&mut self, msg: Message) {
        self.writer.send(&msg).await.unwrap();
    }

    /// Sends a raw payload, e.g. with an unregistered tag.
    pub async fn send_raw(&mut self, payload: Bytes) -> u32 {
        let seq = self.writer.sequence();
        self.writer.write_payload(payload).await.unwrap();
        seq
    }

    /// Next message from the client, skipping SSH_MSG_IGNORE.
    pub async fn recv(&mut self) -> Message {
        loop {
            let packet = self.reader.read_packet().await.unwrap();
            match Message::decode(packet.payload).unwrap() {
                Message::Ignore(_) => continue,
                msg => return msg,
            }
        }
    }

    /// Runs a key exchange the client started.
    pub async fn key_exchange(&mut self) {
        self.try_key_exchange(false).await.unwrap()
    }

    /// Runs a key exchange starting with our own KEXINIT.
    pub async fn initiate_key_exchange(&mut self) {
        self.try_key_exchange(true).await.unwrap()
    }

    /// Runs a key exchange, returning the first unexpected client message.
    pub async fn try_key_exchange(&mut self, initiate: bool) -> Result<(), Message> {
        let pending = self.kex_begin(initiate).await?;
        self.kex_finish(pending).await
    }

    /// Exchanges KEXINITs and reads the client's ECDH init.
    ///
    /// The client's writer is paused from here until `kex_finish`.
    pub async fn kex_begin(&mut self, initiate: bool) -> Result<PendingKex, Message> {
        let ours = self.kexinit.with_fresh_cookie();
        let ours_payload = Message::KexInit(ours.clone()).encode();
        if initiate {
            self.writer.write_payload(ours_payload.clone()).await.unwrap();
        }

        let packet = self.reader.read_packet().await.unwrap();
        let theirs_payload = packet.payload.clone();
        let theirs = match Message::decode(packet.payload).unwrap() {
            Message::KexInit(kexinit) => kexinit,
            other => return Err(other),
        };
        if !initiate {
            self.writer.write_payload(ours_payload.clone()).await.unwrap();
        }

        let client_public = match self.recv().await {
            Message::KexEcdhInit(init) => init.client_public,
            other => return Err(other),
        };
        Ok(PendingKex {
            ours,
            ours_payload,
            theirs,
            theirs_payload,
            client_public,
        })
    }

    /// Replies to the ECDH init and switches keys in both directions.
    pub async fn kex_finish(&mut self, pending: PendingKex) -> Result<(), Message> {
        let PendingKex {
            ours,
            ours_payload,
            theirs,
            theirs_payload,
            client_public,
        } = pending;

        let provider = DefaultAlgorithmProvider;
        let negotiated = NegotiatedAlgorithms::negotiate(&theirs, &ours, &provider).unwrap();
        let mut exchange = Curve25519Exchange::new(&negotiated.kex).unwrap();
        let server_public = exchange.client_public().to_vec();
        let shared_secret = exchange.compute_shared_secret(&client_public).unwrap();
        let host_key = host_key_blob();

        let h = exchange_hash(
            KexHash::Sha256,
            &ExchangeHashInput {
                client_version: self.client_version.as_bytes(),
                server_version: self.server_version.as_bytes(),
                client_kexinit: &theirs_payload,
                server_kexinit: &ours_payload,
                host_key: &host_key,
                client_public: &client_public,
                server_public: &server_public,
                shared_secret: &shared_secret,
            },
        );
        let signature = self.host_key.sign(&h);
        let session_id = self
            .session_id
            .get_or_insert_with(|| Bytes::from(h.clone()))
            .clone();

        self.send(Message::KexEcdhReply(KexEcdhReply {
            host_key: Bytes::from(host_key),
            server_public: Bytes::from(server_public),
            signature: Bytes::from(ed25519_signature_blob(&signature.to_bytes())),
        }))
        .await;

        let derive = |letter: u8, len: usize| {
            derive_key(KexHash::Sha256, &shared_secret, &h, &session_id, letter, len)
        };
        let keys = |cipher: &str, mac: Option<&str>, letters: [u8; 3]| {
            let spec = provider.cipher_spec(cipher).unwrap();
            let cipher = provider
                .cipher(cipher, &derive(letters[1], spec.key_len), &derive(letters[0], spec.iv_len))
                .unwrap();
            let mac = mac.and_then(|name| {
                let key = derive(letters[2], provider.mac_key_len(name).unwrap());
                provider.mac(name, &key).unwrap()
            });
            DirectionKeys::new(cipher, mac, provider.compression("none").unwrap())
        };

        let outbound = keys(
            &negotiated.cipher_server_to_client,
            negotiated.mac_server_to_client.as_deref(),
            [b'B', b'D', b'F'],
        );
        let inbound = keys(
            &negotiated.cipher_client_to_server,
            negotiated.mac_client_to_server.as_deref(),
            [b'A', b'C', b'E'],
        );

        self.writer.keys_mut().stage(outbound).unwrap();
        self.writer
            .write_payload(Message::NewKeys.encode())
            .await
            .unwrap();
        self.writer.keys_mut().activate().unwrap();

        self.reader.keys_mut().stage(inbound).unwrap();
        match self.recv().await {
            Message::NewKeys => {}
            other => return Err(other),
        }
        self.reader.keys_mut().activate().unwrap();
        Ok(())
    }

    /// Accepts `ssh-userauth` and answers the first request with success.
    pub async fn accept_auth(&mut self) -> UserauthRequest {
        self.accept_service().await;
        let request = self.expect_auth_request().await;
        self.send(Message::UserauthSuccess).await;
        request
    }

    /// Answers SSH_MSG_SERVICE_REQUEST.
    pub async fn accept_service(&mut self) {
        match self.recv().await {
            Message::ServiceRequest(request) => {
                assert_eq!(request.service, "ssh-userauth");
                self.send(Message::ServiceAccept(ServiceAccept {
                    service: request.service,
                }))
                .await;
            }
            other => panic!("expected SSH_MSG_SERVICE_REQUEST, got {:?}", other),
        }
    }

    /// Reads the next authentication request.
    pub async fn expect_auth_request(&mut self) -> UserauthRequest {
        match self.recv().await {
            Message::UserauthRequest(request) => request,
            other => panic!("expected SSH_MSG_USERAUTH_REQUEST, got {:?}", other),
        }
    }

    /// Rejects an authentication request.
    pub async fn reject_auth(&mut self, methods: &[&str]) {
        self.send(Message::UserauthFailure(UserauthFailure {
            methods: methods.iter().map(|m| m.to_string()).collect(),
            partial_success: false,
        }))
        .await;
    }

    /// Sends a banner.
    pub async fn banner(&mut self, text: &str) {
        self.send(Message::UserauthBanner(UserauthBanner {
            message: text.to_string(),
            language: String::new(),
        }))
        .await;
    }

    /// Full handshake: key exchange and authentication.
    pub async fn handshake(stream: DuplexStream) -> Self {
        let mut server = Self::accept(stream).await;
        server.key_exchange().await;
        server.accept_auth().await;
        server
    }

    /// Confirms the next channel open; returns (client id, server id).
    pub async fn confirm_channel(&mut self, window: u32, max_packet: u32) -> (u32, u32) {
        match self.recv().await {
            Message::ChannelOpen(open) => {
                let server_id = 100 + open.sender_channel;
                self.send(Message::ChannelOpenConfirmation(ChannelOpenConfirmation::new(
                    open.sender_channel,
                    server_id,
                    window,
                    max_packet,
                )))
                .await;
                (open.sender_channel, server_id)
            }
            other => panic!("expected SSH_MSG_CHANNEL_OPEN, got {:?}", other),
        }
    }
}
