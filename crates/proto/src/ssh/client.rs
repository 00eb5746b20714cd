//! SSH client session.
//!
//! [`SshClient`] brings a connection from the version exchange through the
//! first key exchange and user authentication to an operational session,
//! then hands the inbound side to a background
//! [`MessageDispatcher`](super::dispatcher::MessageDispatcher).
//!
//! # Example
//!
//! ```rust,no_run
//! use conduit_proto::ssh::auth::PasswordAuth;
//! use conduit_proto::ssh::client::{SshClient, SshClientConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut auth = PasswordAuth::new("user", "password");
//! let client = SshClient::connect("127.0.0.1:22", SshClientConfig::default(), &mut auth).await?;
//!
//! let mut channel = client.open_session().await?;
//! channel.exec("uname -a").await?;
//! while let Some(event) = channel.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use conduit_platform::{ConduitError, ConduitResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::auth::{AuthContext, AuthStrategy, USERAUTH_SERVICE};
use super::channel::ChannelHandle;
use super::connection::{ChannelType, GlobalRequestType};
use super::crypto::{AlgorithmProvider, DefaultAlgorithmProvider};
use super::dispatcher::{DispatchPolicy, MessageDispatcher, SessionContext};
use super::generic::{DisconnectReason, ServiceRequest};
use super::kex::{
    AcceptAnyHostKey, HostKeyVerifier, KexCoordinator, KexInit, KexParams, NegotiatedAlgorithms,
};
use super::message::Message;
use super::multiplexer::MultiplexerConfig;
use super::session::{
    KeepaliveTask, RekeyPolicy, SessionEvent, SessionState, UnknownMessagePolicy,
};
use super::transport::{PacketReader, PacketWriter, TransportConfig};
use super::version::{read_version, write_version, Version};

/// SSH client configuration.
#[derive(Clone)]
pub struct SshClientConfig {
    /// Our identification string
    pub version: Version,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Bound on version exchange, first key exchange and authentication
    pub handshake_timeout: Duration,
    /// Algorithm preferences, most preferred first
    pub preferences: KexInit,
    /// Algorithm implementations
    pub algorithms: Arc<dyn AlgorithmProvider>,
    /// Host key trust policy.
    ///
    /// The default accepts any host key whose signature verifies. Pin the
    /// key with [`PinnedHostKey`](super::kex::PinnedHostKey) or supply your
    /// own verifier outside of tests.
    pub host_key_verifier: Arc<dyn HostKeyVerifier>,
    /// Default channel window, packet size, low-water mark and open timeout
    pub channel: MultiplexerConfig,
    /// When to rekey on our own
    pub rekey: RekeyPolicy,
    /// Reaction to unknown message types
    pub unknown_messages: UnknownMessagePolicy,
    /// Send SSH_MSG_IGNORE at this interval
    pub keepalive_interval: Option<Duration>,
    /// Transport limits
    pub transport: TransportConfig,
    /// Session events buffered for [`SshClient::take_events`]
    pub event_capacity: usize,
}

impl std::fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClientConfig")
            .field("version", &self.version)
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("preferences", &self.preferences)
            .field("channel", &self.channel)
            .field("rekey", &self.rekey)
            .field("unknown_messages", &self.unknown_messages)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("transport", &self.transport)
            .field("event_capacity", &self.event_capacity)
            .finish_non_exhaustive()
    }
}

impl Default for SshClientConfig {
    fn default() -> Self {
        let algorithms: Arc<dyn AlgorithmProvider> = Arc::new(DefaultAlgorithmProvider);
        Self {
            version: Version::default_conduit(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(60),
            preferences: KexInit::from_provider(algorithms.as_ref()),
            algorithms,
            host_key_verifier: Arc::new(AcceptAnyHostKey),
            channel: MultiplexerConfig::default(),
            rekey: RekeyPolicy::default(),
            unknown_messages: UnknownMessagePolicy::default(),
            keepalive_interval: None,
            transport: TransportConfig::default(),
            event_capacity: 64,
        }
    }
}

impl SshClientConfig {
    /// Uses `verifier` to decide whether the server's host key is trusted.
    pub fn with_host_key_verifier(mut self, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        self.host_key_verifier = verifier;
        self
    }

    fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            rekey: self.rekey,
            unknown_messages: self.unknown_messages,
        }
    }
}

/// An authenticated SSH session.
pub struct SshClient {
    ctx: Arc<SessionContext>,
    session_id: Bytes,
    server_version: Version,
    events: Option<mpsc::Receiver<SessionEvent>>,
    keepalive: Option<KeepaliveTask>,
    reader_task: JoinHandle<()>,
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("server_version", &self.server_version)
            .field("state", &self.state())
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

impl SshClient {
    /// Connects over TCP and runs the handshake.
    ///
    /// # Errors
    ///
    /// [`ConduitError::Timeout`] if the TCP connection or the handshake take
    /// too long, and whatever the handshake fails with otherwise.
    pub async fn connect<A>(
        addr: A,
        config: SshClientConfig,
        auth: &mut dyn AuthStrategy,
    ) -> ConduitResult<Self>
    where
        A: ToSocketAddrs,
    {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConduitError::Timeout("TCP connect".to_string()))??;
        stream.set_nodelay(true)?;
        Self::handshake(stream, config, auth).await
    }

    /// Runs the handshake over an already connected byte stream.
    ///
    /// Version exchange, the first key exchange and authentication must
    /// finish within [`SshClientConfig::handshake_timeout`]. On failure the
    /// peer is sent SSH_MSG_DISCONNECT where appropriate.
    pub async fn handshake<S>(
        stream: S,
        config: SshClientConfig,
        auth: &mut dyn AuthStrategy,
    ) -> ConduitResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let peer = tokio::time::timeout(config.handshake_timeout, async {
            write_version(&mut write_half, &config.version).await?;
            read_version(&mut read_half).await
        })
        .await
        .map_err(|_| ConduitError::Timeout("version exchange".to_string()))??;
        info!(server = %peer.line, "server identified");

        let reader = PacketReader::new(read_half, config.transport.clone());
        let writer = PacketWriter::new(write_half).shared();
        let kex = KexCoordinator::new(
            KexParams {
                preferences: config.preferences.clone(),
                provider: Arc::clone(&config.algorithms),
                verifier: Arc::clone(&config.host_key_verifier),
                client_version: config.version.to_string(),
                server_version: peer.line.clone(),
            },
            Arc::clone(&writer),
        );
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let ctx = SessionContext::new(writer, kex, config.channel.clone(), events_tx);
        ctx.status().advance(SessionState::KeyExchange)?;
        let mut dispatcher = MessageDispatcher::new(reader, Arc::clone(&ctx), config.dispatch_policy());

        let steps = async {
            let outcome = dispatcher.first_key_exchange().await?;
            ctx.status().advance(SessionState::Authenticating)?;
            authenticate(&mut dispatcher, &ctx, auth, outcome.session_id.clone()).await?;
            ctx.status().advance(SessionState::Operational)?;
            Ok::<_, ConduitError>(outcome)
        };
        let result = match tokio::time::timeout(config.handshake_timeout, steps).await {
            Ok(result) => result,
            Err(_) => Err(ConduitError::Timeout("SSH handshake".to_string())),
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                ctx.fail(&e).await;
                return Err(e);
            }
        };
        info!(
            kex = %outcome.algorithms.kex,
            cipher = %outcome.algorithms.cipher_client_to_server,
            "session established"
        );

        let keepalive = config.keepalive_interval.map(|interval| {
            let mut task = KeepaliveTask::new(interval);
            task.start_on(Arc::clone(ctx.writer()));
            task
        });
        let reader_task = tokio::spawn(dispatcher.run());

        Ok(Self {
            ctx,
            session_id: outcome.session_id,
            server_version: peer.version,
            events: Some(events_rx),
            keepalive,
            reader_task,
        })
    }

    /// Session identifier, the exchange hash of the first key exchange.
    pub fn session_id(&self) -> &Bytes {
        &self.session_id
    }

    /// The server's identification.
    pub fn server_version(&self) -> &Version {
        &self.server_version
    }

    /// Lifecycle state; `Operational` until the session closes.
    pub fn state(&self) -> SessionState {
        self.ctx.status().state()
    }

    /// True once the session has been torn down.
    pub fn is_closed(&self) -> bool {
        self.ctx.status().is_closed()
    }

    /// Why the session closed, once it has.
    pub fn close_reason(&self) -> Option<&str> {
        self.ctx.status().close_reason()
    }

    /// Algorithms of the most recent key exchange.
    pub async fn algorithms(&self) -> Option<NegotiatedAlgorithms> {
        self.ctx.kex().lock().await.algorithms().cloned()
    }

    /// Takes the session event stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    /// Opens a channel with the configured window and packet size.
    pub async fn open_channel(&self, channel_type: ChannelType) -> ConduitResult<ChannelHandle> {
        self.ensure_open()?;
        self.ctx.mux().open(channel_type).await
    }

    /// Opens a `session` channel.
    pub async fn open_session(&self) -> ConduitResult<ChannelHandle> {
        self.open_channel(ChannelType::Session).await
    }

    /// Sends a global request; see [`SessionContext::global_request`].
    pub async fn global_request(
        &self,
        request: GlobalRequestType,
        want_reply: bool,
    ) -> ConduitResult<Option<Bytes>> {
        self.ensure_open()?;
        self.ctx.global_request(request, want_reply).await
    }

    /// Starts a key exchange and waits for it to complete.
    ///
    /// Channel traffic queued meanwhile is sent under the new keys.
    pub async fn rekey(&self) -> ConduitResult<()> {
        self.ensure_open()?;
        let (mut completed, target) = {
            let mut kex = self.ctx.kex().lock().await;
            let completed = kex.subscribe();
            let target = *completed.borrow() + 1;
            kex.start().await?;
            (completed, target)
        };
        debug!(generation = target, "rekey requested");

        let status = self.ctx.status();
        tokio::select! {
            done = completed.wait_for(|generation| *generation >= target) => {
                done.map(|_| ()).map_err(|_| status.closed_error())
            }
            _ = status.closed() => Err(status.closed_error()),
        }
    }

    /// Sends SSH_MSG_DISCONNECT and closes the session.
    ///
    /// Every open channel and pending operation fails with
    /// [`ConduitError::SessionClosed`]. Does nothing if already closed.
    pub async fn disconnect(&mut self, reason: DisconnectReason, description: &str) {
        if let Some(mut keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
        self.ctx.disconnect(reason, description).await;
    }

    /// Resolves once the session has closed, for whatever reason.
    pub async fn closed(&self) {
        self.ctx.status().closed().await
    }

    fn ensure_open(&self) -> ConduitResult<()> {
        if self.ctx.status().is_closed() {
            return Err(self.ctx.status().closed_error());
        }
        Ok(())
    }
}

impl Drop for SshClient {
    fn drop(&mut self) {
        if self.ctx.status().close("client dropped") {
            self.ctx.mux().shutdown("client dropped");
        }
        self.reader_task.abort();
    }
}

async fn authenticate(
    dispatcher: &mut MessageDispatcher,
    ctx: &SessionContext,
    auth: &mut dyn AuthStrategy,
    session_id: Bytes,
) -> ConduitResult<()> {
    ctx.send(&Message::ServiceRequest(ServiceRequest {
        service: USERAUTH_SERVICE.to_string(),
    }))
    .await?;
    match dispatcher.next_message().await? {
        Message::ServiceAccept(accept) if accept.service == USERAUTH_SERVICE => {}
        other => {
            return Err(ConduitError::Protocol(format!(
                "expected SSH_MSG_SERVICE_ACCEPT for {}, got {}",
                USERAUTH_SERVICE,
                other.name()
            )))
        }
    }

    let mut auth_ctx = AuthContext {
        session_id,
        ..AuthContext::default()
    };
    loop {
        let request = auth.next_request(&auth_ctx).await?.ok_or_else(|| {
            ConduitError::Authentication(format!(
                "no methods left to try (server allows: {})",
                auth_ctx.allowed_methods.join(",")
            ))
        })?;
        auth_ctx.attempts += 1;
        debug!(
            user = %request.user,
            method = request.method.name(),
            attempt = auth_ctx.attempts,
            "authentication request"
        );
        ctx.send(&Message::UserauthRequest(request)).await?;

        loop {
            match dispatcher.next_message().await? {
                Message::UserauthSuccess => {
                    info!(attempts = auth_ctx.attempts, "authenticated");
                    return Ok(());
                }
                Message::UserauthFailure(failure) => {
                    debug!(
                        methods = %failure.methods.join(","),
                        partial = failure.partial_success,
                        "authentication failed"
                    );
                    auth_ctx.allowed_methods = failure.methods;
                    auth_ctx.partial_success = failure.partial_success;
                    break;
                }
                Message::UserauthBanner(banner) => {
                    ctx.emit(SessionEvent::Banner(banner.message));
                }
                Message::UserauthMethodSpecific { tag, body } => {
                    if let Some(reply) = auth.on_method_message(&auth_ctx, tag, body).await? {
                        ctx.send(&reply).await?;
                    }
                }
                other => {
                    return Err(ConduitError::Protocol(format!(
                        "unexpected {} during authentication",
                        other.name()
                    )))
                }
            }
        }
    }
}
