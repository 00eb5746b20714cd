//! Inbound message dispatch.
//!
//! A single [`MessageDispatcher`] owns the [`PacketReader`] of a session and
//! is the only code reading from the connection. Every packet is decoded
//! and routed:
//!
//! - key exchange messages to the [`KexCoordinator`]
//! - transport-generic messages (IGNORE, DEBUG, UNIMPLEMENTED, DISCONNECT)
//!   are handled here
//! - global request replies to their waiting callers
//! - channel messages to the [`Multiplexer`]
//!
//! During the handshake the client pulls messages one at a time with
//! [`MessageDispatcher::next_message`]; afterwards [`MessageDispatcher::run`]
//! loops until the session closes. A fatal error tears the session down:
//! every waiter is released with
//! [`SessionClosed`](ConduitError::SessionClosed), then SSH_MSG_DISCONNECT
//! is sent when the error warrants one and the transport is closed. A
//! connection that no longer drains gets [`DISCONNECT_TIMEOUT`] for that.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use conduit_platform::{ConduitError, ConduitResult};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::connection::{GlobalRequest, GlobalRequestType};
use super::generic::{Disconnect, DisconnectReason, Unimplemented};
use super::kex::{KexCoordinator, KexOutcome};
use super::message::{Message, MessageCategory};
use super::multiplexer::{Multiplexer, MultiplexerConfig};
use super::session::{RekeyPolicy, SessionEvent, SessionStatus, UnknownMessagePolicy};
use super::transport::{PacketReader, SharedWriter};

/// How long teardown waits to hand SSH_MSG_DISCONNECT to the connection.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared by the reader loop and the application side of a session.
pub struct SessionContext {
    status: SessionStatus,
    writer: SharedWriter,
    kex: Mutex<KexCoordinator>,
    mux: Arc<Multiplexer>,
    global_lock: Mutex<()>,
    global_replies: StdMutex<VecDeque<oneshot::Sender<Option<Bytes>>>>,
    events: mpsc::Sender<SessionEvent>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("state", &self.status.state())
            .field("mux", &self.mux)
            .finish()
    }
}

impl SessionContext {
    /// Builds the context; channels send through `writer`.
    pub fn new(
        writer: SharedWriter,
        kex: KexCoordinator,
        channels: MultiplexerConfig,
        events: mpsc::Sender<SessionEvent>,
    ) -> Arc<Self> {
        let mux = Multiplexer::new(writer.clone(), channels);
        Arc::new(Self {
            status: SessionStatus::new(),
            writer,
            kex: Mutex::new(kex),
            mux,
            global_lock: Mutex::new(()),
            global_replies: StdMutex::new(VecDeque::new()),
            events,
        })
    }

    /// Lifecycle state.
    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Channel table.
    pub fn mux(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    /// Shared writer.
    pub fn writer(&self) -> &SharedWriter {
        &self.writer
    }

    /// Key exchange coordinator.
    pub fn kex(&self) -> &Mutex<KexCoordinator> {
        &self.kex
    }

    /// Sends a message, failing fast once the session is closed.
    pub async fn send(&self, msg: &Message) -> ConduitResult<()> {
        if self.status.is_closed() {
            return Err(self.status.closed_error());
        }
        self.writer.lock().await.send(msg).await
    }

    /// Queues an event for the application without ever blocking.
    pub fn emit(&self, event: SessionEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            debug!(?event, "session event queue full, dropping event");
        }
    }

    /// Sends a global request.
    ///
    /// With `want_reply`, waits for the answer: `Some(data)` on
    /// SSH_MSG_REQUEST_SUCCESS, `None` on SSH_MSG_REQUEST_FAILURE.
    /// Without, returns `None` once sent.
    pub async fn global_request(
        &self,
        request: GlobalRequestType,
        want_reply: bool,
    ) -> ConduitResult<Option<Bytes>> {
        let guard = self.global_lock.lock().await;
        let reply = if want_reply {
            let (tx, rx) = oneshot::channel();
            self.replies().push_back(tx);
            Some(rx)
        } else {
            None
        };

        debug!(request = request.name(), want_reply, "global request");
        self.send(&Message::GlobalRequest(GlobalRequest {
            want_reply,
            request,
        }))
        .await?;
        drop(guard);

        match reply {
            Some(rx) => rx.await.map_err(|_| self.status.closed_error()),
            None => Ok(None),
        }
    }

    fn replies(&self) -> std::sync::MutexGuard<'_, VecDeque<oneshot::Sender<Option<Bytes>>>> {
        self.global_replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn complete_global(&self, reply: Option<Bytes>) -> ConduitResult<()> {
        let waiter = self.replies().pop_front();
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
                Ok(())
            }
            None => Err(ConduitError::Protocol(
                "global request reply without an outstanding request".to_string(),
            )),
        }
    }

    /// Sends SSH_MSG_DISCONNECT and tears the session down.
    pub async fn disconnect(&self, reason: DisconnectReason, description: &str) {
        let notice = Disconnect::new(reason, description);
        self.teardown(format!("disconnected locally: {}", description), Some(notice))
            .await;
    }

    /// Tears the session down after `err`.
    pub async fn fail(&self, err: &ConduitError) {
        warn!("session failed: {}", err);
        self.teardown(err.to_string(), disconnect_notice(err)).await;
    }

    async fn teardown(&self, reason: String, notice: Option<Disconnect>) {
        if !self.status.close(reason.clone()) {
            return;
        }
        self.mux.shutdown(&reason);
        self.replies().clear();

        let writer = &self.writer;
        let flushed = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
            let mut writer = writer.lock().await;
            if let Some(notice) = notice {
                if !writer.is_closed() {
                    let payload = Message::Disconnect(notice).encode();
                    if let Err(e) = writer.write_payload(payload).await {
                        debug!("could not send SSH_MSG_DISCONNECT: {}", e);
                    }
                }
            }
            writer.close().await;
        })
        .await;
        if flushed.is_err() {
            debug!("connection stalled, closing without SSH_MSG_DISCONNECT");
        }

        info!(%reason, "session closed");
        self.emit(SessionEvent::Closed { reason });
    }
}

/// Picks the SSH_MSG_DISCONNECT to send for a fatal error, if any.
///
/// Nothing is sent when the peer already disconnected or the connection
/// itself failed.
pub fn disconnect_notice(err: &ConduitError) -> Option<Disconnect> {
    let reason = match err {
        ConduitError::Integrity(_) => DisconnectReason::MacError,
        ConduitError::Negotiation(_) => DisconnectReason::KeyExchangeFailed,
        ConduitError::Security(_) => DisconnectReason::HostKeyNotVerifiable,
        ConduitError::Authentication(_) => DisconnectReason::NoMoreAuthMethodsAvailable,
        ConduitError::Protocol(_)
        | ConduitError::InvalidFormat(_)
        | ConduitError::Truncated { .. }
        | ConduitError::UnknownMessage(_)
        | ConduitError::ChannelProtocol { .. } => DisconnectReason::ProtocolError,
        ConduitError::Io(_) | ConduitError::Disconnected { .. } | ConduitError::SessionClosed(_) => {
            return None
        }
        _ => DisconnectReason::ByApplication,
    };
    Some(Disconnect::new(reason, err.to_string()))
}

/// Reader-side policies.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchPolicy {
    /// When to start a key exchange on our own
    pub rekey: RekeyPolicy,
    /// What to do with unknown message types
    pub unknown_messages: UnknownMessagePolicy,
}

/// Owner of the inbound half of a session.
pub struct MessageDispatcher {
    reader: PacketReader,
    ctx: Arc<SessionContext>,
    policy: DispatchPolicy,
    completed: Option<KexOutcome>,
    rekey_bytes: u64,
    rekey_at: Instant,
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("reader", &self.reader)
            .field("policy", &self.policy)
            .finish()
    }
}

impl MessageDispatcher {
    /// Creates a dispatcher reading from `reader`.
    pub fn new(reader: PacketReader, ctx: Arc<SessionContext>, policy: DispatchPolicy) -> Self {
        Self {
            reader,
            ctx,
            policy,
            completed: None,
            rekey_bytes: 0,
            rekey_at: Instant::now(),
        }
    }

    /// Runs the first key exchange and returns its outcome.
    ///
    /// Only transport-generic and key exchange messages are allowed until
    /// it completes.
    pub async fn first_key_exchange(&mut self) -> ConduitResult<KexOutcome> {
        self.ctx.kex.lock().await.start().await?;
        loop {
            if let Some(outcome) = self.completed.take() {
                return Ok(outcome);
            }
            if let Some(msg) = self.step().await? {
                return Err(ConduitError::Protocol(format!(
                    "unexpected {} before the first key exchange completed",
                    msg.name()
                )));
            }
        }
    }

    /// Returns the next message not consumed by the transport layer.
    pub async fn next_message(&mut self) -> ConduitResult<Message> {
        loop {
            if let Some(msg) = self.step().await? {
                return Ok(msg);
            }
        }
    }

    /// Reads one packet and handles it if it belongs to the transport layer.
    async fn step(&mut self) -> ConduitResult<Option<Message>> {
        let packet = self.reader.read_packet().await?;
        let msg = match Message::decode(packet.payload.clone()) {
            Ok(msg) => msg,
            Err(ConduitError::UnknownMessage(tag)) => {
                self.on_unknown(tag, packet.seq).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        trace!(seq = packet.seq, msg = msg.name(), "received");

        match msg {
            Message::KexInit(_)
            | Message::KexEcdhInit(_)
            | Message::KexEcdhReply(_)
            | Message::NewKeys => {
                let outcome = self
                    .ctx
                    .kex
                    .lock()
                    .await
                    .handle(msg, &packet.payload, self.reader.keys_mut())
                    .await?;
                if let Some(outcome) = outcome {
                    self.on_kex_complete(outcome).await;
                }
                Ok(None)
            }
            Message::Disconnect(d) => Err(ConduitError::Disconnected {
                reason_code: d.reason_code,
                description: d.description,
            }),
            Message::Ignore(_) => Ok(None),
            Message::Debug(d) => {
                debug!(message = %d.message, "peer debug message");
                self.ctx.emit(SessionEvent::Debug(d));
                Ok(None)
            }
            Message::Unimplemented(u) => {
                warn!(seq = u.sequence, "peer did not implement our packet");
                self.ctx.emit(SessionEvent::Unimplemented(u.sequence));
                Ok(None)
            }
            other => Ok(Some(other)),
        }
    }

    async fn on_unknown(&self, tag: u8, seq: u32) -> ConduitResult<()> {
        match self.policy.unknown_messages {
            UnknownMessagePolicy::Ignore => {
                debug!(tag, seq, "ignoring unknown message");
                Ok(())
            }
            UnknownMessagePolicy::ReplyUnimplemented => {
                debug!(tag, seq, "replying SSH_MSG_UNIMPLEMENTED");
                self.ctx
                    .send(&Message::Unimplemented(Unimplemented { sequence: seq }))
                    .await
            }
            UnknownMessagePolicy::Disconnect => Err(ConduitError::UnknownMessage(tag)),
        }
    }

    async fn on_kex_complete(&mut self, outcome: KexOutcome) {
        let sent = self.ctx.writer.lock().await.bytes_sent();
        self.rekey_bytes = sent + self.reader.bytes_received();
        self.rekey_at = Instant::now();
        self.ctx.emit(SessionEvent::KeyExchangeCompleted {
            generation: outcome.generation,
        });
        self.completed = Some(outcome);
    }

    /// Starts a rekey once the policy says so.
    ///
    /// Checked after every inbound packet. [`rekey_timer`] covers the time
    /// threshold while the peer sends nothing.
    async fn maybe_rekey(&mut self) -> ConduitResult<()> {
        let sent = match self.ctx.writer.try_lock() {
            Ok(writer) => writer.bytes_sent(),
            Err(_) => return Ok(()),
        };
        let total = sent + self.reader.bytes_received();
        let since = total.saturating_sub(self.rekey_bytes);
        if !self.policy.rekey.is_due(since, self.rekey_at.elapsed()) {
            return Ok(());
        }

        let mut kex = self.ctx.kex.lock().await;
        if kex.is_in_progress() {
            return Ok(());
        }
        info!(bytes = since, "rekey threshold reached");
        kex.start().await
    }

    async fn route(&self, msg: Message) -> ConduitResult<()> {
        match msg {
            Message::GlobalRequest(request) => {
                debug!(
                    request = request.request.name(),
                    want_reply = request.want_reply,
                    "peer global request"
                );
                if request.want_reply {
                    self.ctx.send(&Message::RequestFailure).await?;
                }
                self.ctx.emit(SessionEvent::GlobalRequest(request));
                Ok(())
            }
            Message::RequestSuccess(success) => self.ctx.complete_global(Some(success.data)),
            Message::RequestFailure => self.ctx.complete_global(None),
            msg if msg.category() == MessageCategory::Connection => self.ctx.mux.handle(msg).await,
            other => Err(ConduitError::Protocol(format!(
                "unexpected {} after authentication",
                other.name()
            ))),
        }
    }

    fn report(&self, err: ConduitError) {
        match err {
            ConduitError::ChannelProtocol { channel, reason } => {
                debug!(channel, %reason, "channel error");
                self.ctx
                    .emit(SessionEvent::ChannelError { channel, reason });
            }
            other => warn!("non-fatal dispatch error: {}", other),
        }
    }

    async fn read_loop(&mut self) -> ConduitResult<()> {
        let ctx = Arc::clone(&self.ctx);
        loop {
            let msg = tokio::select! {
                _ = ctx.status.closed() => return Ok(()),
                step = self.step() => step?,
            };
            if let Some(msg) = msg {
                if let Err(e) = self.route(msg).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    self.report(e);
                }
            }
            self.maybe_rekey().await?;
        }
    }

    /// Dispatches until the session closes or fails.
    pub async fn run(mut self) {
        let ctx = Arc::clone(&self.ctx);
        let interval = self.policy.rekey.max_duration;
        let result = tokio::select! {
            result = self.read_loop() => result,
            result = rekey_timer(&ctx, interval) => result,
        };

        match result {
            Ok(()) => debug!("reader loop stopped"),
            Err(e) => ctx.fail(&e).await,
        }
    }
}

/// Starts a key exchange once `interval` passes without one, whether or
/// not any traffic flows. Returns when the session closes.
async fn rekey_timer(ctx: &SessionContext, interval: Duration) -> ConduitResult<()> {
    if interval == Duration::MAX {
        ctx.status.closed().await;
        return Ok(());
    }
    let mut completed = ctx.kex.lock().await.subscribe();
    loop {
        tokio::select! {
            _ = ctx.status.closed() => return Ok(()),
            changed = completed.changed() => {
                if changed.is_err() {
                    ctx.status.closed().await;
                    return Ok(());
                }
                continue;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        {
            let mut kex = ctx.kex.lock().await;
            if !kex.is_in_progress() {
                info!(?interval, "rekey interval elapsed");
                kex.start().await?;
            }
        }
        // The next interval starts when this exchange completes
        tokio::select! {
            _ = ctx.status.closed() => return Ok(()),
            changed = completed.changed() => {
                if changed.is_err() {
                    ctx.status.closed().await;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::channel::ChannelHandle;
    use crate::ssh::connection::{ChannelOpenConfirmation, ChannelType};
    use crate::ssh::crypto::DefaultAlgorithmProvider;
    use crate::ssh::kex::{AcceptAnyHostKey, KexInit, KexParams};
    use crate::ssh::transport::{PacketWriter, TransportConfig};

    fn context() -> (
        Arc<SessionContext>,
        mpsc::Receiver<SessionEvent>,
        tokio::io::DuplexStream,
    ) {
        let (ours, theirs) = tokio::io::duplex(1 << 16);
        let writer = PacketWriter::new(ours).shared();
        let params = KexParams {
            preferences: KexInit::new_default(),
            provider: Arc::new(DefaultAlgorithmProvider),
            verifier: Arc::new(AcceptAnyHostKey),
            client_version: "SSH-2.0-test".into(),
            server_version: "SSH-2.0-peer".into(),
        };
        let kex = KexCoordinator::new(params, Arc::clone(&writer));
        let (tx, rx) = mpsc::channel(8);
        let ctx = SessionContext::new(writer, kex, MultiplexerConfig::default(), tx);
        (ctx, rx, theirs)
    }

    #[test]
    fn test_disconnect_notice_reasons() {
        let notice = disconnect_notice(&ConduitError::Integrity("bad mac".into())).unwrap();
        assert_eq!(notice.reason(), Some(DisconnectReason::MacError));

        let notice = disconnect_notice(&ConduitError::Negotiation("none".into())).unwrap();
        assert_eq!(notice.reason(), Some(DisconnectReason::KeyExchangeFailed));

        assert!(disconnect_notice(&ConduitError::Disconnected {
            reason_code: 11,
            description: "bye".into()
        })
        .is_none());
    }

    #[tokio::test]
    async fn test_teardown_sends_disconnect_and_fails_waiters() {
        let (ctx, mut events, theirs) = context();
        let mut peer = PacketReader::new(theirs, TransportConfig::default());

        ctx.fail(&ConduitError::Integrity("MAC mismatch on inbound packet 7".into()))
            .await;

        let packet = peer.read_packet().await.unwrap();
        match Message::decode(packet.payload).unwrap() {
            Message::Disconnect(d) => assert_eq!(d.reason(), Some(DisconnectReason::MacError)),
            other => panic!("expected SSH_MSG_DISCONNECT, got {:?}", other),
        }

        assert!(ctx.status().is_closed());
        assert!(matches!(
            ctx.send(&Message::RequestFailure).await,
            Err(ConduitError::SessionClosed(reason)) if reason.contains("MAC mismatch")
        ));
        assert!(matches!(events.recv().await, Some(SessionEvent::Closed { .. })));
    }

    #[tokio::test]
    async fn test_global_request_reply_matching() {
        let (ctx, _events, theirs) = context();
        let mut peer = PacketReader::new(theirs, TransportConfig::default());

        let requester = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                ctx.global_request(
                    GlobalRequestType::TcpipForward {
                        address: "0.0.0.0".into(),
                        port: 0,
                    },
                    true,
                )
                .await
            })
        };

        let packet = peer.read_packet().await.unwrap();
        assert!(matches!(
            Message::decode(packet.payload).unwrap(),
            Message::GlobalRequest(_)
        ));
        ctx.complete_global(Some(Bytes::from_static(&[0, 0, 0x1f, 0x90])))
            .unwrap();
        let reply = requester.await.unwrap().unwrap();
        assert_eq!(reply.as_deref(), Some(&[0, 0, 0x1f, 0x90][..]));

        assert!(ctx.complete_global(None).is_err());
    }

    #[tokio::test]
    async fn test_teardown_releases_global_waiters() {
        let (ctx, _events, _theirs) = context();
        let requester = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                ctx.global_request(
                    GlobalRequestType::Other {
                        name: "keepalive@openssh.com".into(),
                        data: Bytes::new(),
                    },
                    true,
                )
                .await
            })
        };
        tokio::task::yield_now().await;
        ctx.disconnect(DisconnectReason::ByApplication, "done").await;
        assert!(matches!(
            requester.await.unwrap(),
            Err(ConduitError::SessionClosed(_))
        ));
    }

    /// Dispatcher reading what a scripted peer writes.
    fn reading_dispatcher(
        ctx: &Arc<SessionContext>,
        policy: DispatchPolicy,
    ) -> (MessageDispatcher, PacketWriter) {
        let (inbound, peer_side) = tokio::io::duplex(1 << 16);
        let reader = PacketReader::new(inbound, TransportConfig::default());
        (
            MessageDispatcher::new(reader, Arc::clone(ctx), policy),
            PacketWriter::new(peer_side),
        )
    }

    async fn open_channel(
        ctx: &Arc<SessionContext>,
        peer: &mut PacketReader,
        peer_window: u32,
    ) -> ChannelHandle {
        let opener = {
            let mux = Arc::clone(ctx.mux());
            tokio::spawn(async move { mux.open(ChannelType::Session).await })
        };
        let packet = peer.read_packet().await.unwrap();
        let id = match Message::decode(packet.payload).unwrap() {
            Message::ChannelOpen(open) => open.sender_channel,
            other => panic!("expected SSH_MSG_CHANNEL_OPEN, got {:?}", other),
        };
        ctx.mux()
            .handle(Message::ChannelOpenConfirmation(ChannelOpenConfirmation::new(
                id,
                3,
                peer_window,
                1000,
            )))
            .await
            .unwrap();
        opener.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_reader_loop_runs_on_its_own_task() {
        let (ctx, mut events, _theirs) = context();
        let (dispatcher, mut peer) = reading_dispatcher(&ctx, DispatchPolicy::default());
        let reader_task = tokio::spawn(dispatcher.run());

        peer.send(&Message::Disconnect(Disconnect::new(
            DisconnectReason::ByApplication,
            "maintenance",
        )))
        .await
        .unwrap();
        reader_task.await.unwrap();

        assert!(ctx.status().is_closed());
        match events.recv().await {
            Some(SessionEvent::Closed { reason }) => assert!(reason.contains("maintenance")),
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_with_stalled_writer_releases_channels() {
        let (ctx, mut events, theirs) = context();
        let mut peer = PacketReader::new(theirs, TransportConfig::default());
        let channel = Arc::new(open_channel(&ctx, &mut peer, 0).await);
        let sender = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.send(Bytes::from_static(b"blocked")).await })
        };
        tokio::task::yield_now().await;

        // Another task is stuck writing to a connection nobody drains
        let stalled = ctx.writer().lock().await;
        let teardown = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                ctx.fail(&ConduitError::Integrity("bad mac".into())).await
            })
        };

        assert!(matches!(
            sender.await.unwrap(),
            Err(ConduitError::SessionClosed(reason)) if reason.contains("bad mac")
        ));
        assert!(ctx.status().is_closed());

        teardown.await.unwrap();
        assert!(matches!(events.recv().await, Some(SessionEvent::Closed { .. })));
        drop(stalled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_rekeys_on_time() {
        let (ctx, _events, theirs) = context();
        let mut peer = PacketReader::new(theirs, TransportConfig::default());
        let policy = DispatchPolicy {
            rekey: RekeyPolicy {
                max_bytes: u64::MAX,
                max_duration: Duration::from_secs(60),
            },
            ..DispatchPolicy::default()
        };
        let (dispatcher, _inbound) = reading_dispatcher(&ctx, policy);
        let started = Instant::now();
        let reader_task = tokio::spawn(dispatcher.run());

        // Nothing arrives; the timer alone starts the exchange
        let packet = peer.read_packet().await.unwrap();
        assert!(matches!(
            Message::decode(packet.payload).unwrap(),
            Message::KexInit(_)
        ));
        assert!(started.elapsed() >= Duration::from_secs(60));

        ctx.disconnect(DisconnectReason::ByApplication, "done").await;
        reader_task.await.unwrap();
    }
}
