//! Channel multiplexer (RFC 4254 Sections 5 and 6).
//!
//! Owns the channel table of one session: allocates channel numbers, routes
//! inbound connection-protocol messages to channels and enforces flow
//! control in both directions.
//!
//! # Flow control
//!
//! - Outbound, a send is cut into segments of at most
//!   `min(remote window, remote max packet, MAX_CHANNEL_DATA)` bytes and
//!   waits while the remote window is zero.
//! - Inbound, data must fit the local window. Once the window falls below
//!   the low-water mark, it is topped up to the initial size.
//!
//! # Channel numbers
//!
//! Numbers are allocated from a counter and never reused within a session.
//! A channel leaves the table once close has been both sent and received.
//! An open that timed out stays for one more open timeout so a late
//! confirmation can still be closed, then it is evicted.
//!
//! # Locking
//!
//! The table and per-channel bookkeeping sit behind short synchronous
//! locks that are never held across an await. Waiting for window or
//! confirmation uses a watch channel per channel carrying
//! [`ChannelStatus`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use conduit_platform::{ConduitError, ConduitResult};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::channel::{ChannelEvent, ChannelHandle, ChannelState, ChannelStatus};
use super::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequest,
    ChannelRequestType, ChannelType, ChannelWindowAdjust, DEFAULT_MAX_PACKET_SIZE,
    DEFAULT_WINDOW_SIZE,
};
use super::message::Message;
use super::packet::MAX_CHANNEL_DATA;
use super::transport::PacketWriter;

/// Where the multiplexer sends its messages.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Sends one message, in call order.
    async fn send_message(&self, msg: Message) -> ConduitResult<()>;
}

#[async_trait]
impl MessageSink for Mutex<PacketWriter> {
    async fn send_message(&self, msg: Message) -> ConduitResult<()> {
        self.lock().await.send(&msg).await
    }
}

/// Channel defaults.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Initial local window of new channels
    pub window_size: u32,
    /// Largest data payload we accept in one message
    pub max_packet_size: u32,
    /// Window top-up threshold, in percent of the initial window
    pub low_water_percent: u8,
    /// How long [`Multiplexer::open`] waits for the peer
    pub open_timeout: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            low_water_percent: 50,
            open_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct EntryInner {
    events: Option<mpsc::UnboundedSender<ChannelEvent>>,
    replies: VecDeque<oneshot::Sender<bool>>,
    abandoned: bool,
}

/// One row of the channel table.
pub(crate) struct ChannelEntry {
    local_id: u32,
    channel_type: String,
    initial_window: u32,
    local_max_packet: u32,
    low_water: u32,
    status: watch::Sender<ChannelStatus>,
    inner: StdMutex<EntryInner>,
    send_lock: Mutex<()>,
    request_lock: Mutex<()>,
}

impl ChannelEntry {
    pub(crate) fn local_id(&self) -> u32 {
        self.local_id
    }

    pub(crate) fn channel_type(&self) -> &str {
        &self.channel_type
    }

    pub(crate) fn status(&self) -> &watch::Sender<ChannelStatus> {
        &self.status
    }

    fn snapshot(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    fn inner(&self) -> MutexGuard<'_, EntryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, event: ChannelEvent) {
        if let Some(tx) = &self.inner().events {
            // A dropped handle just discards
            let _ = tx.send(event);
        }
    }
}

#[derive(Default)]
struct ChannelTable {
    channels: HashMap<u32, Arc<ChannelEntry>>,
    next_id: u64,
    closed: bool,
}

/// Channel table and flow control of one session.
pub struct Multiplexer {
    sink: Arc<dyn MessageSink>,
    config: MultiplexerConfig,
    table: StdMutex<ChannelTable>,
    close_reason: OnceLock<String>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("config", &self.config)
            .field("channels", &self.channel_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Multiplexer {
    /// Creates an empty channel table sending through `sink`.
    pub fn new(sink: Arc<dyn MessageSink>, config: MultiplexerConfig) -> Arc<Self> {
        Arc::new(Self {
            sink,
            config,
            table: StdMutex::new(ChannelTable::default()),
            close_reason: OnceLock::new(),
        })
    }

    /// Channel defaults.
    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    fn table(&self) -> MutexGuard<'_, ChannelTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of channels not yet fully closed.
    pub fn channel_count(&self) -> usize {
        self.table().channels.len()
    }

    /// State of channel `id`, if it is still in the table.
    pub fn channel_state(&self, id: u32) -> Option<ChannelState> {
        self.table().channels.get(&id).map(|e| e.snapshot().state)
    }

    /// True after [`shutdown`](Self::shutdown).
    pub fn is_closed(&self) -> bool {
        self.table().closed
    }

    fn closed_error(&self) -> ConduitError {
        ConduitError::SessionClosed(
            self.close_reason
                .get()
                .cloned()
                .unwrap_or_else(|| "session is closed".to_string()),
        )
    }

    fn lookup(&self, id: u32) -> ConduitResult<Arc<ChannelEntry>> {
        self.table()
            .channels
            .get(&id)
            .cloned()
            .ok_or_else(|| ConduitError::ChannelProtocol {
                channel: id,
                reason: "no such channel".to_string(),
            })
    }

    fn register(
        &self,
        channel_type: &ChannelType,
        window: u32,
        max_packet: u32,
    ) -> ConduitResult<(Arc<ChannelEntry>, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let mut table = self.table();
        if table.closed {
            return Err(self.closed_error());
        }
        let local_id = u32::try_from(table.next_id)
            .map_err(|_| ConduitError::Protocol("channel numbers exhausted".to_string()))?;
        table.next_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ChannelStatus::opening(window));
        let low_water = (u64::from(window) * u64::from(self.config.low_water_percent) / 100) as u32;
        let entry = Arc::new(ChannelEntry {
            local_id,
            channel_type: channel_type.name().to_string(),
            initial_window: window,
            local_max_packet: max_packet,
            low_water,
            status,
            inner: StdMutex::new(EntryInner {
                events: Some(tx),
                ..EntryInner::default()
            }),
            send_lock: Mutex::new(()),
            request_lock: Mutex::new(()),
        });
        table.channels.insert(local_id, Arc::clone(&entry));
        Ok((entry, rx))
    }

    fn remove(&self, id: u32) {
        self.table().channels.remove(&id);
    }

    /// Opens a channel with the configured window and packet size.
    pub async fn open(self: &Arc<Self>, channel_type: ChannelType) -> ConduitResult<ChannelHandle> {
        let window = self.config.window_size;
        let max_packet = self.config.max_packet_size;
        self.open_with(channel_type, window, max_packet).await
    }

    /// Opens a channel and waits for the peer's answer.
    ///
    /// # Errors
    ///
    /// - [`ConduitError::ChannelOpenFailed`] if the peer refuses
    /// - [`ConduitError::Timeout`] if no answer arrives within the open
    ///   timeout; a late confirmation is then closed right away
    /// - [`ConduitError::SessionClosed`] if the session ends first
    pub async fn open_with(
        self: &Arc<Self>,
        channel_type: ChannelType,
        initial_window: u32,
        max_packet: u32,
    ) -> ConduitResult<ChannelHandle> {
        if max_packet == 0 {
            return Err(ConduitError::invalid_argument(
                "max_packet_size",
                "maximum packet size must be positive",
            ));
        }
        if max_packet as usize > MAX_CHANNEL_DATA {
            return Err(ConduitError::invalid_argument(
                "max_packet_size",
                format!(
                    "maximum packet size {} exceeds the transport limit of {}",
                    max_packet, MAX_CHANNEL_DATA
                ),
            ));
        }

        let (entry, events) = self.register(&channel_type, initial_window, max_packet)?;
        let id = entry.local_id;
        let mut status_rx = entry.status.subscribe();

        let open = Message::ChannelOpen(ChannelOpen {
            channel_type,
            sender_channel: id,
            initial_window_size: initial_window,
            maximum_packet_size: max_packet,
        });
        if let Err(e) = self.sink.send_message(open).await {
            self.remove(id);
            return Err(e);
        }
        debug!(channel = id, kind = %entry.channel_type, "channel open requested");

        let timeout = self.config.open_timeout;
        let waited = tokio::time::timeout(
            timeout,
            status_rx.wait_for(|s| s.state != ChannelState::Opening),
        )
        .await;
        let status = match waited {
            Ok(Ok(status)) => status.clone(),
            Ok(Err(_)) => return Err(self.closed_error()),
            Err(_) => {
                self.abandon(&entry);
                warn!(channel = id, "channel open timed out");
                return Err(ConduitError::Timeout(format!(
                    "channel {} not confirmed within {:?}",
                    id, timeout
                )));
            }
        };

        match status.state {
            ChannelState::Open => Ok(ChannelHandle::new(Arc::clone(self), entry, events)),
            ChannelState::Failed => {
                let (reason_code, description) = status.open_failure.unwrap_or_default();
                Err(ConduitError::ChannelOpenFailed {
                    reason_code,
                    description,
                })
            }
            _ => Err(self.closed_error()),
        }
    }

    /// Marks a timed-out open and evicts it after another open timeout
    /// unless the peer answered meanwhile.
    fn abandon(self: &Arc<Self>, entry: &Arc<ChannelEntry>) {
        entry.inner().abandoned = true;
        let mux = Arc::downgrade(self);
        let entry = Arc::downgrade(entry);
        let grace = self.config.open_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let (Some(mux), Some(entry)) = (mux.upgrade(), entry.upgrade()) else {
                return;
            };
            if entry.snapshot().state == ChannelState::Opening {
                debug!(channel = entry.local_id, "evicting unanswered channel open");
                entry.status.send_modify(|s| s.state = ChannelState::Failed);
                mux.remove(entry.local_id);
                entry.inner().events.take();
            }
        });
    }

    fn send_error(&self, id: u32, status: &ChannelStatus) -> ConduitError {
        if status.session_closed {
            self.closed_error()
        } else if status.close_sent || status.state == ChannelState::Closed {
            ConduitError::invalid_argument("channel", format!("channel {} is closed", id))
        } else if status.eof_sent {
            ConduitError::invalid_argument("channel", format!("EOF already sent on channel {}", id))
        } else {
            ConduitError::invalid_argument("channel", format!("channel {} is not open", id))
        }
    }

    /// Sends `buffer[offset..end]` as data segments fitting the peer's
    /// window and packet size.
    pub(crate) async fn send_range(
        &self,
        entry: &ChannelEntry,
        buffer: Bytes,
        mut offset: usize,
        end: usize,
        data_type: Option<u32>,
        deadline: Option<Instant>,
    ) -> ConduitResult<()> {
        let id = entry.local_id;
        let _guard = wait_until(deadline, entry.send_lock.lock(), id).await?;
        let mut status_rx = entry.status.subscribe();

        while offset < end {
            {
                let waiting = status_rx.wait_for(|s| s.remote_window > 0 || !s.can_send());
                let status = wait_until(deadline, waiting, id)
                    .await?
                    .map_err(|_| self.closed_error())?;
                if !status.can_send() {
                    let err = self.send_error(id, &status);
                    return Err(err);
                }
            }

            let mut reserved = None;
            entry.status.send_if_modified(|s| {
                if !s.can_send() || s.remote_window == 0 {
                    return false;
                }
                let n = (end - offset)
                    .min(s.remote_window as usize)
                    .min(s.remote_max_packet as usize)
                    .min(MAX_CHANNEL_DATA);
                s.remote_window -= n as u32;
                reserved = Some((s.remote_id, n));
                true
            });
            let Some((remote_id, n)) = reserved else {
                continue;
            };

            let sent = match data_type {
                None => match ChannelData::with_range(remote_id, buffer.clone(), offset, n) {
                    Ok(data) => self.sink.send_message(Message::ChannelData(data)).await,
                    Err(e) => Err(e),
                },
                Some(code) => {
                    let msg = Message::ChannelExtendedData(ChannelExtendedData {
                        recipient_channel: remote_id,
                        data_type_code: code,
                        data: buffer.slice(offset..offset + n),
                    });
                    self.sink.send_message(msg).await
                }
            };
            if let Err(e) = sent {
                // Unsent credit goes back to the window
                entry
                    .status
                    .send_modify(|s| s.remote_window = s.remote_window.saturating_add(n as u32));
                return Err(e);
            }
            trace!(channel = id, len = n, "data segment sent");
            offset += n;
        }
        Ok(())
    }

    pub(crate) async fn send_eof(&self, entry: &ChannelEntry) -> ConduitResult<()> {
        let mut remote_id = None;
        entry.status.send_if_modified(|s| {
            if s.can_send() {
                s.eof_sent = true;
                remote_id = Some(s.remote_id);
                true
            } else {
                false
            }
        });
        let Some(remote_id) = remote_id else {
            let status = entry.snapshot();
            return if status.eof_sent && status.state == ChannelState::Open {
                Ok(())
            } else {
                Err(self.send_error(entry.local_id, &status))
            };
        };

        // Segments already reserved go out before the EOF
        let _guard = entry.send_lock.lock().await;
        self.sink
            .send_message(Message::ChannelEof(ChannelEof {
                recipient_channel: remote_id,
            }))
            .await
    }

    pub(crate) async fn request(
        &self,
        entry: &ChannelEntry,
        request: ChannelRequestType,
        want_reply: bool,
    ) -> ConduitResult<bool> {
        let _guard = entry.request_lock.lock().await;
        let status = entry.snapshot();
        if status.state != ChannelState::Open || status.close_sent {
            return Err(self.send_error(entry.local_id, &status));
        }

        let reply = if want_reply {
            let (tx, rx) = oneshot::channel();
            entry.inner().replies.push_back(tx);
            Some(rx)
        } else {
            None
        };

        debug!(channel = entry.local_id, request = request.name(), "channel request");
        self.sink
            .send_message(Message::ChannelRequest(ChannelRequest {
                recipient_channel: status.remote_id,
                want_reply,
                request,
            }))
            .await?;
        drop(_guard);

        match reply {
            Some(rx) => rx.await.map_err(|_| {
                if entry.snapshot().session_closed {
                    self.closed_error()
                } else {
                    ConduitError::invalid_argument(
                        "channel",
                        format!("channel {} closed before replying", entry.local_id),
                    )
                }
            }),
            None => Ok(true),
        }
    }

    /// Starts an orderly close of a channel.
    pub(crate) async fn close_channel(&self, entry: &ChannelEntry) -> ConduitResult<()> {
        let mut remote_id = None;
        let mut opening = false;
        entry.status.send_if_modified(|s| match s.state {
            ChannelState::Open => {
                s.state = ChannelState::Closing;
                s.close_sent = true;
                remote_id = Some(s.remote_id);
                true
            }
            ChannelState::Opening => {
                opening = true;
                false
            }
            _ => false,
        });

        if opening {
            entry.inner().abandoned = true;
            return Ok(());
        }
        let Some(remote_id) = remote_id else {
            return Ok(());
        };

        debug!(channel = entry.local_id, "closing channel");
        let _guard = entry.send_lock.lock().await;
        self.sink
            .send_message(Message::ChannelClose(ChannelClose {
                recipient_channel: remote_id,
            }))
            .await
    }

    /// Tops the local window up to its initial size once it falls below
    /// the low-water mark.
    async fn replenish(&self, entry: &ChannelEntry) -> ConduitResult<()> {
        let mut grant = None;
        entry.status.send_if_modified(|s| {
            if s.state != ChannelState::Open
                || s.eof_received
                || s.local_window >= entry.low_water
                || s.local_window >= entry.initial_window
            {
                return false;
            }
            let add = entry.initial_window - s.local_window;
            s.local_window = entry.initial_window;
            grant = Some((s.remote_id, add));
            true
        });

        match grant {
            Some((remote_id, bytes_to_add)) => {
                trace!(channel = entry.local_id, bytes_to_add, "window adjust");
                self.sink
                    .send_message(Message::ChannelWindowAdjust(ChannelWindowAdjust {
                        recipient_channel: remote_id,
                        bytes_to_add,
                    }))
                    .await
            }
            None => Ok(()),
        }
    }

    fn finalize(&self, entry: &ChannelEntry) {
        entry.status.send_modify(|s| s.state = ChannelState::Closed);
        self.remove(entry.local_id);
        let mut inner = entry.inner();
        if let Some(tx) = inner.events.take() {
            let _ = tx.send(ChannelEvent::Closed);
        }
        inner.replies.clear();
        debug!(channel = entry.local_id, "channel closed");
    }

    /// Closes a channel after a peer violation and reports it.
    async fn violation(&self, entry: &ChannelEntry, reason: String) -> ConduitError {
        warn!(channel = entry.local_id, %reason, "channel protocol violation");
        if let Err(e) = self.close_channel(entry).await {
            debug!(channel = entry.local_id, "close after violation failed: {}", e);
        }
        ConduitError::ChannelProtocol {
            channel: entry.local_id,
            reason,
        }
    }

    /// Handles an inbound connection-protocol message.
    ///
    /// # Errors
    ///
    /// [`ConduitError::ChannelProtocol`] for messages about unknown channels
    /// or channels in the wrong state; the session stays usable. Transport
    /// errors while replying are passed through.
    pub async fn handle(&self, msg: Message) -> ConduitResult<()> {
        match msg {
            Message::ChannelOpenConfirmation(m) => self.on_open_confirmation(m).await,
            Message::ChannelOpenFailure(m) => self.on_open_failure(m),
            Message::ChannelWindowAdjust(m) => self.on_window_adjust(m).await,
            Message::ChannelData(m) => {
                self.on_data(m.recipient_channel(), m.payload(), None).await
            }
            Message::ChannelExtendedData(m) => {
                self.on_data(m.recipient_channel, m.data, Some(m.data_type_code))
                    .await
            }
            Message::ChannelEof(m) => self.on_eof(m.recipient_channel),
            Message::ChannelClose(m) => self.on_close(m.recipient_channel).await,
            Message::ChannelRequest(m) => self.on_request(m).await,
            Message::ChannelSuccess(m) => self.on_reply(m.recipient_channel, true),
            Message::ChannelFailure(m) => self.on_reply(m.recipient_channel, false),
            Message::ChannelOpen(m) => self.refuse_open(m).await,
            other => Err(ConduitError::Protocol(format!(
                "{} is not a channel message",
                other.name()
            ))),
        }
    }

    async fn on_open_confirmation(&self, m: ChannelOpenConfirmation) -> ConduitResult<()> {
        let entry = self.lookup(m.recipient_channel)?;
        let id = entry.local_id;

        if m.maximum_packet_size == 0 {
            entry.status.send_modify(|s| {
                s.state = ChannelState::Failed;
                s.open_failure = Some((0, "peer maximum packet size is zero".to_string()));
            });
            self.remove(id);
            return Err(ConduitError::ChannelProtocol {
                channel: id,
                reason: "confirmation with zero maximum packet size".to_string(),
            });
        }

        let confirmed = entry.status.send_if_modified(|s| {
            if s.state != ChannelState::Opening {
                return false;
            }
            s.state = ChannelState::Open;
            s.remote_id = m.sender_channel;
            s.remote_window = m.initial_window_size;
            s.remote_max_packet = m.maximum_packet_size;
            true
        });
        if !confirmed {
            return Err(ConduitError::ChannelProtocol {
                channel: id,
                reason: "confirmation for a channel that is not opening".to_string(),
            });
        }
        debug!(
            channel = id,
            remote = m.sender_channel,
            window = m.initial_window_size,
            max_packet = m.maximum_packet_size,
            "channel open"
        );

        let abandoned = entry.inner().abandoned;
        if abandoned {
            debug!(channel = id, "closing channel confirmed after its open timed out");
            self.close_channel(&entry).await?;
        }
        Ok(())
    }

    fn on_open_failure(&self, m: ChannelOpenFailure) -> ConduitResult<()> {
        let entry = self.lookup(m.recipient_channel)?;
        let failed = entry.status.send_if_modified(|s| {
            if s.state != ChannelState::Opening {
                return false;
            }
            s.state = ChannelState::Failed;
            s.open_failure = Some((m.reason_code, m.description.clone()));
            true
        });
        if !failed {
            return Err(ConduitError::ChannelProtocol {
                channel: entry.local_id,
                reason: "open failure for a channel that is not opening".to_string(),
            });
        }
        debug!(
            channel = entry.local_id,
            reason = m.reason_code,
            description = %m.description,
            "channel open refused"
        );
        self.remove(entry.local_id);
        entry.inner().events.take();
        Ok(())
    }

    async fn on_window_adjust(&self, m: ChannelWindowAdjust) -> ConduitResult<()> {
        let entry = self.lookup(m.recipient_channel)?;
        let mut problem = None;
        entry.status.send_if_modified(|s| {
            if !matches!(s.state, ChannelState::Open | ChannelState::Closing) {
                problem = Some(format!("window adjust in state {:?}", s.state));
                return false;
            }
            match s.remote_window.checked_add(m.bytes_to_add) {
                Some(window) => {
                    s.remote_window = window;
                    true
                }
                None => {
                    problem = Some("window adjust overflows 2^32 - 1".to_string());
                    false
                }
            }
        });
        match problem {
            Some(reason) => Err(self.violation(&entry, reason).await),
            None => {
                trace!(channel = entry.local_id, added = m.bytes_to_add, "remote window grown");
                Ok(())
            }
        }
    }

    async fn on_data(&self, id: u32, data: Bytes, data_type: Option<u32>) -> ConduitResult<()> {
        let entry = self.lookup(id)?;
        let status = entry.snapshot();

        match status.state {
            ChannelState::Open => {}
            // The peer may not have seen our close yet
            ChannelState::Closing => {
                trace!(channel = id, len = data.len(), "discarding data after close");
                return Ok(());
            }
            state => {
                return Err(ConduitError::ChannelProtocol {
                    channel: id,
                    reason: format!("data in state {:?}", state),
                })
            }
        }

        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        if status.eof_received {
            return Err(self.violation(&entry, "data after EOF".to_string()).await);
        }
        if len > status.local_window {
            let reason = format!(
                "{} bytes exceed the window of {}",
                len, status.local_window
            );
            return Err(self.violation(&entry, reason).await);
        }
        if len > entry.local_max_packet {
            let reason = format!(
                "{} bytes exceed the maximum packet size of {}",
                len, entry.local_max_packet
            );
            return Err(self.violation(&entry, reason).await);
        }

        entry
            .status
            .send_modify(|s| s.local_window = s.local_window.saturating_sub(len));
        let event = match data_type {
            None => ChannelEvent::Data(data),
            Some(data_type) => ChannelEvent::ExtendedData { data_type, data },
        };
        entry.deliver(event);
        self.replenish(&entry).await
    }

    fn on_eof(&self, id: u32) -> ConduitResult<()> {
        let entry = self.lookup(id)?;
        let state = entry.snapshot().state;
        match state {
            ChannelState::Open => {
                entry.status.send_modify(|s| s.eof_received = true);
                entry.deliver(ChannelEvent::Eof);
                debug!(channel = id, "peer sent EOF");
                Ok(())
            }
            ChannelState::Closing => Ok(()),
            state => Err(ConduitError::ChannelProtocol {
                channel: id,
                reason: format!("EOF in state {:?}", state),
            }),
        }
    }

    async fn on_close(&self, id: u32) -> ConduitResult<()> {
        let entry = self.lookup(id)?;
        let mut reply_to = None;
        let mut valid = true;
        entry.status.send_if_modified(|s| match s.state {
            ChannelState::Open => {
                s.close_received = true;
                s.state = ChannelState::Closing;
                s.close_sent = true;
                reply_to = Some(s.remote_id);
                true
            }
            ChannelState::Closing => {
                s.close_received = true;
                true
            }
            _ => {
                valid = false;
                false
            }
        });
        if !valid {
            return Err(ConduitError::ChannelProtocol {
                channel: id,
                reason: "close for a channel that is not open".to_string(),
            });
        }

        let mut result = Ok(());
        if let Some(remote_id) = reply_to {
            debug!(channel = id, "peer closed channel");
            let _guard = entry.send_lock.lock().await;
            result = self
                .sink
                .send_message(Message::ChannelClose(ChannelClose {
                    recipient_channel: remote_id,
                }))
                .await;
        }
        self.finalize(&entry);
        result
    }

    async fn on_request(&self, m: ChannelRequest) -> ConduitResult<()> {
        let entry = self.lookup(m.recipient_channel)?;
        let status = entry.snapshot();
        match status.state {
            ChannelState::Open => {}
            ChannelState::Closing => return Ok(()),
            state => {
                return Err(ConduitError::ChannelProtocol {
                    channel: entry.local_id,
                    reason: format!("request in state {:?}", state),
                })
            }
        }

        debug!(
            channel = entry.local_id,
            request = m.request.name(),
            want_reply = m.want_reply,
            "peer channel request"
        );
        let want_reply = m.want_reply;
        entry.deliver(
            ChannelEvent::Request {
                request: m.request,
                want_reply,
            },
        );
        if want_reply {
            self.sink
                .send_message(Message::ChannelFailure(ChannelFailure {
                    recipient_channel: status.remote_id,
                }))
                .await?;
        }
        Ok(())
    }

    fn on_reply(&self, id: u32, success: bool) -> ConduitResult<()> {
        let entry = self.lookup(id)?;
        let waiter = entry.inner().replies.pop_front();
        match waiter {
            Some(tx) => {
                let _ = tx.send(success);
                Ok(())
            }
            None => Err(ConduitError::ChannelProtocol {
                channel: id,
                reason: "reply without an outstanding request".to_string(),
            }),
        }
    }

    async fn refuse_open(&self, m: ChannelOpen) -> ConduitResult<()> {
        debug!(
            kind = m.channel_type.name(),
            sender = m.sender_channel,
            "refusing channel opened by peer"
        );
        self.sink
            .send_message(Message::ChannelOpenFailure(ChannelOpenFailure::new(
                m.sender_channel,
                ChannelOpenFailureReason::AdministrativelyProhibited,
                "channels cannot be opened by the server",
            )))
            .await
    }

    /// Fails every channel and waiter with `reason`. Later calls do nothing.
    pub fn shutdown(&self, reason: &str) {
        let entries: Vec<Arc<ChannelEntry>> = {
            let mut table = self.table();
            if table.closed {
                return;
            }
            table.closed = true;
            let _ = self.close_reason.set(reason.to_string());
            table.channels.drain().map(|(_, e)| e).collect()
        };

        for entry in entries {
            entry.status.send_modify(|s| {
                s.state = ChannelState::Closed;
                s.session_closed = true;
            });
            let mut inner = entry.inner();
            if let Some(tx) = inner.events.take() {
                let _ = tx.send(ChannelEvent::Closed);
            }
            inner.replies.clear();
        }
        debug!(%reason, "multiplexer shut down");
    }
}

async fn wait_until<F: std::future::Future>(
    deadline: Option<Instant>,
    fut: F,
    channel: u32,
) -> ConduitResult<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.map_err(|_| {
            ConduitError::Timeout(format!("no window granted on channel {} in time", channel))
        }),
        None => Ok(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::connection::ChannelSuccess;

    /// Records sent messages.
    struct RecordingSink {
        tx: mpsc::UnboundedSender<Message>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send_message(&self, msg: Message) -> ConduitResult<()> {
            self.tx
                .send(msg)
                .map_err(|_| ConduitError::SessionClosed("sink dropped".to_string()))
        }
    }

    fn setup(config: MultiplexerConfig) -> (Arc<Multiplexer>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Multiplexer::new(Arc::new(RecordingSink { tx }), config), rx)
    }

    async fn open_confirmed(
        mux: &Arc<Multiplexer>,
        sent: &mut mpsc::UnboundedReceiver<Message>,
        window: u32,
        max_packet: u32,
        peer_window: u32,
        peer_max_packet: u32,
    ) -> ChannelHandle {
        let opener = {
            let mux = Arc::clone(mux);
            tokio::spawn(async move {
                mux.open_with(ChannelType::Session, window, max_packet)
                    .await
            })
        };
        let id = match sent.recv().await.unwrap() {
            Message::ChannelOpen(open) => {
                assert_eq!(open.initial_window_size, window);
                assert_eq!(open.maximum_packet_size, max_packet);
                open.sender_channel
            }
            other => panic!("expected SSH_MSG_CHANNEL_OPEN, got {:?}", other),
        };
        mux.handle(Message::ChannelOpenConfirmation(ChannelOpenConfirmation::new(
            id,
            100 + id,
            peer_window,
            peer_max_packet,
        )))
        .await
        .unwrap();
        opener.await.unwrap().unwrap()
    }

    fn data_len(msg: &Message) -> usize {
        match msg {
            Message::ChannelData(data) => data.size(),
            other => panic!("expected SSH_MSG_CHANNEL_DATA, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_splits_by_window_and_packet_size() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let channel = open_confirmed(&mux, &mut sent, 1000, 500, 1000, 500).await;
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.remote_id(), 100);

        let payload = Bytes::from(vec![7u8; 1200]);
        let channel = Arc::new(channel);
        let sender = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.send(payload).await })
        };

        assert_eq!(data_len(&sent.recv().await.unwrap()), 500);
        assert_eq!(data_len(&sent.recv().await.unwrap()), 500);

        // Window exhausted: the last 200 bytes wait
        tokio::task::yield_now().await;
        assert!(sent.try_recv().is_err());
        assert!(!sender.is_finished());
        assert_eq!(channel.remote_window(), 0);

        mux.handle(Message::ChannelWindowAdjust(ChannelWindowAdjust {
            recipient_channel: channel.id(),
            bytes_to_add: 1000,
        }))
        .await
        .unwrap();

        let last = sent.recv().await.unwrap();
        assert_eq!(data_len(&last), 200);
        match last {
            Message::ChannelData(data) => assert_eq!(data.recipient_channel(), 100),
            _ => unreachable!(),
        }
        sender.await.unwrap().unwrap();
        assert_eq!(channel.remote_window(), 800);
    }

    #[tokio::test]
    async fn test_segments_share_the_callers_buffer() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let channel = open_confirmed(&mux, &mut sent, 1000, 500, 4096, 3).await;

        let buffer = Bytes::from_static(b"0123456789");
        channel.send_view(buffer.clone(), 2, 5).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(Message::ChannelData(data)) = sent.try_recv() {
            assert_eq!(data.buffer().as_ptr(), buffer.as_ptr());
            seen.extend_from_slice(data.data());
        }
        assert_eq!(seen, b"23456");
    }

    #[tokio::test]
    async fn test_send_view_rejects_bad_range() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let channel = open_confirmed(&mux, &mut sent, 1000, 500, 1000, 500).await;

        let err = channel
            .send_view(Bytes::from_static(b"abc"), 2, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::InvalidArgument { param: "size", .. }));
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_without_window() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let channel = open_confirmed(&mux, &mut sent, 1000, 500, 0, 500).await;

        let err = channel
            .send_timeout(Bytes::from_static(b"late"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::Timeout(_)));
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let opener = {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move { mux.open(ChannelType::Session).await })
        };
        let id = match sent.recv().await.unwrap() {
            Message::ChannelOpen(open) => open.sender_channel,
            other => panic!("unexpected {:?}", other),
        };
        mux.handle(Message::ChannelOpenFailure(ChannelOpenFailure::new(
            id,
            ChannelOpenFailureReason::ResourceShortage,
            "busy",
        )))
        .await
        .unwrap();

        match opener.await.unwrap() {
            Err(ConduitError::ChannelOpenFailed {
                reason_code,
                description,
            }) => {
                assert_eq!(reason_code, 4);
                assert_eq!(description, "busy");
            }
            other => panic!("expected ChannelOpenFailed, got {:?}", other),
        }
        assert_eq!(mux.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_closes_late_confirmation() {
        let config = MultiplexerConfig {
            open_timeout: Duration::from_secs(2),
            ..MultiplexerConfig::default()
        };
        let (mux, mut sent) = setup(config);
        let err = mux.open(ChannelType::Session).await.unwrap_err();
        assert!(matches!(err, ConduitError::Timeout(_)));

        let id = match sent.recv().await.unwrap() {
            Message::ChannelOpen(open) => open.sender_channel,
            other => panic!("unexpected {:?}", other),
        };
        mux.handle(Message::ChannelOpenConfirmation(ChannelOpenConfirmation::new(
            id, 9, 1000, 1000,
        )))
        .await
        .unwrap();

        assert!(matches!(
            sent.recv().await.unwrap(),
            Message::ChannelClose(ChannelClose { recipient_channel: 9 })
        ));
        assert_eq!(mux.channel_state(id), Some(ChannelState::Closing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_open_is_evicted() {
        let config = MultiplexerConfig {
            open_timeout: Duration::from_secs(2),
            ..MultiplexerConfig::default()
        };
        let (mux, mut sent) = setup(config);
        let err = mux.open(ChannelType::Session).await.unwrap_err();
        assert!(matches!(err, ConduitError::Timeout(_)));
        let id = match sent.recv().await.unwrap() {
            Message::ChannelOpen(open) => open.sender_channel,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(mux.channel_count(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(mux.channel_count(), 0);

        let err = mux
            .handle(Message::ChannelOpenConfirmation(ChannelOpenConfirmation::new(
                id, 9, 1000, 1000,
            )))
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::ChannelProtocol { .. }));
    }

    #[tokio::test]
    async fn test_channel_numbers_are_not_reused() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let first = open_confirmed(&mux, &mut sent, 1000, 500, 1000, 500).await;
        first.close().await.unwrap();
        sent.recv().await.unwrap();
        mux.handle(Message::ChannelClose(ChannelClose {
            recipient_channel: first.id(),
        }))
        .await
        .unwrap();
        assert_eq!(first.state(), ChannelState::Closed);

        let second = open_confirmed(&mux, &mut sent, 1000, 500, 1000, 500).await;
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_close_requires_both_directions() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let mut channel = open_confirmed(&mux, &mut sent, 1000, 500, 1000, 500).await;

        channel.close().await.unwrap();
        assert!(matches!(sent.recv().await.unwrap(), Message::ChannelClose(_)));
        assert_eq!(channel.state(), ChannelState::Closing);
        assert_eq!(mux.channel_state(channel.id()), Some(ChannelState::Closing));
        assert!(channel.send(Bytes::from_static(b"x")).await.is_err());

        mux.handle(Message::ChannelClose(ChannelClose {
            recipient_channel: channel.id(),
        }))
        .await
        .unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(mux.channel_state(channel.id()), None);
        assert_eq!(channel.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(channel.recv().await, None);
    }

    #[tokio::test]
    async fn test_peer_close_is_answered() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let channel = open_confirmed(&mux, &mut sent, 1000, 500, 1000, 500).await;

        mux.handle(Message::ChannelClose(ChannelClose {
            recipient_channel: channel.id(),
        }))
        .await
        .unwrap();
        assert!(matches!(
            sent.recv().await.unwrap(),
            Message::ChannelClose(ChannelClose { recipient_channel: 100 })
        ));
        let status = channel.status();
        assert_eq!(status.state, ChannelState::Closed);
        assert!(status.close_sent && status.close_received);
    }

    #[tokio::test]
    async fn test_inbound_data_refills_to_initial_window() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let mut channel = open_confirmed(&mux, &mut sent, 1000, 500, 1000, 500).await;
        let id = channel.id();

        mux.handle(Message::ChannelData(ChannelData::new(
            id,
            Bytes::from(vec![1u8; 300]),
        )))
        .await
        .unwrap();
        // 700 left, above the low-water mark of 500
        assert_eq!(channel.status().local_window, 700);
        assert!(sent.try_recv().is_err());

        mux.handle(Message::ChannelData(ChannelData::new(
            id,
            Bytes::from(vec![2u8; 300]),
        )))
        .await
        .unwrap();
        // Topped up even though nothing has been read yet
        match sent.recv().await.unwrap() {
            Message::ChannelWindowAdjust(adjust) => {
                assert_eq!(adjust.recipient_channel, 100);
                assert_eq!(adjust.bytes_to_add, 600);
            }
            other => panic!("expected window adjust, got {:?}", other),
        }
        assert_eq!(channel.status().local_window, 1000);

        assert!(matches!(channel.recv().await, Some(ChannelEvent::Data(d)) if d.len() == 300));
        assert!(matches!(channel.recv().await, Some(ChannelEvent::Data(d)) if d.len() == 300));
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_large_peer_max_packet_is_capped_by_transport() {
        let (ours, theirs) = tokio::io::duplex(1 << 20);
        let writer = PacketWriter::new(ours).shared();
        let mux = Multiplexer::new(writer, MultiplexerConfig::default());
        let mut peer = crate::ssh::transport::PacketReader::new(
            theirs,
            crate::ssh::transport::TransportConfig::default(),
        );

        let opener = {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move { mux.open(ChannelType::Session).await })
        };
        let packet = peer.read_packet().await.unwrap();
        let id = match Message::decode(packet.payload).unwrap() {
            Message::ChannelOpen(open) => open.sender_channel,
            other => panic!("expected SSH_MSG_CHANNEL_OPEN, got {:?}", other),
        };
        mux.handle(Message::ChannelOpenConfirmation(ChannelOpenConfirmation::new(
            id,
            5,
            1 << 20,
            65536,
        )))
        .await
        .unwrap();
        let channel = opener.await.unwrap().unwrap();

        channel.send(vec![0u8; 100_000]).await.unwrap();
        assert_eq!(channel.remote_window(), (1 << 20) - 100_000);

        let mut sizes = Vec::new();
        while sizes.iter().sum::<usize>() < 100_000 {
            let packet = peer.read_packet().await.unwrap();
            match Message::decode(packet.payload).unwrap() {
                Message::ChannelData(data) => sizes.push(data.size()),
                other => panic!("expected SSH_MSG_CHANNEL_DATA, got {:?}", other),
            }
        }
        assert_eq!(
            sizes,
            vec![MAX_CHANNEL_DATA, MAX_CHANNEL_DATA, 100_000 - 2 * MAX_CHANNEL_DATA]
        );
    }

    #[tokio::test]
    async fn test_failed_send_returns_window() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let channel = open_confirmed(&mux, &mut sent, 1000, 500, 1000, 500).await;
        drop(sent);

        let err = channel.send(vec![0u8; 300]).await.unwrap_err();
        assert!(matches!(err, ConduitError::SessionClosed(_)));
        assert_eq!(channel.remote_window(), 1000);
    }

    #[tokio::test]
    async fn test_open_rejects_max_packet_beyond_transport_limit() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let err = mux
            .open_with(ChannelType::Session, 1 << 20, 65536)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConduitError::InvalidArgument { param: "max_packet_size", .. }
        ));
        assert!(sent.try_recv().is_err());
        assert_eq!(mux.channel_count(), 0);

        let largest = MAX_CHANNEL_DATA as u32;
        let channel = open_confirmed(&mux, &mut sent, 1 << 20, largest, 1000, 500).await;
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn test_data_beyond_window_is_a_channel_error() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let channel = open_confirmed(&mux, &mut sent, 100, 500, 1000, 500).await;

        let err = mux
            .handle(Message::ChannelData(ChannelData::new(
                channel.id(),
                Bytes::from(vec![0u8; 101]),
            )))
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::ChannelProtocol { .. }));
        assert!(!err.is_fatal());
        assert_eq!(channel.state(), ChannelState::Closing);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_a_channel_error() {
        let (mux, _sent) = setup(MultiplexerConfig::default());
        let err = mux
            .handle(Message::ChannelEof(ChannelEof {
                recipient_channel: 42,
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::ChannelProtocol { channel: 42, .. }));
    }

    #[tokio::test]
    async fn test_window_adjust_overflow_is_rejected() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let channel = open_confirmed(&mux, &mut sent, 1000, 500, u32::MAX - 10, 500).await;
        let err = mux
            .handle(Message::ChannelWindowAdjust(ChannelWindowAdjust {
                recipient_channel: channel.id(),
                bytes_to_add: 11,
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::ChannelProtocol { .. }));
    }

    #[tokio::test]
    async fn test_request_reply_and_peer_requests() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let mut channel = open_confirmed(&mux, &mut sent, 1000, 500, 1000, 500).await;
        let id = channel.id();

        let mux2 = Arc::clone(&mux);
        let replier = tokio::spawn(async move {
            loop {
                if let Message::ChannelRequest(req) = sent.recv().await.unwrap() {
                    assert_eq!(req.request.name(), "exec");
                    assert!(req.want_reply);
                    mux2.handle(Message::ChannelSuccess(ChannelSuccess {
                        recipient_channel: id,
                    }))
                    .await
                    .unwrap();
                    return sent;
                }
            }
        });
        channel.exec("uptime").await.unwrap();
        let mut sent = replier.await.unwrap();

        mux.handle(Message::ChannelRequest(ChannelRequest {
            recipient_channel: id,
            want_reply: true,
            request: ChannelRequestType::Other {
                name: "keepalive@openssh.com".into(),
                data: Bytes::new(),
            },
        }))
        .await
        .unwrap();
        assert!(matches!(
            sent.recv().await.unwrap(),
            Message::ChannelFailure(ChannelFailure { recipient_channel: 100 })
        ));
        assert!(matches!(
            channel.recv().await,
            Some(ChannelEvent::Request { want_reply: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_peer_channel_open_is_refused() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        mux.handle(Message::ChannelOpen(ChannelOpen {
            channel_type: ChannelType::Session,
            sender_channel: 77,
            initial_window_size: 1000,
            maximum_packet_size: 1000,
        }))
        .await
        .unwrap();
        match sent.recv().await.unwrap() {
            Message::ChannelOpenFailure(failure) => {
                assert_eq!(failure.recipient_channel, 77);
                assert_eq!(
                    failure.reason(),
                    Some(ChannelOpenFailureReason::AdministrativelyProhibited)
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_releases_blocked_senders() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let channel = Arc::new(open_confirmed(&mux, &mut sent, 1000, 500, 0, 500).await);
        let sender = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.send(Bytes::from_static(b"blocked")).await })
        };
        tokio::task::yield_now().await;

        mux.shutdown("MAC mismatch");
        match sender.await.unwrap() {
            Err(ConduitError::SessionClosed(reason)) => assert_eq!(reason, "MAC mismatch"),
            other => panic!("expected SessionClosed, got {:?}", other),
        }
        assert!(matches!(
            mux.open(ChannelType::Session).await,
            Err(ConduitError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_blocks_further_sends() {
        let (mux, mut sent) = setup(MultiplexerConfig::default());
        let channel = open_confirmed(&mux, &mut sent, 1000, 500, 1000, 500).await;
        channel.eof().await.unwrap();
        assert!(matches!(sent.recv().await.unwrap(), Message::ChannelEof(_)));
        assert!(matches!(
            channel.send(Bytes::from_static(b"x")).await,
            Err(ConduitError::InvalidArgument { .. })
        ));
    }
}
