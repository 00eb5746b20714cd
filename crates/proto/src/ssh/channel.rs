//! SSH channels (RFC 4254 Section 5).
//!
//! A [`ChannelHandle`] is the application's end of one logical channel. It
//! is returned by [`Multiplexer::open`](super::multiplexer::Multiplexer::open)
//! once the peer has confirmed the channel, and stays usable until both
//! sides have sent SSH_MSG_CHANNEL_CLOSE.
//!
//! Outbound data is cut into segments no larger than the peer's window and
//! maximum packet size; a send waits while the peer's window is exhausted.
//! Inbound data arrives as [`ChannelEvent`]s through
//! [`ChannelHandle::recv`]; the local window is topped up as it drains.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use conduit_platform::{ConduitError, ConduitResult};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::connection::{ChannelData, ChannelRequestType, ExtendedDataType};
use super::multiplexer::{ChannelEntry, Multiplexer};

/// Channel lifecycle states.
///
/// `Opening -> Open -> Closing -> Closed`, or `Opening -> Failed` when the
/// peer refuses. A channel closed by the peer passes through `Closing` while
/// our reply is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Open request sent, no reply yet
    Opening,
    /// Confirmed by the peer
    Open,
    /// We sent SSH_MSG_CHANNEL_CLOSE and wait for the peer's
    Closing,
    /// Close sent and received; the number is retired
    Closed,
    /// The peer refused the open request
    Failed,
}

/// Snapshot of one channel's flow control and lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    /// Lifecycle state
    pub state: ChannelState,
    /// Peer's channel number; 0 until confirmed
    pub remote_id: u32,
    /// Bytes we may still send
    pub remote_window: u32,
    /// Largest data payload the peer accepts in one message
    pub remote_max_packet: u32,
    /// Bytes the peer may still send us
    pub local_window: u32,
    /// We sent SSH_MSG_CHANNEL_EOF
    pub eof_sent: bool,
    /// The peer sent SSH_MSG_CHANNEL_EOF
    pub eof_received: bool,
    /// We sent SSH_MSG_CHANNEL_CLOSE
    pub close_sent: bool,
    /// The peer sent SSH_MSG_CHANNEL_CLOSE
    pub close_received: bool,
    /// Reason code and description of a refused open
    pub open_failure: Option<(u32, String)>,
    /// The whole session went away
    pub session_closed: bool,
}

impl ChannelStatus {
    pub(crate) fn opening(local_window: u32) -> Self {
        Self {
            state: ChannelState::Opening,
            remote_id: 0,
            remote_window: 0,
            remote_max_packet: 0,
            local_window,
            eof_sent: false,
            eof_received: false,
            close_sent: false,
            close_received: false,
            open_failure: None,
            session_closed: false,
        }
    }

    /// True if data may be sent now or once the window opens.
    pub fn can_send(&self) -> bool {
        self.state == ChannelState::Open && !self.eof_sent && !self.close_sent
    }
}

/// Inbound traffic and lifecycle notifications of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// SSH_MSG_CHANNEL_DATA payload
    Data(Bytes),
    /// SSH_MSG_CHANNEL_EXTENDED_DATA payload; type 1 is stderr
    ExtendedData {
        /// Data type code
        data_type: u32,
        /// Payload
        data: Bytes,
    },
    /// The peer will send no more data
    Eof,
    /// A request from the peer; one wanting a reply has been refused
    Request {
        /// Request type and data
        request: ChannelRequestType,
        /// Whether the peer asked for a reply
        want_reply: bool,
    },
    /// Both sides closed the channel, or the session ended
    Closed,
}

/// Application handle of an open channel.
pub struct ChannelHandle {
    mux: Arc<Multiplexer>,
    entry: Arc<ChannelEntry>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.entry.local_id())
            .field("type", &self.entry.channel_type())
            .field("status", &*self.entry.status().borrow())
            .finish()
    }
}

impl ChannelHandle {
    pub(crate) fn new(
        mux: Arc<Multiplexer>,
        entry: Arc<ChannelEntry>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self { mux, entry, events }
    }

    /// Our channel number.
    pub fn id(&self) -> u32 {
        self.entry.local_id()
    }

    /// Peer's channel number.
    pub fn remote_id(&self) -> u32 {
        self.entry.status().borrow().remote_id
    }

    /// Channel type name, e.g. `session`.
    pub fn channel_type(&self) -> &str {
        self.entry.channel_type()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.entry.status().borrow().state
    }

    /// Bytes we may send before the peer grants more window.
    pub fn remote_window(&self) -> u32 {
        self.entry.status().borrow().remote_window
    }

    /// Snapshot of flow control and lifecycle.
    pub fn status(&self) -> ChannelStatus {
        self.entry.status().borrow().clone()
    }

    /// Watches window and state changes.
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.entry.status().subscribe()
    }

    /// Sends `data`, waiting for window as needed.
    pub async fn send(&self, data: impl Into<Bytes>) -> ConduitResult<()> {
        let data = data.into();
        let len = data.len();
        self.mux.send_range(&self.entry, data, 0, len, None, None).await
    }

    /// Sends `buffer[offset..offset + size]` without copying it.
    ///
    /// # Errors
    ///
    /// [`ConduitError::InvalidArgument`] if the range falls outside the
    /// buffer; nothing is sent in that case.
    pub async fn send_view(&self, buffer: Bytes, offset: usize, size: usize) -> ConduitResult<()> {
        let view = ChannelData::with_range(0, buffer, offset, size)?;
        self.mux
            .send_range(
                &self.entry,
                view.buffer().clone(),
                view.offset(),
                view.offset() + view.size(),
                None,
                None,
            )
            .await
    }

    /// Like [`send`](Self::send), giving up when no window is granted in
    /// time.
    ///
    /// Only waiting is bounded: a segment being written is always finished,
    /// so the transport stays in sync. Segments sent before the deadline
    /// stay sent.
    pub async fn send_timeout(&self, data: impl Into<Bytes>, timeout: Duration) -> ConduitResult<()> {
        let data = data.into();
        let len = data.len();
        let deadline = Instant::now() + timeout;
        self.mux
            .send_range(&self.entry, data, 0, len, None, Some(deadline))
            .await
    }

    /// Sends extended data of `data_type`, usually stderr.
    pub async fn send_extended(
        &self,
        data_type: ExtendedDataType,
        data: impl Into<Bytes>,
    ) -> ConduitResult<()> {
        let data = data.into();
        let len = data.len();
        self.mux
            .send_range(&self.entry, data, 0, len, Some(data_type as u32), None)
            .await
    }

    /// Sends SSH_MSG_CHANNEL_EOF. Further sends fail.
    pub async fn eof(&self) -> ConduitResult<()> {
        self.mux.send_eof(&self.entry).await
    }

    /// Sends a channel request.
    ///
    /// With `want_reply`, waits for the peer's answer and returns whether it
    /// succeeded. Without, returns `true` once sent.
    pub async fn request(&self, request: ChannelRequestType, want_reply: bool) -> ConduitResult<bool> {
        self.mux.request(&self.entry, request, want_reply).await
    }

    /// Runs `command` on a session channel.
    pub async fn exec(&self, command: impl Into<String>) -> ConduitResult<()> {
        let accepted = self
            .request(
                ChannelRequestType::Exec {
                    command: command.into(),
                },
                true,
            )
            .await?;
        if accepted {
            Ok(())
        } else {
            Err(ConduitError::Protocol(format!(
                "exec refused on channel {}",
                self.id()
            )))
        }
    }

    /// Receives the next event, or `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Starts closing the channel. Does nothing if it is already closing.
    pub async fn close(&self) -> ConduitResult<()> {
        self.mux.close_channel(&self.entry).await
    }

    /// Waits until both sides have closed the channel or the session ends.
    pub async fn wait_closed(&self) {
        let mut rx = self.entry.status().subscribe();
        let _ = rx.wait_for(|s| s.state == ChannelState::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opening_status() {
        let status = ChannelStatus::opening(1000);
        assert_eq!(status.state, ChannelState::Opening);
        assert_eq!(status.local_window, 1000);
        assert!(!status.can_send());
    }

    #[test]
    fn test_can_send_requires_open_without_eof_or_close() {
        let mut status = ChannelStatus::opening(10);
        status.state = ChannelState::Open;
        assert!(status.can_send());

        status.eof_sent = true;
        assert!(!status.can_send());

        status.eof_sent = false;
        status.close_sent = true;
        assert!(!status.can_send());
    }
}
