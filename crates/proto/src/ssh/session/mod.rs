//! Session lifecycle.
//!
//! This module provides:
//! - The session state machine ([`SessionState`], [`SessionStatus`])
//! - Rekey thresholds ([`RekeyPolicy`])
//! - What to do with unknown message types ([`UnknownMessagePolicy`])
//! - Events delivered to the application ([`SessionEvent`])
//! - Keep-alive heartbeat ([`KeepaliveTask`])

pub mod keepalive;

use std::sync::OnceLock;
use std::time::Duration;

use conduit_platform::{ConduitError, ConduitResult};
use tokio::sync::watch;
use tracing::debug;

use super::connection::GlobalRequest;
use super::generic::DebugMessage;

pub use keepalive::{keepalive_message, KeepaliveTask, KEEPALIVE_FILLER_LEN};

/// Session lifecycle states.
///
/// States only move forward. A rekey does not leave `Operational`.
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Exchanging identification strings
    VersionExchange,
    /// Running the first key exchange
    KeyExchange,
    /// Encrypted, authenticating the user
    Authenticating,
    /// Authenticated; channels may be opened
    Operational,
    /// Torn down
    Closed,
}

impl SessionState {
    /// Returns true if a session may move from `self` to `next`.
    ///
    /// ```rust
    /// use conduit_proto::ssh::session::SessionState;
    ///
    /// assert!(SessionState::KeyExchange.can_transition_to(SessionState::Authenticating));
    /// assert!(SessionState::Authenticating.can_transition_to(SessionState::Closed));
    /// assert!(!SessionState::Operational.can_transition_to(SessionState::KeyExchange));
    /// assert!(!SessionState::Closed.can_transition_to(SessionState::Closed));
    /// ```
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (VersionExchange, KeyExchange)
                | (KeyExchange, Authenticating)
                | (Authenticating, Operational)
                | (VersionExchange | KeyExchange | Authenticating | Operational, Closed)
        )
    }
}

/// Shared view of a session's state.
///
/// Waiters subscribe to state changes; the reason given to the first
/// [`close`](Self::close) is kept and reported to every later operation.
#[derive(Debug)]
pub struct SessionStatus {
    state: watch::Sender<SessionState>,
    close_reason: OnceLock<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStatus {
    /// Starts in [`SessionState::VersionExchange`].
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::VersionExchange);
        Self {
            state,
            close_reason: OnceLock::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watches state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// [`ConduitError::SessionClosed`] if the session is closed, and
    /// [`ConduitError::Protocol`] for any other backward or skipping move.
    pub fn advance(&self, next: SessionState) -> ConduitResult<()> {
        let current = self.state();
        if current == SessionState::Closed {
            return Err(self.closed_error());
        }
        if !current.can_transition_to(next) {
            return Err(ConduitError::Protocol(format!(
                "session cannot move from {:?} to {:?}",
                current, next
            )));
        }
        debug!(from = ?current, to = ?next, "session state");
        self.state.send_replace(next);
        Ok(())
    }

    /// Closes the session. Returns false if it was already closed.
    pub fn close(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if self.close_reason.set(reason.clone()).is_err() {
            return false;
        }
        debug!(%reason, "session closed");
        self.state.send_replace(SessionState::Closed);
        true
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Reason given when the session was closed.
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.get().map(String::as_str)
    }

    /// Error returned by operations on a closed session.
    pub fn closed_error(&self) -> ConduitError {
        ConduitError::SessionClosed(
            self.close_reason()
                .unwrap_or("session is closed")
                .to_string(),
        )
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the wait cannot fail.
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }
}

/// When to start a new key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyPolicy {
    /// Bytes transferred (both directions) since the last exchange
    pub max_bytes: u64,
    /// Time since the last exchange
    pub max_duration: Duration,
}

impl Default for RekeyPolicy {
    /// 1 GiB or one hour, as recommended by RFC 4253 Section 9.
    fn default() -> Self {
        Self {
            max_bytes: 1 << 30,
            max_duration: Duration::from_secs(3600),
        }
    }
}

impl RekeyPolicy {
    /// Never rekeys on its own.
    pub fn disabled() -> Self {
        Self {
            max_bytes: u64::MAX,
            max_duration: Duration::MAX,
        }
    }

    /// True if either threshold has been reached.
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use conduit_proto::ssh::session::RekeyPolicy;
    ///
    /// let policy = RekeyPolicy { max_bytes: 1000, max_duration: Duration::from_secs(60) };
    /// assert!(!policy.is_due(999, Duration::from_secs(59)));
    /// assert!(policy.is_due(1000, Duration::ZERO));
    /// assert!(policy.is_due(0, Duration::from_secs(60)));
    /// ```
    pub fn is_due(&self, bytes_since: u64, elapsed: Duration) -> bool {
        bytes_since >= self.max_bytes || elapsed >= self.max_duration
    }
}

/// Reaction to a message tag with no registered decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownMessagePolicy {
    /// Drop it silently
    Ignore,
    /// Reply SSH_MSG_UNIMPLEMENTED with the packet's sequence number
    #[default]
    ReplyUnimplemented,
    /// Treat it as a fatal protocol error
    Disconnect,
}

/// Session-level notifications for the application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// SSH_MSG_USERAUTH_BANNER text
    Banner(String),
    /// SSH_MSG_DEBUG from the peer
    Debug(DebugMessage),
    /// Global request from the peer; one wanting a reply has been refused
    GlobalRequest(GlobalRequest),
    /// The peer did not understand our packet with this sequence number
    Unimplemented(u32),
    /// A message for an unknown or misbehaving channel
    ChannelError {
        /// Channel number from the message
        channel: u32,
        /// What went wrong
        reason: String,
    },
    /// A key exchange finished; `generation` counts from 1
    KeyExchangeCompleted {
        /// Number of completed exchanges
        generation: u64,
    },
    /// The session ended
    Closed {
        /// Why it ended
        reason: String,
    },
}
