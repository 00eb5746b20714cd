//! Keep-alive heartbeat.
//!
//! Sends SSH_MSG_IGNORE with random filler at a fixed interval so idle
//! sessions survive NAT and firewall timeouts. The message goes through the
//! writer's key exchange gate like any other transport-generic message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use conduit_platform::ConduitResult;
use rand::RngCore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ssh::generic::Ignore;
use crate::ssh::message::Message;
use crate::ssh::transport::SharedWriter;

/// Filler length used by [`KeepaliveTask::start_on`].
pub const KEEPALIVE_FILLER_LEN: usize = 16;

/// Background task that periodically runs a send function.
///
/// The task stops on the first failed send, on [`stop`](Self::stop), or when
/// dropped.
pub struct KeepaliveTask {
    interval: Duration,
    stop_signal: Arc<AtomicBool>,
    task_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for KeepaliveTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepaliveTask")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

impl KeepaliveTask {
    /// Creates a task without starting it.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stop_signal: Arc::new(AtomicBool::new(false)),
            task_handle: None,
        }
    }

    /// Heartbeat interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts calling `send_fn` every interval.
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use conduit_proto::ssh::session::KeepaliveTask;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let mut task = KeepaliveTask::new(Duration::from_secs(30));
    /// task.start(|| async { Ok(()) });
    /// assert!(task.is_running());
    /// task.stop();
    /// # }
    /// ```
    pub fn start<F, Fut>(&mut self, send_fn: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ConduitResult<()>> + Send + 'static,
    {
        self.stop();
        self.stop_signal = Arc::new(AtomicBool::new(false));

        let interval = self.interval;
        let stop_signal = Arc::clone(&self.stop_signal);

        let handle = tokio::spawn(async move {
            debug!(?interval, "keep-alive started");

            loop {
                tokio::time::sleep(interval).await;

                if stop_signal.load(Ordering::Relaxed) {
                    break;
                }

                if let Err(e) = send_fn().await {
                    warn!("keep-alive failed, stopping: {}", e);
                    break;
                }
                debug!("keep-alive sent");
            }

            debug!("keep-alive stopped");
        });

        self.task_handle = Some(handle);
    }

    /// Starts sending SSH_MSG_IGNORE on `writer`.
    pub fn start_on(&mut self, writer: SharedWriter) {
        self.start(move || {
            let writer = Arc::clone(&writer);
            async move {
                let msg = keepalive_message(KEEPALIVE_FILLER_LEN);
                writer.lock().await.send(&msg).await
            }
        });
    }

    /// Stops the task.
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);

        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }

    /// True while the task is alive.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds an SSH_MSG_IGNORE carrying `data_len` random bytes.
///
/// Random filler keeps heartbeats from being recognisable by length and
/// content alone.
///
/// ```rust
/// use conduit_proto::ssh::message::Message;
/// use conduit_proto::ssh::session::keepalive_message;
///
/// let msg = keepalive_message(32);
/// let wire = msg.encode();
/// assert_eq!(wire[0], 2); // SSH_MSG_IGNORE
/// assert_eq!(wire.len(), 1 + 4 + 32);
/// ```
pub fn keepalive_message(data_len: usize) -> Message {
    let mut data = vec![0u8; data_len];
    rand::thread_rng().fill_bytes(&mut data);
    Message::Ignore(Ignore {
        data: Bytes::from(data),
    })
}
