//! Graceful shutdown: one `CancellationToken` seen by every session, plus a
//! tracker so the server can wait for sessions to finish closing.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Default time sessions get to finish their close handshakes.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Coordinates shutdown across the listener and all live sessions.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    sessions: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a coordinator with nothing tracked.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    /// A clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal shutdown without waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run `session` while counting it as live.
    pub async fn track<F>(&self, session: F) -> F::Output
    where
        F: Future,
    {
        self.sessions.track_future(session).await
    }

    /// Sessions currently running.
    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Signal shutdown and wait up to `timeout` for every session to end.
    ///
    /// Returns `false` if sessions were still running at the deadline.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();
        let _ = self.sessions.close();
        info!(
            sessions = self.sessions.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for sessions to close"
        );

        if tokio::time::timeout(timeout, self.sessions.wait()).await.is_err() {
            warn!(sessions = self.sessions.len(), "shutdown timed out after {timeout:?}");
            return false;
        }
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
