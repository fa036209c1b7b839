//! Connect lifecycle observer seam.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::session::SessionContext;

/// A connect listener failed; the connection is closed with 1011.
#[derive(Debug, Error)]
#[error("connect listener failed: {0}")]
pub struct ListenerError(pub String);

/// Observes the start of every session.
///
/// Register a [`CloseListener`](crate::session::CloseListener) on the
/// session from here to observe its end.
#[async_trait]
pub trait ConnectListener: Send + Sync {
    /// Called once the session context exists and authentication is done.
    async fn on_connect(&self, session: &Arc<SessionContext>) -> Result<(), ListenerError>;
}
