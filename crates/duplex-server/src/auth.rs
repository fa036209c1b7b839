//! Connection authentication seam.

use async_trait::async_trait;
use thiserror::Error;

use crate::session::{Handshake, Identity};

/// The handshake presented credentials that could not be verified.
///
/// Fatal to the connection: it is closed with 1011 before any listener runs.
#[derive(Debug, Error)]
pub enum AuthenticationError {
    /// Credentials were present but wrong.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    /// The credential store could not be consulted.
    #[error("authentication backend unavailable: {0}")]
    Unavailable(String),
}

/// Verifies an inbound connection's handshake.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `Ok(Some(_))` authenticates the session, `Ok(None)` leaves it anonymous.
    async fn authenticate(&self, handshake: &Handshake) -> Result<Option<Identity>, AuthenticationError>;
}
