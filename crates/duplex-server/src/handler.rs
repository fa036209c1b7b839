//! The local request handler seam.

use std::sync::Arc;

use async_trait::async_trait;
use duplex_core::{Headers, Request, Response};
use thiserror::Error;

use crate::session::SessionContext;

/// Business-logic failure while servicing one inbound request.
///
/// Contained to that request: the peer sees a 500 response when it asked for
/// one, and the connection stays open.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler rejected or failed the request.
    #[error("{0}")]
    Failed(String),
    /// I/O failure while producing the reply.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// What a handler produces for one request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reply {
    /// HTTP-style status code.
    pub status: u16,
    /// Short status message.
    pub message: String,
    /// Reply headers.
    pub headers: Headers,
    /// Optional body bytes.
    pub body: Option<Vec<u8>>,
}

impl Reply {
    /// Create a reply with a status and message.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// `200 OK`.
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// `404 Not Found`.
    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    /// Append a header value.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(name.into()).or_default().push(value.into());
        self
    }

    /// Attach a body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Frame this reply as a response correlated to `request_id`.
    pub fn into_response(self, request_id: u64) -> Response {
        Response {
            request_id,
            status: self.status,
            message: self.message,
            headers: self.headers,
            body: self.body,
        }
    }
}

/// Services requests that arrive from the peer.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Produce the reply for `request`.
    ///
    /// The reply is discarded when the request carries no id.
    async fn handle(&self, request: &Request, session: &Arc<SessionContext>) -> Result<Reply, HandlerError>;
}
