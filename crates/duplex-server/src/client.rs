//! Outbound requests from this side to the peer.

use std::sync::Arc;
use std::time::Duration;

use duplex_core::{CloseCode, Message, Request, RequestError, Response};
use tracing::debug;

use crate::outbound::{TransmitError, Transmitter};
use crate::pending::{PendingRequests, PendingResponse};

/// Handle for sending requests to the peer and awaiting their responses.
///
/// Cheap to clone; every clone shares the connection's pending-request table.
#[derive(Clone)]
pub struct SessionClient {
    transmitter: Transmitter,
    pending: Arc<PendingRequests>,
}

impl SessionClient {
    /// Create a client over a connection's transmitter and pending table.
    pub fn new(transmitter: Transmitter, pending: Arc<PendingRequests>) -> Self {
        Self {
            transmitter,
            pending,
        }
    }

    /// Send `request` to the peer and return a future for its response.
    ///
    /// Any id already on `request` is replaced with a freshly allocated one.
    /// The table entry exists before the frame is queued.
    pub async fn send_request(&self, mut request: Request) -> Result<PendingResponse, RequestError> {
        let pending = self.pending.register()?;
        request.id = Some(pending.id());
        debug!(request_id = pending.id(), verb = %request.verb, path = %request.path, "sending request to peer");

        match self.transmitter.send_message(&Message::Request(request)).await {
            Ok(()) => Ok(pending),
            Err(err) => {
                let _ = pending.cancel();
                Err(match err {
                    TransmitError::Encode(e) => RequestError::Encode(e),
                    TransmitError::Closed | TransmitError::ReservedCode(_) => RequestError::ConnectionClosed,
                })
            }
        }
    }

    /// Send `request` and wait at most `timeout` for the response.
    pub async fn send_request_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, RequestError> {
        self.send_request(request).await?.with_timeout(timeout).await
    }

    /// Ask the transport to close the connection.
    ///
    /// Codes that only report a local condition (1005, 1006, 1015) are
    /// rejected, and long reasons are truncated to fit a close frame.
    pub fn close(&self, code: CloseCode, reason: &str) -> Result<(), TransmitError> {
        self.transmitter.close(code, reason).inspect_err(|err| {
            debug!(%code, error = %err, "close request refused");
        })
    }

    /// Whether the connection can no longer carry requests.
    pub fn is_closed(&self) -> bool {
        self.pending.is_closed() || self.transmitter.is_closed()
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
