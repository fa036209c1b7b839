//! Where a handler's reply goes, decided once per inbound request.

use duplex_core::{Message, Request};

use crate::handler::Reply;
use crate::outbound::{TransmitError, Transmitter};

/// Status sent when servicing a request fails.
pub const ERROR_STATUS: u16 = 500;
/// Message sent with [`ERROR_STATUS`].
pub const ERROR_MESSAGE: &str = "Error response";

/// Reply strategy for one inbound request.
#[derive(Clone)]
pub enum ReplySink {
    /// Frame replies as responses carrying `request_id` and send them.
    Correlated {
        /// Id copied from the request.
        request_id: u64,
        /// Connection the response is written to.
        transmitter: Transmitter,
    },
    /// The peer asked for no reply; everything is dropped.
    Discard,
}

impl ReplySink {
    /// Pick the strategy for `request`.
    pub fn for_request(request: &Request, transmitter: &Transmitter) -> Self {
        match request.id {
            Some(request_id) => Self::Correlated {
                request_id,
                transmitter: transmitter.clone(),
            },
            None => Self::Discard,
        }
    }

    /// Correlation id, when a reply is expected.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Correlated { request_id, .. } => Some(*request_id),
            Self::Discard => None,
        }
    }

    /// Deliver `reply`.
    pub async fn send(self, reply: Reply) -> Result<(), TransmitError> {
        match self {
            Self::Correlated {
                request_id,
                transmitter,
            } => {
                transmitter
                    .send_message(&Message::Response(reply.into_response(request_id)))
                    .await
            }
            Self::Discard => Ok(()),
        }
    }

    /// Deliver the generic server-error reply.
    pub async fn send_error(self) -> Result<(), TransmitError> {
        self.send(Reply::new(ERROR_STATUS, ERROR_MESSAGE)).await
    }
}
