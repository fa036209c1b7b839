//! Protocol engine for one physical connection.
//!
//! The transport feeds [`ConnectionAdapter`] four kinds of events, serialized
//! per connection: connect, inbound payload, transport error and close. The
//! adapter decodes payloads, hands requests to the local [`Handler`], matches
//! responses to pending outbound requests and decides when the connection
//! must be torn down.
//!
//! ```text
//! Connecting ──on_connect──▶ Open ──close()──▶ Closing ──on_close──▶ Closed
//!      │                                                   ▲
//!      └──────────── auth / listener failure ──────────────┘
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use duplex_core::{CloseCode, DecodeError, JsonCodec, Message, MessageCodec, Request, Response};
use futures::FutureExt;
use metrics::counter;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::auth::{AuthenticationError, Authenticator};
use crate::client::SessionClient;
use crate::handler::{Handler, HandlerError};
use crate::listener::{ConnectListener, ListenerError};
use crate::outbound::{FrameSender, Transmitter};
use crate::pending::PendingRequests;
use crate::reply::ReplySink;
use crate::session::{Handshake, SessionContext};

/// Lifecycle state of a connection. There is no way back from `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted; authentication and listeners not yet run.
    Connecting,
    /// Exchanging messages.
    Open,
    /// A close was requested locally; waiting for the transport to finish.
    Closing,
    /// Terminal.
    Closed,
}

/// Failure that terminated, or was refused by, a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The authenticator rejected the handshake.
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthenticationError),
    /// The connect listener failed.
    #[error(transparent)]
    Listener(#[from] ListenerError),
    /// An inbound payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// An inbound payload was neither a request nor a response.
    #[error("unknown message kind: {0}")]
    UnknownKind(String),
    /// The event is not valid in the current state.
    #[error("invalid in state {0:?}")]
    InvalidState(ConnectionState),
}

impl ConnectionError {
    /// Close code sent to the peer for this failure.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Decode(_) | Self::UnknownKind(_) => CloseCode::BADLY_FORMATTED,
            Self::Authentication(_) | Self::Listener(_) | Self::InvalidState(_) => CloseCode::SERVER_ERROR,
        }
    }
}

/// Pluggable collaborators shared by every connection of a server.
#[derive(Clone)]
pub struct ConnectionDeps {
    /// Services inbound requests.
    pub handler: Arc<dyn Handler>,
    /// Wire codec.
    pub codec: Arc<dyn MessageCodec>,
    /// Optional handshake verification.
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Optional session-start observer.
    pub connect_listener: Option<Arc<dyn ConnectListener>>,
}

impl ConnectionDeps {
    /// Dependencies with the JSON codec and no authenticator or listener.
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            codec: Arc::new(JsonCodec),
            authenticator: None,
            connect_listener: None,
        }
    }

    /// Replace the codec.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Authenticate every handshake.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Observe every session start.
    #[must_use]
    pub fn with_connect_listener(mut self, listener: Arc<dyn ConnectListener>) -> Self {
        self.connect_listener = Some(listener);
        self
    }
}

/// Drives one connection from accept to close.
pub struct ConnectionAdapter {
    id: String,
    deps: ConnectionDeps,
    state: ConnectionState,
    transmitter: Transmitter,
    pending: Arc<PendingRequests>,
    context: Option<Arc<SessionContext>>,
    requested_close: Option<(CloseCode, String)>,
    in_flight: JoinSet<()>,
}

impl ConnectionAdapter {
    /// Create an adapter writing to `outbound`.
    pub fn new(id: impl Into<String>, deps: ConnectionDeps, outbound: FrameSender) -> Self {
        let transmitter = Transmitter::new(outbound, Arc::clone(&deps.codec));
        Self {
            id: id.into(),
            deps,
            state: ConnectionState::Connecting,
            transmitter,
            pending: PendingRequests::new(),
            context: None,
            requested_close: None,
            in_flight: JoinSet::new(),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Session context, once constructed.
    pub fn context(&self) -> Option<&Arc<SessionContext>> {
        self.context.as_ref()
    }

    /// Code and reason of a locally requested close, if any.
    pub fn requested_close(&self) -> Option<(CloseCode, &str)> {
        self.requested_close
            .as_ref()
            .map(|(code, reason)| (*code, reason.as_str()))
    }

    /// Outbound requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Authenticate, build the session context and notify the connect listener.
    ///
    /// Any failure closes the connection with 1011. An authentication failure
    /// happens before the context exists, so no listener ever hears of it.
    pub async fn on_connect(&mut self, handshake: Handshake) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Connecting {
            return Err(ConnectionError::InvalidState(self.state));
        }
        debug!(authenticating = self.deps.authenticator.is_some(), path = %handshake.path, "connection accepted");

        let authenticator = self.deps.authenticator.clone();
        let identity = match authenticator {
            Some(authenticator) => match authenticator.authenticate(&handshake).await {
                Ok(identity) => identity,
                Err(err) => {
                    warn!(error = %err, "authentication failed");
                    counter!("duplex_auth_failures_total").increment(1);
                    self.close(CloseCode::SERVER_ERROR);
                    return Err(err.into());
                }
            },
            None => None,
        };

        let client = SessionClient::new(self.transmitter.clone(), Arc::clone(&self.pending));
        let context = Arc::new(SessionContext::new(self.id.clone(), handshake, client));
        if let Some(identity) = identity {
            let _ = context.set_authenticated(identity);
        }
        self.context = Some(Arc::clone(&context));

        if let Some(listener) = self.deps.connect_listener.clone() {
            if let Err(err) = listener.on_connect(&context).await {
                warn!(error = %err, "connect listener failed");
                self.close(CloseCode::SERVER_ERROR);
                return Err(err.into());
            }
        }

        self.state = ConnectionState::Open;
        info!(authenticated = context.is_authenticated(), "connection open");
        Ok(())
    }

    /// Process one inbound payload.
    ///
    /// Requests are handed to the handler on their own task so the inbound
    /// path never waits on a handler. Responses are matched inline.
    pub fn on_message(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Open {
            debug!(state = ?self.state, len = payload.len(), "dropping message on connection that is not open");
            return Ok(());
        }
        self.reap_finished();

        let message = match self.deps.codec.decode(payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "failed to decode inbound message");
                self.close(CloseCode::BADLY_FORMATTED);
                return Err(err.into());
            }
        };

        match message {
            Message::Request(request) => {
                self.dispatch_request(request);
                Ok(())
            }
            Message::Response(response) => {
                self.handle_response(response);
                Ok(())
            }
            Message::Unknown { kind } => {
                debug!(kind, "unknown message kind");
                self.close(CloseCode::BADLY_FORMATTED);
                Err(ConnectionError::UnknownKind(kind))
            }
        }
    }

    /// Any transport error closes the connection with 1011.
    pub fn on_transport_error(&mut self, cause: &dyn std::fmt::Display) {
        debug!(error = %cause, "transport error");
        counter!("duplex_transport_errors_total").increment(1);
        self.close(CloseCode::SERVER_ERROR);
    }

    /// The transport has closed.
    ///
    /// Notifies close listeners, then fails every pending outbound request
    /// with a closed-connection error. A no-op for listeners when the session
    /// context was never built.
    pub fn on_close(&mut self, code: CloseCode, reason: &str) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.in_flight.abort_all();

        if let Some(context) = &self.context {
            context.notify_closed(code, reason);
        }
        let failed = self.pending.fail_all();
        counter!("duplex_connections_closed_total", "code" => code.to_string()).increment(1);
        info!(%code, reason, failed_requests = failed, "connection closed");
    }

    /// Request a close with `code` and its standard reason.
    pub fn close(&mut self, code: CloseCode) {
        self.close_with_reason(code, code.default_reason());
    }

    /// Request a close. Has no effect once closing has started.
    ///
    /// Never waits on the outbound queue.
    pub fn close_with_reason(&mut self, code: CloseCode, reason: &str) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        if let Err(err) = self.transmitter.close(code, reason) {
            debug!(%code, error = %err, "close frame not queued");
        }
        self.state = ConnectionState::Closing;
        self.requested_close = Some((code, CloseCode::truncate_reason(reason).to_owned()));
    }

    /// Wait for every in-flight request to finish.
    pub async fn join_in_flight(&mut self) {
        while self.in_flight.join_next().await.is_some() {}
    }

    fn reap_finished(&mut self) {
        while self.in_flight.try_join_next().is_some() {}
    }

    fn dispatch_request(&mut self, request: Request) {
        let Some(session) = self.context.clone() else {
            return;
        };
        let sink = ReplySink::for_request(&request, &self.transmitter);
        let reply = if sink.request_id().is_some() { "correlated" } else { "none" };
        counter!("duplex_requests_total", "reply" => reply).increment(1);

        let span = info_span!(
            "request",
            verb = %request.verb,
            path = %request.path_only(),
            request_id = ?request.id,
        );
        let handler = Arc::clone(&self.deps.handler);
        let _ = self
            .in_flight
            .spawn(service_request(handler, request, session, sink).instrument(span));
    }

    fn handle_response(&self, response: Response) {
        let request_id = response.request_id;
        if self.pending.complete(response) {
            counter!("duplex_responses_total", "matched" => "true").increment(1);
        } else {
            debug!(request_id, "discarding response with no pending request");
            counter!("duplex_responses_total", "matched" => "false").increment(1);
        }
    }
}

/// Run the handler for one request and deliver its outcome through `sink`.
async fn service_request(
    handler: Arc<dyn Handler>,
    request: Request,
    session: Arc<SessionContext>,
    sink: ReplySink,
) {
    let outcome = AssertUnwindSafe(handler.handle(&request, &session))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))));

    let failure = match outcome {
        Ok(reply) => match sink.clone().send(reply).await {
            Ok(()) => return,
            Err(err) => err.to_string(),
        },
        Err(err) => err.to_string(),
    };

    counter!("duplex_request_failures_total").increment(1);
    match sink.request_id() {
        Some(request_id) => {
            warn!(request_id, error = %failure, "request failed, sending error response");
            if let Err(err) = sink.send_error().await {
                debug!(error = %err, "could not send error response");
            }
        }
        None => warn!(error = %failure, "fire-and-forget request failed"),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}
