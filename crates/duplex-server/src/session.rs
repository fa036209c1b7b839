//! Per-connection session state handed to handlers and listeners.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};

use duplex_core::{CloseCode, Headers};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::SessionClient;

/// Authenticated identity attached to a session.
pub type Identity = Arc<dyn Any + Send + Sync>;

/// Metadata from the transport handshake (the HTTP upgrade request).
#[derive(Clone, Debug, Default)]
pub struct Handshake {
    /// Request path of the upgrade.
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: Option<String>,
    /// Upgrade request headers.
    pub headers: Headers,
    /// Peer socket address, when the transport knows it.
    pub remote_addr: Option<SocketAddr>,
}

impl Handshake {
    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    /// Value of the first `key=value` query pair named `key`.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .as_deref()?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

/// Observes the end of a session.
pub trait CloseListener: Send + Sync {
    /// Called once when the connection closes.
    fn on_close(&self, session: &SessionContext, code: CloseCode, reason: &str);
}

/// State for one connection, alive exactly as long as the connection.
pub struct SessionContext {
    connection_id: String,
    handshake: Handshake,
    identity: OnceLock<Identity>,
    client: SessionClient,
    close: Mutex<CloseNotice>,
}

#[derive(Default)]
struct CloseNotice {
    listeners: Vec<Arc<dyn CloseListener>>,
    status: Option<(CloseCode, String)>,
}

impl SessionContext {
    /// Create the context for a freshly accepted connection.
    pub fn new(connection_id: impl Into<String>, handshake: Handshake, client: SessionClient) -> Self {
        Self {
            connection_id: connection_id.into(),
            handshake,
            identity: OnceLock::new(),
            client,
            close: Mutex::new(CloseNotice::default()),
        }
    }

    /// Id of the underlying connection.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Handshake metadata the connection was opened with.
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Attach an identity. Write-once: returns `false` if one is already set.
    pub fn set_authenticated(&self, identity: Identity) -> bool {
        self.identity.set(identity).is_ok()
    }

    /// The identity, downcast to `T`.
    pub fn authenticated<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.identity.get().and_then(|identity| (**identity).downcast_ref::<T>())
    }

    /// The raw identity, if authentication produced one.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    /// Whether an identity is attached.
    pub fn is_authenticated(&self) -> bool {
        self.identity.get().is_some()
    }

    /// Handle for sending requests to the peer.
    pub fn client(&self) -> &SessionClient {
        &self.client
    }

    /// Register a listener for the end of this session.
    ///
    /// A listener added after the session closed is called immediately with
    /// the recorded close.
    pub fn add_close_listener(&self, listener: Arc<dyn CloseListener>) {
        let status = {
            let mut close = self.close.lock();
            match &close.status {
                Some(status) => status.clone(),
                None => {
                    close.listeners.push(listener);
                    return;
                }
            }
        };
        self.invoke(listener.as_ref(), status.0, &status.1);
    }

    /// Deliver the close notification to every registered listener.
    ///
    /// Only the first call has any effect. A panicking listener is logged
    /// and does not stop the others.
    pub fn notify_closed(&self, code: CloseCode, reason: &str) {
        let listeners = {
            let mut close = self.close.lock();
            if close.status.is_some() {
                return;
            }
            close.status = Some((code, reason.to_owned()));
            std::mem::take(&mut close.listeners)
        };
        debug!(connection_id = %self.connection_id, %code, listeners = listeners.len(), "session closed");
        for listener in listeners {
            self.invoke(listener.as_ref(), code, reason);
        }
    }

    /// Whether [`notify_closed`](Self::notify_closed) has run.
    pub fn is_closed(&self) -> bool {
        self.close.lock().status.is_some()
    }

    /// Code and reason the session closed with.
    pub fn close_status(&self) -> Option<(CloseCode, String)> {
        self.close.lock().status.clone()
    }

    fn invoke(&self, listener: &dyn CloseListener, code: CloseCode, reason: &str) {
        if catch_unwind(AssertUnwindSafe(|| listener.on_close(self, code, reason))).is_err() {
            warn!(connection_id = %self.connection_id, %code, "close listener panicked");
        }
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("connection_id", &self.connection_id)
            .field("authenticated", &self.is_authenticated())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
