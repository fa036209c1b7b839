//! # duplex-server
//!
//! Bidirectional request/response multiplexing over one `WebSocket`
//! connection per session. Either side may issue requests; responses are
//! correlated by request id and may arrive in any order.
//!
//! - Connection adapter: decode, dispatch, correlate, close policy
//! - Pending-request table and [`SessionClient`] for requests to the peer
//! - [`SessionContext`] with identity, outbound client and close listeners
//! - Axum upgrade route, idle timeout, `/health`, graceful shutdown

#![deny(unsafe_code)]

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod handler;
pub mod health;
pub mod listener;
pub mod outbound;
pub mod pending;
pub mod reply;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod websocket;

pub use auth::{AuthenticationError, Authenticator};
pub use client::SessionClient;
pub use config::{ConfigError, ServerConfig};
pub use connection::{ConnectionAdapter, ConnectionDeps, ConnectionError, ConnectionState};
pub use handler::{Handler, HandlerError, Reply};
pub use listener::{ConnectListener, ListenerError};
pub use pending::{PendingRequests, PendingResponse};
pub use server::DuplexServer;
pub use session::{CloseListener, Handshake, Identity, SessionContext};
