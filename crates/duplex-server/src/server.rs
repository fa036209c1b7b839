//! `DuplexServer`: Axum HTTP server exposing the `WebSocket` upgrade route.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{Extensions, HeaderMap, Uri};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use duplex_core::Headers;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::connection::ConnectionDeps;
use crate::health::{self, HealthResponse};
use crate::session::Handshake;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::{SessionParams, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Collaborators handed to every connection.
    pub deps: ConnectionDeps,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
}

/// The duplex server.
pub struct DuplexServer {
    config: Arc<ServerConfig>,
    deps: ConnectionDeps,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl DuplexServer {
    /// Create a server; nothing is bound until [`listen`](Self::listen).
    pub fn new(config: ServerConfig, deps: ConnectionDeps) -> Self {
        Self {
            config: Arc::new(config),
            deps,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            deps: self.deps.clone(),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route(&self.config.ws_path, get(ws_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;
        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        let token = self.shutdown.token();

        info!(%local_addr, ws_path = %self.config.ws_path, "duplex server listening");
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(err) = serve.await {
                error!(error = %err, "server stopped with error");
            }
        });
        Ok((local_addr, handle))
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open `WebSocket` sessions.
    pub fn connection_count(&self) -> usize {
        self.shutdown.live_sessions()
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, state.shutdown.live_sessions()))
}

/// GET `ws_path`: upgrade and run a session.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    extensions: Extensions,
) -> impl IntoResponse {
    let handshake = Handshake {
        path: uri.path().to_owned(),
        query: uri.query().map(str::to_owned),
        headers: convert_headers(&headers),
        remote_addr: extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr),
    };
    let connection_id = format!("conn_{}", uuid::Uuid::now_v7());
    let max_message_size = state.config.max_message_size;

    ws.max_message_size(max_message_size)
        .max_frame_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let params = SessionParams {
                connection_id,
                handshake,
                deps: state.deps.clone(),
                idle_timeout: state.config.idle_timeout(),
                outbound_buffer: state.config.outbound_buffer,
                shutdown: state.shutdown.token(),
            };
            state.shutdown.track(run_ws_session(socket, params)).await;
        })
}

/// Copy the upgrade headers, skipping values that are not visible ASCII.
fn convert_headers(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_owned()).or_default().push(value.to_owned());
        }
    }
    out
}
