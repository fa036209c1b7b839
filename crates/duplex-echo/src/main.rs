//! # duplex-echo
//!
//! Small server speaking the duplex protocol. Useful for poking at a client
//! implementation by hand.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use duplex_core::Request;
use duplex_server::config::{ServerConfig, load_config_from_path};
use duplex_server::{ConnectionDeps, DuplexServer, Handler, HandlerError, Reply, SessionContext};

/// How long `/v1/callback` waits for the peer.
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Duplex echo server.
#[derive(Parser, Debug)]
#[command(name = "duplex-echo", about = "Echo server for the duplex protocol")]
struct Cli {
    /// JSON config file (missing file means defaults).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides config).
    #[arg(long)]
    port: Option<u16>,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

/// Routes:
/// - `GET /v1/ping` replies `pong`
/// - `PUT /v1/echo` replies with the request body
/// - `POST /v1/callback` asks the peer `GET /v1/ping` and relays its status
struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, request: &Request, session: &Arc<SessionContext>) -> Result<Reply, HandlerError> {
        match (request.verb.as_str(), request.path_only()) {
            ("GET", "/v1/ping") => Ok(Reply::ok().with_body(b"pong".to_vec())),
            ("PUT", "/v1/echo") => {
                let mut reply = Reply::ok().with_body(request.body.clone().unwrap_or_default());
                if let Some(content_type) = request.header("content-type") {
                    reply = reply.with_header("Content-Type", content_type);
                }
                Ok(reply)
            }
            ("POST", "/v1/callback") => {
                let response = session
                    .client()
                    .send_request_timeout(Request::new("GET", "/v1/ping"), CALLBACK_TIMEOUT)
                    .await
                    .map_err(|e| HandlerError::failed(format!("peer callback failed: {e}")))?;
                Ok(Reply::ok().with_body(response.status.to_string().into_bytes()))
            }
            _ => Ok(Reply::not_found()),
        }
    }
}

fn resolve_config(args: &Cli) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => load_config_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let mut config = ServerConfig::default();
            duplex_server::config::apply_env_overrides(&mut config);
            config
        }
    };
    if let Some(host) = &args.host {
        config.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    if args.json_logs {
        duplex_core::logging::init_json_subscriber(&args.log_level);
    } else {
        duplex_core::logging::init_subscriber(&args.log_level);
    }

    let config = resolve_config(&args)?;
    let server = DuplexServer::new(config, ConnectionDeps::new(Arc::new(EchoHandler)));
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("duplex-echo listening on ws://{addr}{}", server.config().ws_path);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !server.shutdown().graceful_shutdown(None).await {
        tracing::warn!("some sessions did not close in time");
    }
    let _ = handle.await;
    tracing::info!("Shutdown complete");
    Ok(())
}
