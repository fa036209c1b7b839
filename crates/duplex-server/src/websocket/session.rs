//! `WebSocket` session lifecycle: drives a [`ConnectionAdapter`] from
//! upgrade through disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use duplex_core::CloseCode;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::connection::{ConnectionAdapter, ConnectionDeps, ConnectionState};
use crate::outbound::{self, FrameReceiver, Outbound};
use crate::session::Handshake;

/// How long to wait for the peer to answer our close frame.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a session needs besides the socket.
pub struct SessionParams {
    /// Connection id used in logs and by the session context.
    pub connection_id: String,
    /// Upgrade request metadata.
    pub handshake: Handshake,
    /// Shared collaborators.
    pub deps: ConnectionDeps,
    /// Close after this long without a frame in either direction.
    pub idle_timeout: Duration,
    /// Capacity of the outbound frame queue.
    pub outbound_buffer: usize,
    /// Fires when the server is shutting down.
    pub shutdown: CancellationToken,
}

/// Run one `WebSocket` session to completion.
///
/// 1. Authenticates and opens the session
/// 2. Feeds binary frames to the adapter; text frames are ignored
/// 3. Writes queued responses, requests and close frames from a separate task
/// 4. Closes with 1001 on idle timeout or server shutdown; frames in either
///    direction count as activity
/// 5. Reports the final close to the adapter
#[instrument(skip_all, fields(conn_id = %params.connection_id))]
pub async fn run_ws_session(ws: WebSocket, params: SessionParams) {
    let SessionParams {
        connection_id,
        handshake,
        deps,
        idle_timeout,
        outbound_buffer,
        shutdown,
    } = params;

    let (ws_tx, mut ws_rx) = ws.split();
    let (frame_tx, frame_rx) = outbound::channel(outbound_buffer);
    let stop_writer = CancellationToken::new();
    let wrote = Arc::new(Notify::new());
    let mut writer = tokio::spawn(write_frames(ws_tx, frame_rx, Arc::clone(&wrote), stop_writer.clone()));

    let connection_start = Instant::now();
    counter!("duplex_connections_total").increment(1);
    gauge!("duplex_connections_active").increment(1.0);

    let mut adapter = ConnectionAdapter::new(connection_id, deps, frame_tx);
    if let Err(err) = adapter.on_connect(handshake).await {
        debug!(error = %err, "session refused");
    }

    let mut shutting_down = false;
    let (code, reason) = loop {
        let wait = if adapter.state() == ConnectionState::Closing {
            CLOSE_HANDSHAKE_TIMEOUT
        } else {
            idle_timeout
        };

        let next = tokio::select! {
            () = shutdown.cancelled(), if !shutting_down => {
                shutting_down = true;
                adapter.close_with_reason(CloseCode::GOING_AWAY, "Server shutting down");
                continue;
            }
            // Outbound traffic restarts the idle timer.
            () = wrote.notified(), if adapter.state() == ConnectionState::Open => continue,
            next = tokio::time::timeout(wait, ws_rx.next()) => next,
        };

        match next {
            Err(_elapsed) if adapter.state() == ConnectionState::Closing => {
                debug!("peer did not answer close frame");
                break final_close(&adapter);
            }
            Err(_elapsed) => {
                info!(idle_secs = idle_timeout.as_secs(), "idle timeout");
                adapter.close_with_reason(CloseCode::GOING_AWAY, "Idle timeout");
            }
            Ok(None) => {
                debug!("stream ended without close frame");
                break final_close(&adapter);
            }
            Ok(Some(Err(err))) => {
                adapter.on_transport_error(&err);
                break final_close(&adapter);
            }
            Ok(Some(Ok(frame))) => match frame {
                WsMessage::Binary(data) => {
                    // Fatal errors have already closed the connection.
                    let _ = adapter.on_message(&data);
                }
                WsMessage::Text(text) => {
                    debug!(len = text.as_str().len(), "ignoring text frame");
                }
                WsMessage::Close(frame) => {
                    break match frame {
                        Some(frame) => (CloseCode(frame.code), frame.reason.to_string()),
                        None => (CloseCode::NO_STATUS, String::new()),
                    };
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            },
        }
    };

    adapter.on_close(code, &reason);
    drop(adapter);

    stop_writer.cancel();
    if tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    gauge!("duplex_connections_active").decrement(1.0);
    histogram!("duplex_connection_duration_seconds").record(connection_start.elapsed().as_secs_f64());
}

/// Close code and reason to report when the peer never sent a close frame.
fn final_close(adapter: &ConnectionAdapter) -> (CloseCode, String) {
    adapter.requested_close().map_or_else(
        || (CloseCode::ABNORMAL, CloseCode::ABNORMAL.default_reason().to_owned()),
        |(code, reason)| (code, reason.to_owned()),
    )
}

/// Drain queued frames onto the socket until a close frame, a write error,
/// or `stop`. Signals `wrote` after every frame written.
async fn write_frames(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut frames: FrameReceiver,
    wrote: Arc<Notify>,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = frames.recv() => frame,
            () = stop.cancelled() => None,
        };
        let Some(frame) = frame else { break };

        let (message, last) = match frame {
            Outbound::Payload(bytes) => (WsMessage::Binary(bytes.into()), false),
            Outbound::Close { code, reason } => {
                debug!(%code, reason, "sending close frame");
                let frame = CloseFrame {
                    code: code.as_u16(),
                    reason: reason.into(),
                };
                (WsMessage::Close(Some(frame)), true)
            }
        };
        if let Err(err) = sink.send(message).await {
            debug!(error = %err, "write failed");
            break;
        }
        wrote.notify_one();
        if last {
            break;
        }
    }
    let _ = sink.close().await;
}
