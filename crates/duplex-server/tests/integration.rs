//! End-to-end integration tests using a real WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use duplex_core::{CloseCode, JsonCodec, Message, MessageCodec, Request, RequestError, Response};
use duplex_server::{
    AuthenticationError, Authenticator, CloseListener, ConnectListener, ConnectionDeps, DuplexServer, Handler,
    HandlerError, Handshake, Identity, ListenerError, Reply, ServerConfig, SessionContext,
};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ── Collaborators ──

/// Routes used across the suite.
struct TestHandler;

#[async_trait]
impl Handler for TestHandler {
    async fn handle(&self, request: &Request, session: &Arc<SessionContext>) -> Result<Reply, HandlerError> {
        match request.path_only() {
            "/v1/ok" => Ok(Reply::ok().with_body(request.body.clone().unwrap_or_default())),
            "/v1/fail" => Err(HandlerError::failed("deliberate failure")),
            "/v1/whoami" => {
                let name = session
                    .authenticated::<String>()
                    .cloned()
                    .unwrap_or_else(|| "anonymous".into());
                Ok(Reply::ok().with_body(name.into_bytes()))
            }
            _ => Ok(Reply::not_found()),
        }
    }
}

/// Accepts `?login=<name>&password=secret`; no credentials means anonymous.
struct PasswordAuthenticator;

#[async_trait]
impl Authenticator for PasswordAuthenticator {
    async fn authenticate(&self, handshake: &Handshake) -> Result<Option<Identity>, AuthenticationError> {
        let Some(login) = handshake.query_param("login") else {
            return Ok(None);
        };
        if handshake.query_param("password") == Some("secret") {
            Ok(Some(Arc::new(login.to_owned())))
        } else {
            Err(AuthenticationError::InvalidCredentials(login.to_owned()))
        }
    }
}

type Closes = Arc<Mutex<Vec<(CloseCode, String)>>>;

/// Hands every session to the test and records how it ends.
struct SessionTap {
    sessions: mpsc::UnboundedSender<Arc<SessionContext>>,
    closes: Closes,
}

#[async_trait]
impl ConnectListener for SessionTap {
    async fn on_connect(&self, session: &Arc<SessionContext>) -> Result<(), ListenerError> {
        session.add_close_listener(Arc::new(CloseTap(Arc::clone(&self.closes))));
        let _ = self.sessions.send(Arc::clone(session));
        Ok(())
    }
}

struct CloseTap(Closes);

impl CloseListener for CloseTap {
    fn on_close(&self, _session: &SessionContext, code: CloseCode, reason: &str) {
        self.0.lock().push((code, reason.to_owned()));
    }
}

struct Tap {
    sessions: mpsc::UnboundedReceiver<Arc<SessionContext>>,
    closes: Closes,
}

fn deps_with_tap() -> (ConnectionDeps, Tap) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closes = Closes::default();
    let deps = ConnectionDeps::new(Arc::new(TestHandler))
        .with_authenticator(Arc::new(PasswordAuthenticator))
        .with_connect_listener(Arc::new(SessionTap {
            sessions: tx,
            closes: Arc::clone(&closes),
        }));
    (deps, Tap { sessions: rx, closes })
}

// ── Harness ──

/// Boot a test server and return the WS URL and the server.
async fn boot_server(deps: ConnectionDeps, config: ServerConfig) -> (String, DuplexServer) {
    let server = DuplexServer::new(config, deps);
    let (addr, _handle) = server.listen().await.unwrap();
    let ws_url = format!("ws://{addr}{}", server.config().ws_path);
    (ws_url, server)
}

async fn boot_default() -> (String, DuplexServer, Tap) {
    let (deps, tap) = deps_with_tap();
    let (url, server) = boot_server(deps, ServerConfig::default()).await;
    (url, server, tap)
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut WsStream, message: impl Into<Message>) {
    let bytes = JsonCodec.encode(&message.into()).unwrap();
    ws.send(WsMessage::Binary(bytes.into())).await.unwrap();
}

/// Read the next protocol message, skipping control frames.
async fn recv(ws: &mut WsStream) -> Message {
    loop {
        let frame = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        match frame {
            WsMessage::Binary(bytes) => return JsonCodec.decode(&bytes).unwrap(),
            WsMessage::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => {}
        }
    }
}

async fn recv_response(ws: &mut WsStream) -> Response {
    match recv(ws).await {
        Message::Response(resp) => resp,
        other => panic!("expected response, got {other:?}"),
    }
}

async fn recv_request(ws: &mut WsStream) -> Request {
    match recv(ws).await {
        Message::Request(req) => req,
        other => panic!("expected request, got {other:?}"),
    }
}

/// Read until the server's close frame and return its code and reason.
///
/// Keeps reading afterwards so the client's close reply gets flushed.
async fn recv_close(ws: &mut WsStream) -> (u16, String) {
    let close = loop {
        let frame = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream ended before close frame")
            .expect("ws error");
        if let WsMessage::Close(frame) = frame {
            let frame = frame.expect("close frame without code");
            break (u16::from(frame.code), frame.reason.to_string());
        }
    };
    while let Ok(Some(Ok(_))) = timeout(TIMEOUT, ws.next()).await {}
    close
}

async fn next_session(tap: &mut Tap) -> Arc<SessionContext> {
    timeout(TIMEOUT, tap.sessions.recv())
        .await
        .expect("timeout waiting for session")
        .expect("tap closed")
}

// ── Inbound requests ──

#[tokio::test]
async fn request_with_id_gets_correlated_response() {
    let (url, _server, _tap) = boot_default().await;
    let mut ws = connect(&url).await;

    send(&mut ws, Request::new("GET", "/v1/ok").with_id(7).with_body(b"hi".to_vec())).await;

    let resp = recv_response(&mut ws).await;
    assert_eq!(resp.request_id, 7);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body.as_deref(), Some(b"hi".as_slice()));
}

#[tokio::test]
async fn fire_and_forget_failure_sends_nothing_and_keeps_connection() {
    let (url, _server, _tap) = boot_default().await;
    let mut ws = connect(&url).await;

    send(&mut ws, Request::new("PUT", "/v1/fail")).await;
    send(&mut ws, Request::new("GET", "/v1/ok").with_id(8)).await;

    // The only frame the server sends is the answer to request 8.
    let resp = recv_response(&mut ws).await;
    assert_eq!(resp.request_id, 8);
    assert_eq!(resp.status, 200);
}

#[tokio::test]
async fn handler_failure_returns_500() {
    let (url, _server, _tap) = boot_default().await;
    let mut ws = connect(&url).await;

    send(&mut ws, Request::new("GET", "/v1/fail").with_id(3)).await;
    let resp = recv_response(&mut ws).await;
    assert_eq!((resp.request_id, resp.status), (3, 500));
    assert_eq!(resp.message, "Error response");

    // Still open.
    send(&mut ws, Request::new("GET", "/v1/ok").with_id(4)).await;
    assert_eq!(recv_response(&mut ws).await.request_id, 4);
}

#[tokio::test]
async fn text_frames_are_ignored() {
    let (url, _server, _tap) = boot_default().await;
    let mut ws = connect(&url).await;

    ws.send(WsMessage::Text("hello".into())).await.unwrap();
    send(&mut ws, Request::new("GET", "/v1/ok").with_id(1)).await;
    assert_eq!(recv_response(&mut ws).await.request_id, 1);
}

#[tokio::test]
async fn malformed_payload_closes_1018() {
    let (url, _server, mut tap) = boot_default().await;
    let mut ws = connect(&url).await;
    let _session = next_session(&mut tap).await;

    ws.send(WsMessage::Binary(b"\x00\x01 not a message".to_vec().into()))
        .await
        .unwrap();

    assert_eq!(recv_close(&mut ws).await, (1018, "Badly formatted".to_string()));
}

// ── Authentication ──

#[tokio::test]
async fn auth_failure_closes_1011_without_listener() {
    let (url, _server, mut tap) = boot_default().await;
    let mut ws = connect(&format!("{url}?login=alice&password=wrong")).await;

    assert_eq!(recv_close(&mut ws).await, (1011, "Server error".to_string()));
    assert!(tap.sessions.try_recv().is_err());
    assert!(tap.closes.lock().is_empty());
}

#[tokio::test]
async fn authenticated_identity_reaches_handler() {
    let (url, _server, mut tap) = boot_default().await;
    let mut ws = connect(&format!("{url}?login=alice&password=secret")).await;

    let session = next_session(&mut tap).await;
    assert_eq!(session.authenticated::<String>().map(String::as_str), Some("alice"));
    assert_eq!(session.handshake().query_param("login"), Some("alice"));
    assert!(session.handshake().remote_addr.is_some());

    send(&mut ws, Request::new("GET", "/v1/whoami").with_id(1)).await;
    assert_eq!(recv_response(&mut ws).await.body.as_deref(), Some(b"alice".as_slice()));
}

#[tokio::test]
async fn anonymous_session_without_credentials() {
    let (url, _server, mut tap) = boot_default().await;
    let mut ws = connect(&url).await;
    assert!(!next_session(&mut tap).await.is_authenticated());

    send(&mut ws, Request::new("GET", "/v1/whoami").with_id(1)).await;
    assert_eq!(recv_response(&mut ws).await.body.as_deref(), Some(b"anonymous".as_slice()));
}

// ── Requests from the server to the peer ──

#[tokio::test]
async fn server_requests_resolve_out_of_order() {
    let (url, _server, mut tap) = boot_default().await;
    let mut ws = connect(&url).await;
    let session = next_session(&mut tap).await;
    let client = session.client().clone();

    let first = client.send_request(Request::new("GET", "/v1/peer/a")).await.unwrap();
    let second = client.send_request(Request::new("GET", "/v1/peer/b")).await.unwrap();

    let req_a = recv_request(&mut ws).await;
    let req_b = recv_request(&mut ws).await;
    assert_eq!(req_a.path, "/v1/peer/a");
    assert_eq!(req_b.path, "/v1/peer/b");
    assert_ne!(req_a.id, req_b.id);

    send(&mut ws, Response::new(req_b.id.unwrap(), 200, "b")).await;
    send(&mut ws, Response::new(req_a.id.unwrap(), 202, "a")).await;

    let resp_a = timeout(TIMEOUT, first).await.unwrap().unwrap();
    let resp_b = timeout(TIMEOUT, second).await.unwrap().unwrap();
    assert_eq!((resp_a.status, resp_a.message.as_str()), (202, "a"));
    assert_eq!((resp_b.status, resp_b.message.as_str()), (200, "b"));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn peer_close_fails_pending_server_requests() {
    let (url, _server, mut tap) = boot_default().await;
    let mut ws = connect(&url).await;
    let session = next_session(&mut tap).await;
    let client = session.client().clone();

    let waiters = vec![
        client.send_request(Request::new("GET", "/v1/peer/1")).await.unwrap(),
        client.send_request(Request::new("GET", "/v1/peer/2")).await.unwrap(),
    ];
    let _ = recv_request(&mut ws).await;
    let _ = recv_request(&mut ws).await;

    ws.close(None).await.unwrap();

    for waiter in waiters {
        assert_matches!(
            timeout(TIMEOUT, waiter).await.unwrap(),
            Err(RequestError::ConnectionClosed)
        );
    }
    assert!(session.is_closed());
    assert_eq!(tap.closes.lock().len(), 1);
    assert_matches!(
        client.send_request(Request::new("GET", "/late")).await,
        Err(RequestError::ConnectionClosed)
    );
}

#[tokio::test]
async fn close_listener_sees_peer_close_code() {
    let (url, _server, mut tap) = boot_default().await;
    let mut ws = connect(&url).await;
    let session = next_session(&mut tap).await;

    ws.close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
        code: 4000.into(),
        reason: "client done".into(),
    }))
    .await
    .unwrap();
    while let Ok(Some(Ok(_))) = timeout(TIMEOUT, ws.next()).await {}

    timeout(TIMEOUT, async {
        while !session.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*tap.closes.lock(), vec![(CloseCode(4000), "client done".to_string())]);
}

// ── Lifecycle ──

#[tokio::test]
async fn idle_connection_closes_1001() {
    let (deps, _tap) = deps_with_tap();
    let config = ServerConfig {
        idle_timeout_secs: 1,
        ..ServerConfig::default()
    };
    let (url, _server) = boot_server(deps, config).await;
    let mut ws = connect(&url).await;

    assert_eq!(recv_close(&mut ws).await, (1001, "Idle timeout".to_string()));
}

#[tokio::test]
async fn outbound_traffic_keeps_connection_alive() {
    let (deps, mut tap) = deps_with_tap();
    let config = ServerConfig {
        idle_timeout_secs: 1,
        ..ServerConfig::default()
    };
    let (url, _server) = boot_server(deps, config).await;
    let mut ws = connect(&url).await;
    let session = next_session(&mut tap).await;

    // The peer only reads; server requests every 400ms span well past the timeout.
    for i in 0..6 {
        let _pending = session
            .client()
            .send_request(Request::new("GET", format!("/v1/tick/{i}")))
            .await
            .unwrap();
        assert_eq!(recv_request(&mut ws).await.path, format!("/v1/tick/{i}"));
        tokio::time::sleep(Duration::from_millis(400)).await;
    }

    assert_eq!(recv_close(&mut ws).await, (1001, "Idle timeout".to_string()));
}

#[tokio::test]
async fn shutdown_closes_sessions_1001() {
    let (url, server, mut tap) = boot_default().await;
    let mut ws = connect(&url).await;
    let _session = next_session(&mut tap).await;
    assert_eq!(server.connection_count(), 1);

    let shutdown = Arc::clone(server.shutdown());
    let drained = tokio::spawn(async move { shutdown.graceful_shutdown(Some(TIMEOUT)).await });

    assert_eq!(recv_close(&mut ws).await, (1001, "Server shutting down".to_string()));
    assert!(drained.await.unwrap());
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn shutdown_ends_session_whose_peer_stopped_reading() {
    let (url, server, mut tap) = boot_default().await;
    let _ws = connect(&url).await;
    let session = next_session(&mut tap).await;

    // Fill the socket and the outbound queue; the client never reads.
    let client = session.client().clone();
    let flood = tokio::spawn(async move {
        let body = vec![b'x'; 1024 * 1024];
        for i in 0..32 {
            let request = Request::new("PUT", format!("/v1/bulk/{i}")).with_body(body.clone());
            if client.send_request(request).await.is_err() {
                break;
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let drained = server.shutdown().graceful_shutdown(Some(Duration::from_secs(20))).await;
    assert!(drained);
    assert_eq!(server.connection_count(), 0);
    assert_eq!(
        *tap.closes.lock(),
        vec![(CloseCode::GOING_AWAY, "Server shutting down".to_string())]
    );
    assert!(session.client().is_closed());
    flood.abort();
}

#[tokio::test]
async fn custom_ws_path() {
    let (deps, _tap) = deps_with_tap();
    let config = ServerConfig {
        ws_path: "/v1/websocket/".into(),
        ..ServerConfig::default()
    };
    let (url, _server) = boot_server(deps, config).await;
    assert!(url.ends_with("/v1/websocket/"));

    let mut ws = connect(&url).await;
    send(&mut ws, Request::new("GET", "/v1/ok").with_id(5)).await;
    assert_eq!(recv_response(&mut ws).await.request_id, 5);
}
