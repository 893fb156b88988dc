//! Integration tests for the WebSocket gateway.
//!
//! These tests run a real gateway on an ephemeral port and talk to it with a
//! tungstenite client: authentication, registration, delivery, replacement
//! and shutdown.
//!
//! Tests CAN use `.unwrap()` and `.expect()`; the panic-free behavior of
//! production code is tested through assertions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use relay_protocol::Envelope;
use relayd::config::{AuthConfig, GatewayConfig};
use relayd::gateway::Gateway;
use relayd::registry::{issue_token, ClientRegistry, SHUTDOWN_REASON, SUPERSEDED_REASON};
use relayd::service::Service;

// ============================================================================
// Constants
// ============================================================================

const SECRET: &str = "integration-secret";

/// Maximum time to wait for a frame or a registry change
const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between registry checks
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Test Helpers
// ============================================================================

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Gateway running on an ephemeral port.
struct TestServer {
    gateway: Arc<Gateway>,
    addr: SocketAddr,
}

impl TestServer {
    async fn spawn() -> Self {
        let config = GatewayConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let auth = AuthConfig {
            secret: SECRET.to_string(),
            ..AuthConfig::default()
        };

        let gateway = Arc::new(Gateway::new(config, &auth));
        gateway.setup().await.expect("gateway setup");
        let addr = gateway.local_addr().expect("bound address");

        let runner = Arc::clone(&gateway);
        tokio::spawn(async move {
            let _ = runner.run().await;
        });

        Self { gateway, addr }
    }

    fn registry(&self) -> Arc<ClientRegistry> {
        self.gateway.registry()
    }

    /// Connects with an `Authorization` header built from `header`.
    async fn connect_with_header(&self, header: Option<String>) -> Client {
        let mut request = format!("ws://{}/", self.addr)
            .into_client_request()
            .unwrap();
        if let Some(value) = header {
            request
                .headers_mut()
                .insert("authorization", value.parse().unwrap());
        }

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .expect("WebSocket should upgrade");
        ws
    }

    /// Connects as `identity` and waits until the registry lists it.
    async fn connect_as(&self, identity: &str) -> Client {
        let token = issue_token(identity, SECRET, None).unwrap();
        let ws = self.connect_with_header(Some(format!("Bearer {token}"))).await;
        let registry = self.registry();
        wait_for(|| registry.contains(identity)).await;
        ws
    }

    async fn shutdown(self) {
        self.gateway.stop().await.unwrap();
        self.registry().close_all().await;
        self.gateway.wait_connections(WAIT_TIMEOUT).await;
    }
}

async fn wait_for(condition: impl Fn() -> bool) {
    let start = tokio::time::Instant::now();
    while start.elapsed() < WAIT_TIMEOUT {
        if condition() {
            return;
        }
        sleep(POLL_INTERVAL).await;
    }
    panic!("condition not met within {WAIT_TIMEOUT:?}");
}

async fn next_frame(ws: &mut Client) -> Message {
    timeout(WAIT_TIMEOUT, ws.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended")
        .expect("websocket error")
}

async fn next_payload(ws: &mut Client) -> String {
    match next_frame(ws).await {
        Message::Text(text) => {
            let envelope: Envelope = serde_json::from_str(text.as_str()).unwrap();
            assert!(envelope.timestamp().is_some(), "dt should be RFC 3339");
            envelope.payload
        }
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn expect_close(ws: &mut Client, code: CloseCode, reason: &str) {
    match next_frame(ws).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, code);
            assert_eq!(frame.reason.as_str(), reason);
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

/// Asserts nothing arrives within a short window.
async fn expect_silence(ws: &mut Client) {
    let result = timeout(Duration::from_millis(200), ws.next()).await;
    assert!(result.is_err(), "expected no frame, got {result:?}");
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_missing_token_rejected() {
    let server = TestServer::spawn().await;

    let mut ws = server.connect_with_header(None).await;
    expect_close(&mut ws, CloseCode::Policy, "authentication token is not provided").await;

    assert!(server.registry().is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn test_blank_bearer_rejected() {
    let server = TestServer::spawn().await;

    let mut ws = server.connect_with_header(Some("Bearer ".to_string())).await;
    expect_close(&mut ws, CloseCode::Policy, "authentication token is not provided").await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_wrong_secret_rejected() {
    let server = TestServer::spawn().await;
    let token = issue_token("mallory", "not-the-secret", None).unwrap();

    let mut ws = server
        .connect_with_header(Some(format!("Bearer {token}")))
        .await;
    match next_frame(&mut ws).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Policy);
            assert!(
                frame.reason.as_str().starts_with("authentication failed: "),
                "unexpected reason {:?}",
                frame.reason
            );
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    assert!(!server.registry().contains("mallory"));
    server.shutdown().await;
}

#[tokio::test]
async fn test_expired_token_rejected() {
    let server = TestServer::spawn().await;
    let past = jsonwebtoken::get_current_timestamp() - 3600;
    let token = issue_token("alice", SECRET, Some(past)).unwrap();

    let mut ws = server.connect_with_header(Some(token)).await;
    expect_close(
        &mut ws,
        CloseCode::Policy,
        "authentication failed: token has expired",
    )
    .await;

    server.shutdown().await;
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_authenticated_client_receives_broadcast() {
    let server = TestServer::spawn().await;
    let mut alice = server.connect_as("alice").await;
    let mut bob = server.connect_as("bob").await;

    let report = server.registry().broadcast("ping").await;
    assert_eq!(report.attempted, 2);

    assert_eq!(next_payload(&mut alice).await, "ping");
    assert_eq!(next_payload(&mut bob).await, "ping");

    server.shutdown().await;
}

#[tokio::test]
async fn test_targeted_send_reaches_only_target() {
    let server = TestServer::spawn().await;
    let mut alice = server.connect_as("alice").await;
    let mut bob = server.connect_as("bob").await;

    server.registry().targeted_send("hi bob", "bob").await;
    server.registry().targeted_send("nobody home", "carol").await;

    assert_eq!(next_payload(&mut bob).await, "hi bob");
    expect_silence(&mut alice).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_inbound_frames_are_ignored() {
    let server = TestServer::spawn().await;
    let mut alice = server.connect_as("alice").await;

    alice.send(Message::text("hello server")).await.unwrap();
    alice.send(Message::binary(vec![1, 2, 3])).await.unwrap();

    server.registry().broadcast("still here").await;
    assert_eq!(next_payload(&mut alice).await, "still here");
    assert!(server.registry().contains("alice"));

    server.shutdown().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_disconnect_unregisters() {
    let server = TestServer::spawn().await;
    let mut alice = server.connect_as("alice").await;

    alice.close(None).await.unwrap();

    // The server answers with its own close frame, then ends the stream
    assert!(matches!(next_frame(&mut alice).await, Message::Close(_)));
    let end = timeout(WAIT_TIMEOUT, alice.next())
        .await
        .expect("stream should end after the close handshake");
    assert!(end.is_none(), "expected end of stream, got {end:?}");

    let registry = server.registry();
    wait_for(|| !registry.contains("alice")).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_close_with_reason_is_echoed() {
    let server = TestServer::spawn().await;
    let mut bob = server.connect_as("bob").await;
    bob.send(Message::Close(Some(CloseFrame {
        code: CloseCode::Away,
        reason: "going offline".into(),
    })))
    .await
    .unwrap();

    match next_frame(&mut bob).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected close frame, got {other:?}"),
    }

    let registry = server.registry();
    wait_for(|| registry.is_empty()).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_dropped_socket_unregisters() {
    let server = TestServer::spawn().await;
    let alice = server.connect_as("alice").await;

    drop(alice);
    let registry = server.registry();
    wait_for(|| registry.is_empty()).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_supersedes_previous_connection() {
    let server = TestServer::spawn().await;
    let mut first = server.connect_as("alice").await;
    let first_id = server.registry().connection("alice").unwrap().id();

    let mut second = server.connect_as("alice").await;
    let registry = server.registry();
    wait_for(|| registry.connection("alice").map(|c| c.id()) != Some(first_id)).await;

    expect_close(&mut first, CloseCode::Normal, SUPERSEDED_REASON).await;
    assert_eq!(server.registry().len(), 1);

    // The old connection's cleanup must not evict its replacement
    sleep(Duration::from_millis(100)).await;
    assert!(server.registry().contains("alice"));

    server.registry().targeted_send("to the new one", "alice").await;
    assert_eq!(next_payload(&mut second).await, "to the new one");

    server.shutdown().await;
}

#[tokio::test]
async fn test_close_all_disconnects_everyone() {
    let server = TestServer::spawn().await;
    let mut alice = server.connect_as("alice").await;
    let mut bob = server.connect_as("bob").await;

    server.gateway.stop().await.unwrap();
    server.registry().close_all().await;

    expect_close(&mut alice, CloseCode::Normal, SHUTDOWN_REASON).await;
    expect_close(&mut bob, CloseCode::Normal, SHUTDOWN_REASON).await;

    assert!(server.gateway.wait_connections(WAIT_TIMEOUT).await);
    assert!(server.registry().is_empty());
}

#[tokio::test]
async fn test_stopped_gateway_refuses_connections() {
    let server = TestServer::spawn().await;
    let addr = server.addr;
    server.shutdown().await;

    // Give the accept loop a moment to drop the listener
    sleep(Duration::from_millis(50)).await;
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/")).await;
    assert!(result.is_err());
}
