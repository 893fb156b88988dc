//! Handler for one inbound WebSocket connection.
//!
//! Each accepted socket gets its own `ConnectionHandler` that:
//! - Completes the WebSocket upgrade, capturing the token header
//! - Authenticates the peer and rejects it with a close frame on failure
//! - Registers the peer and spawns a writer task draining its outbound queue
//! - Reads until the peer leaves or the registry asks the connection to close
//!
//! The registration is released by a guard, so every exit path (including a
//! panic in the receive loop) removes the entry.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Socket errors end the connection and are logged, never propagated

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::TokenClaims;

use crate::registry::{
    extract_token, AuthError, ClientConnection, ClientEntry, ClientRegistry, ConnectionId,
    Outbound, TokenVerifier, WRITE_TIMEOUT,
};

/// Upgrade must complete within this window (10 seconds)
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the peer to answer our close frame (5 seconds)
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<TcpStream>;

/// Drives one client connection from upgrade to cleanup.
pub struct ConnectionHandler {
    stream: TcpStream,
    peer: SocketAddr,
    connection_id: ConnectionId,
    verifier: Arc<TokenVerifier>,
    /// Lowercase name of the header carrying the token
    token_header: Arc<str>,
    registry: Arc<ClientRegistry>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        connection_id: ConnectionId,
        verifier: Arc<TokenVerifier>,
        token_header: Arc<str>,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            stream,
            peer,
            connection_id,
            verifier,
            token_header,
            registry,
        }
    }

    /// Runs the connection to completion.
    pub async fn run(self) {
        let peer = self.peer;
        let connection = self.connection_id;
        debug!(peer = %peer, connection, "New client connected");

        match self.serve().await {
            Ok(()) => {}
            Err(ConnectionError::Unauthorized(cause)) => {
                warn!(peer = %peer, connection, error = %cause, "Client rejected");
            }
            Err(e) => {
                debug!(peer = %peer, connection, error = %e, "Connection ended");
            }
        }
    }

    async fn serve(self) -> Result<(), ConnectionError> {
        let Self {
            stream,
            peer,
            connection_id,
            verifier,
            token_header,
            registry,
        } = self;

        let (ws, token) = upgrade(stream, &token_header).await?;

        let claims = match authenticate(&verifier, token.as_deref()) {
            Ok(claims) => claims,
            Err(cause) => {
                reject(ws, rejection_reason(&cause)).await;
                return Err(ConnectionError::Unauthorized(cause));
            }
        };

        let identity = claims.identity;
        let (sink, mut stream) = ws.split();
        let (handle, outbound) = ClientConnection::channel(connection_id);
        let closing = handle.closing_token();

        let writer = tokio::spawn(write_loop(sink, outbound, connection_id));
        let guard = registry
            .register_scoped(ClientEntry::new(identity.clone(), handle))
            .await;

        info!(
            identity = %identity,
            peer = %peer,
            connection = connection_id,
            "Client authenticated"
        );

        let ended = receive_loop(&mut stream, &closing, connection_id).await;

        drop(guard);
        finish_writer(writer, connection_id).await;
        if ended != LoopEnd::Dropped {
            drain_until_closed(&mut stream).await;
        }

        info!(identity = %identity, connection = connection_id, "Client disconnected");
        Ok(())
    }
}

/// Completes the upgrade and returns the raw value of `token_header`, if sent.
async fn upgrade(
    stream: TcpStream,
    token_header: &str,
) -> Result<(WsStream, Option<String>), ConnectionError> {
    let mut token = None;

    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        token = req
            .headers()
            .get(token_header)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        Ok(response)
    };

    let ws = match timeout(
        HANDSHAKE_TIMEOUT,
        tokio_tungstenite::accept_hdr_async(stream, callback),
    )
    .await
    {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => return Err(ConnectionError::Handshake(e.to_string())),
        Err(_) => return Err(ConnectionError::HandshakeTimeout),
    };

    Ok((ws, token))
}

/// Extracts and verifies the token from the captured header value.
pub fn authenticate(
    verifier: &TokenVerifier,
    header_value: Option<&str>,
) -> Result<TokenClaims, AuthError> {
    let token = header_value
        .and_then(extract_token)
        .ok_or(AuthError::MissingToken)?;
    verifier.verify(token)
}

/// Close reason sent to a peer that failed authentication.
pub fn rejection_reason(cause: &AuthError) -> String {
    match cause {
        AuthError::MissingToken => cause.to_string(),
        other => format!("authentication failed: {other}"),
    }
}

/// Sends a policy-violation close frame and waits briefly for the peer's reply.
async fn reject(mut ws: WsStream, reason: String) {
    let frame = CloseFrame {
        code: CloseCode::Policy,
        reason: reason.into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!(error = %e, "Failed to send rejection close frame");
        return;
    }

    let _ = timeout(CLOSE_TIMEOUT, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

/// How a connection's receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopEnd {
    /// We queued a close frame and wait for the peer's reply
    ServerClosed,
    /// The peer sent a close frame; our reply is queued but not yet flushed
    PeerClosed,
    /// The stream ended or failed without a close handshake
    Dropped,
}

/// Reads inbound frames until the peer leaves or `closing` fires.
async fn receive_loop(
    stream: &mut SplitStream<WsStream>,
    closing: &CancellationToken,
    connection: ConnectionId,
) -> LoopEnd {
    loop {
        tokio::select! {
            biased;

            _ = closing.cancelled() => {
                debug!(connection, "Closing connection on server request");
                return LoopEnd::ServerClosed;
            }

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    debug!(connection, len = text.len(), "Ignoring inbound text frame");
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!(connection, len = data.len(), "Ignoring inbound binary frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(connection, frame = ?frame, "Client closed connection");
                    return LoopEnd::PeerClosed;
                }
                // Ping/pong are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection, error = %e, "Connection read failed");
                    return LoopEnd::Dropped;
                }
                None => return LoopEnd::Dropped,
            }
        }
    }
}

/// Writes queued frames to the socket until the queue closes or a close
/// frame has been sent.
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    connection: ConnectionId,
) {
    while let Some(frame) = outbound.recv().await {
        let (message, last) = match frame {
            Outbound::Text(text) => (Message::text(text), false),
            Outbound::Close { reason } => (
                Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: reason.into(),
                })),
                true,
            ),
        };

        match timeout(WRITE_TIMEOUT, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection, error = %e, "Write failed");
                return;
            }
            Err(_) => {
                warn!(connection, "Write timed out");
                return;
            }
        }

        if last {
            return;
        }
    }
}

/// Waits for the writer to flush, aborting it if it stalls.
async fn finish_writer(writer: tokio::task::JoinHandle<()>, connection: ConnectionId) {
    let abort = writer.abort_handle();
    if timeout(WRITE_TIMEOUT, writer).await.is_err() {
        warn!(connection, "Writer did not finish, aborting");
        abort.abort();
    }
}

/// Polls the stream until the close handshake completes or the timeout
/// expires.
///
/// Reading flushes a close reply tungstenite queued for the peer; the stream
/// then ends. After our own close frame it ends on the peer's reply.
async fn drain_until_closed(stream: &mut SplitStream<WsStream>) {
    let _ = timeout(CLOSE_TIMEOUT, async {
        while let Some(Ok(frame)) = stream.next().await {
            if frame.is_close() {
                break;
            }
        }
    })
    .await;
}

/// Reasons a connection ends before or outside normal operation.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("WebSocket handshake timed out")]
    HandshakeTimeout,

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(AuthError),
}
