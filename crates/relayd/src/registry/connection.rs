//! Registry-side handle to one live client connection.
//!
//! The gateway owns the socket. The registry only holds a `ClientConnection`:
//! a bounded queue of outbound frames drained by the connection's writer task,
//! plus a closing signal watched by the connection's receive loop.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use relay_core::Identity;

/// Outbound frames buffered per connection before senders wait
pub const OUTBOUND_BUFFER: usize = 64;

/// Write timeout (10 seconds)
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-assigned number, unique per accepted connection.
pub type ConnectionId = u64;

/// A frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// One text frame
    Text(String),
    /// Close frame with a reason visible to the peer; the writer stops after it
    Close { reason: String },
}

/// Handle for delivering frames to one connection.
///
/// Cheap to clone; all clones share the same queue and closing signal.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    id: ConnectionId,
    sender: mpsc::Sender<Outbound>,
    closing: CancellationToken,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            sender,
            closing: CancellationToken::new(),
        }
    }

    /// Creates a handle together with the receiver its writer task drains.
    pub fn channel(id: ConnectionId) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (Self::new(id, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues one text frame.
    pub async fn send_text(&self, text: String) -> Result<(), DeliveryError> {
        if self.closing.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.enqueue(Outbound::Text(text)).await
    }

    /// Queues a close frame and signals the receive loop to finish.
    ///
    /// Closing an already-closing connection is a no-op.
    pub async fn close(&self, reason: &str) -> Result<(), DeliveryError> {
        if self.closing.is_cancelled() {
            return Ok(());
        }
        self.closing.cancel();
        self.enqueue(Outbound::Close {
            reason: reason.to_string(),
        })
        .await
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Token cancelled when the connection is asked to close.
    pub fn closing_token(&self) -> CancellationToken {
        self.closing.clone()
    }

    async fn enqueue(&self, frame: Outbound) -> Result<(), DeliveryError> {
        match timeout(WRITE_TIMEOUT, self.sender.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::Closed),
            Err(_) => Err(DeliveryError::WriteTimeout),
        }
    }
}

/// One authenticated, registered peer.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub identity: Identity,
    pub connection: ClientConnection,
}

impl ClientEntry {
    pub fn new(identity: Identity, connection: ClientConnection) -> Self {
        Self {
            identity,
            connection,
        }
    }
}

/// Errors delivering to a single connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Connection closed")]
    Closed,

    #[error("Write timeout")]
    WriteTimeout,
}
