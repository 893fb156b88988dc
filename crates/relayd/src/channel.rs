//! Bounded handoff queue between the consumer and the dispatcher.
//!
//! A thin wrapper over `tokio::sync::mpsc`: many producers, one consumer,
//! FIFO, fixed capacity. `send` suspends while the queue is full, which is
//! the only backpressure the broker consumer sees.

use relay_core::Message;
use tokio::sync::mpsc;

pub use crate::config::DEFAULT_CHANNEL_CAPACITY;

/// Producer half of the internal channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MessageSender {
    inner: mpsc::Sender<Message>,
}

/// Consumer half of the internal channel.
#[derive(Debug)]
pub struct MessageReceiver {
    inner: mpsc::Receiver<Message>,
}

/// Returned by [`MessageSender::send`] when the receiver is gone.
///
/// Carries the message back so the caller can decide what to do with it.
#[derive(Debug, thiserror::Error)]
#[error("internal channel closed")]
pub struct ChannelClosed(pub Message);

/// Creates a channel holding at most `capacity` messages.
///
/// A capacity of zero is raised to one; tokio rejects empty channels.
pub fn bounded(capacity: usize) -> (MessageSender, MessageReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (MessageSender { inner: tx }, MessageReceiver { inner: rx })
}

impl MessageSender {
    /// Enqueues a message, waiting for room if the channel is full.
    pub async fn send(&self, message: Message) -> Result<(), ChannelClosed> {
        self.inner
            .send(message)
            .await
            .map_err(|mpsc::error::SendError(msg)| ChannelClosed(msg))
    }

    /// Maximum number of queued messages.
    pub fn capacity(&self) -> usize {
        self.inner.max_capacity()
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.inner.max_capacity() - self.inner.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl MessageReceiver {
    /// Dequeues the oldest message, waiting while the channel is empty.
    ///
    /// Returns `None` once every sender is dropped and the queue is drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inner.recv().await
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
