//! Per-delivery handling, independent of the broker client.
//!
//! `pump` drives any stream of [`BrokerDelivery`] values into the internal
//! channel. The consumer feeds it lapin deliveries; tests feed it in-memory
//! ones.
//!
//! Acknowledgement rules:
//! - decoded messages are acked only after the channel accepted them
//! - malformed bodies are acked and dropped so they cannot wedge the queue
//! - a delivery interrupted by shutdown is left unacked for redelivery

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::message::Delivery;
use lapin::options::BasicAckOptions;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_protocol::decode_body;

use super::ConsumerError;
use crate::channel::MessageSender;

/// A message received from the broker that can be acknowledged.
#[async_trait]
pub trait BrokerDelivery: Send + Sync {
    /// Raw message body.
    fn body(&self) -> &[u8];

    /// Broker-assigned delivery tag, for logs.
    fn tag(&self) -> u64;

    /// Acknowledges the delivery to the broker.
    async fn ack(&self) -> Result<(), ConsumerError>;
}

#[async_trait]
impl BrokerDelivery for Delivery {
    fn body(&self) -> &[u8] {
        &self.data
    }

    fn tag(&self) -> u64 {
        self.delivery_tag
    }

    async fn ack(&self) -> Result<(), ConsumerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| ConsumerError::Ack(e.to_string()))
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Enqueued on the internal channel and acked
    Forwarded,
    /// Malformed; logged, acked and dropped
    Dropped,
    /// Shutdown won the race against a full channel; left unacked
    Interrupted,
    /// The dispatcher side of the channel is gone; left unacked
    ChannelClosed,
}

/// Counters for one `pump` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub forwarded: u64,
    pub dropped: u64,
}

/// Decodes one delivery, forwards it, and acknowledges it.
pub async fn handle_delivery<D: BrokerDelivery>(
    delivery: &D,
    sender: &MessageSender,
    cancel_token: &CancellationToken,
) -> Handled {
    let tag = delivery.tag();

    let message = match decode_body(delivery.body()) {
        Ok(message) => message,
        Err(e) => {
            warn!(tag, error = %e, "Unable to process message, dropping it");
            ack(delivery).await;
            return Handled::Dropped;
        }
    };

    debug!(tag, target = %message.target(), "New message is received");

    // Waits here while the channel is full
    let sent = tokio::select! {
        biased;
        _ = cancel_token.cancelled() => None,
        result = sender.send(message) => Some(result),
    };

    match sent {
        Some(Ok(())) => {
            ack(delivery).await;
            Handled::Forwarded
        }
        Some(Err(_)) => {
            warn!(tag, "Internal channel closed, leaving message unacked");
            Handled::ChannelClosed
        }
        None => {
            info!(tag, "Shutdown while waiting for channel capacity, leaving message unacked");
            Handled::Interrupted
        }
    }
}

/// Forwards deliveries until the stream ends, the token is cancelled, or
/// the stream fails.
///
/// Stream errors observed after cancellation are treated as part of shutdown.
pub async fn pump<S, D>(
    deliveries: S,
    sender: &MessageSender,
    cancel_token: &CancellationToken,
) -> Result<PumpStats, ConsumerError>
where
    S: Stream<Item = Result<D, ConsumerError>>,
    D: BrokerDelivery,
{
    let mut deliveries = std::pin::pin!(deliveries);
    let mut stats = PumpStats::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            next = deliveries.next() => next,
        };

        match next {
            None => {
                debug!("Delivery stream ended");
                break;
            }
            Some(Err(e)) if cancel_token.is_cancelled() => {
                debug!(error = %e, "Delivery stream closed during shutdown");
                break;
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(delivery)) => match handle_delivery(&delivery, sender, cancel_token).await {
                Handled::Forwarded => stats.forwarded += 1,
                Handled::Dropped => stats.dropped += 1,
                Handled::Interrupted => break,
                Handled::ChannelClosed => return Err(ConsumerError::ChannelClosed),
            },
        }
    }

    Ok(stats)
}

async fn ack<D: BrokerDelivery>(delivery: &D) {
    if let Err(e) = delivery.ack().await {
        warn!(tag = delivery.tag(), error = %e, "Failed to acknowledge message");
    }
}
