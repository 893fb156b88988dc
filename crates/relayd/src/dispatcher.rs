//! Dispatcher - single consumer of the internal channel.
//!
//! Takes messages in arrival order and routes each one through the
//! registry: an empty target broadcasts, anything else is a targeted send.
//! Per-recipient outcomes are the registry's concern; the dispatcher never
//! retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use relay_core::{Message, Route};

use crate::channel::MessageReceiver;
use crate::registry::ClientRegistry;
use crate::service::{Service, ServiceError};

/// Drains the internal channel into the registry.
pub struct Dispatcher {
    /// Consumer half of the internal channel
    receiver: Mutex<MessageReceiver>,

    /// Registry owned by the gateway
    registry: Arc<ClientRegistry>,

    /// Cleared by `stop()`
    running: AtomicBool,

    /// Wakes a pending dequeue on `stop()`
    cancel_token: CancellationToken,
}

impl Dispatcher {
    pub fn new(receiver: MessageReceiver, registry: Arc<ClientRegistry>) -> Self {
        Self {
            receiver: Mutex::new(receiver),
            registry,
            running: AtomicBool::new(true),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Routes one message to its recipients.
    pub async fn dispatch(&self, message: Message) {
        match message.route() {
            Route::Broadcast => {
                debug!("Dispatching broadcast");
                self.registry.broadcast(message.payload()).await;
            }
            Route::Targeted(identity) => {
                debug!(target = %identity, "Dispatching targeted message");
                self.registry
                    .targeted_send(message.payload(), identity.as_str())
                    .await;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Service for Dispatcher {
    fn name(&self) -> &'static str {
        "dispatcher"
    }

    async fn setup(&self) -> Result<(), ServiceError> {
        info!("Message dispatcher is set");
        Ok(())
    }

    async fn run(&self) -> Result<(), ServiceError> {
        info!("Message dispatcher is running");
        let mut receiver = self.receiver.lock().await;

        while self.is_running() {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    debug!("Dispatcher cancelled");
                    break;
                }

                message = receiver.recv() => {
                    match message {
                        Some(message) => self.dispatch(message).await,
                        None => {
                            info!("Internal channel closed, dispatcher exiting");
                            break;
                        }
                    }
                }
            }
        }

        info!("Message dispatcher stopped");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        info!("Stopping message dispatcher");
        self.running.store(false, Ordering::SeqCst);
        self.cancel_token.cancel();
        Ok(())
    }
}
