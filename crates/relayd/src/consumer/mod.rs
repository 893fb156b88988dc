//! Broker consumer.
//!
//! Subscribes to one AMQP queue and feeds decoded messages into the
//! internal channel.
//!
//! # Lifecycle
//!
//! - `setup()` connects, opens a channel, applies the prefetch limit,
//!   checks (or declares) the queue and subscribes. Any failure is fatal.
//! - `run()` pumps deliveries until `stop()` or the subscription ends.
//! - `stop()` clears the running flag, wakes the pump and closes the
//!   broker channel and connection.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::MessageSender;
use crate::config::BrokerConfig;
use crate::service::{Service, ServiceError};

mod delivery;

pub use delivery::{handle_delivery, pump, BrokerDelivery, Handled, PumpStats};

/// Reply code sent when closing the broker channel and connection
const CLOSE_REPLY_CODE: u16 = 200;

/// Consumes one broker queue into the internal channel.
pub struct Consumer {
    config: BrokerConfig,
    sender: MessageSender,

    connection: Mutex<Option<Connection>>,
    channel: Mutex<Option<Channel>>,

    /// Subscription opened by `setup()` and taken by `run()`
    deliveries: Mutex<Option<lapin::Consumer>>,

    /// Cleared by `stop()`
    running: AtomicBool,

    /// Wakes the pump on `stop()`
    cancel_token: CancellationToken,
}

impl Consumer {
    pub fn new(config: BrokerConfig, sender: MessageSender) -> Self {
        Self {
            config,
            sender,
            connection: Mutex::new(None),
            channel: Mutex::new(None),
            deliveries: Mutex::new(None),
            running: AtomicBool::new(true),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// `host:port` of the broker, for logs and errors.
    fn broker_addr(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

/// Builds the AMQP URI for `config` without string formatting, so
/// credentials containing URI metacharacters need no escaping.
pub fn amqp_uri(config: &BrokerConfig) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.login.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.virtual_host.clone(),
        ..AMQPUri::default()
    }
}

/// Queue options: a passive check unless the queue is to be declared.
fn queue_options(declare: bool) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: !declare,
        durable: declare,
        ..QueueDeclareOptions::default()
    }
}

#[async_trait]
impl Service for Consumer {
    fn name(&self) -> &'static str {
        "consumer"
    }

    async fn setup(&self) -> Result<(), ServiceError> {
        let addr = self.broker_addr();
        let queue = self.config.queue_name.as_str();
        info!(broker = %addr, vhost = %self.config.virtual_host, "Connecting to message broker");

        let connection =
            Connection::connect_uri(amqp_uri(&self.config), ConnectionProperties::default())
                .await
                .map_err(|e| ConsumerError::Connect {
                    addr: addr.clone(),
                    error: e.to_string(),
                })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ConsumerError::Channel(e.to_string()))?;

        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| ConsumerError::Channel(e.to_string()))?;

        channel
            .queue_declare(
                queue,
                queue_options(self.config.declare_queue),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::Queue {
                queue: queue.to_string(),
                error: e.to_string(),
            })?;

        let deliveries = channel
            .basic_consume(
                queue,
                &self.config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::Subscribe {
                queue: queue.to_string(),
                error: e.to_string(),
            })?;

        *self.connection.lock().await = Some(connection);
        *self.channel.lock().await = Some(channel);
        *self.deliveries.lock().await = Some(deliveries);

        info!(
            queue = %queue,
            prefetch = self.config.prefetch,
            "Message broker consumer is set"
        );
        Ok(())
    }

    async fn run(&self) -> Result<(), ServiceError> {
        let deliveries = self
            .deliveries
            .lock()
            .await
            .take()
            .ok_or(ServiceError::NotSetUp("consumer"))?;

        info!(queue = %self.config.queue_name, "Message broker consumer is running");

        let stream = deliveries.map(|item| item.map_err(|e| ConsumerError::Stream(e.to_string())));
        let stats = pump(stream, &self.sender, &self.cancel_token).await?;

        if self.is_running() {
            warn!("Broker subscription ended unexpectedly");
        }
        info!(
            forwarded = stats.forwarded,
            dropped = stats.dropped,
            "Message broker consumer stopped"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        info!("Stopping message broker consumer");
        self.running.store(false, Ordering::SeqCst);
        self.cancel_token.cancel();

        let mut result = Ok(());

        let channel = self.channel.lock().await.take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close(CLOSE_REPLY_CODE, "consumer stopping").await {
                warn!(error = %e, "Failed to close broker channel");
                result = Err(ConsumerError::Close(e.to_string()));
            }
        }

        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            if let Err(e) = connection
                .close(CLOSE_REPLY_CODE, "consumer stopping")
                .await
            {
                warn!(error = %e, "Failed to close broker connection");
                if result.is_ok() {
                    result = Err(ConsumerError::Close(e.to_string()));
                }
            }
        }

        debug!("Broker resources released");
        result.map_err(ServiceError::from)
    }
}

/// Errors from the broker side of the relay.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Failed to connect to broker at {addr}: {error}")]
    Connect { addr: String, error: String },

    #[error("Broker channel error: {0}")]
    Channel(String),

    #[error("Queue {queue} unavailable: {error}")]
    Queue { queue: String, error: String },

    #[error("Failed to subscribe to queue {queue}: {error}")]
    Subscribe { queue: String, error: String },

    #[error("Delivery stream failed: {0}")]
    Stream(String),

    #[error("Failed to acknowledge delivery: {0}")]
    Ack(String),

    #[error("Internal channel closed")]
    ChannelClosed,

    #[error("Failed to close broker resources: {0}")]
    Close(String),
}
