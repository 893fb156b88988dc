//! Lifecycle shared by every long-running relay component.
//!
//! The supervisor holds each component as an `Arc<dyn Service>`, so all
//! three operations take `&self`: one task drives `run()` while another
//! calls `stop()`.

use async_trait::async_trait;
use thiserror::Error;

use crate::consumer::ConsumerError;
use crate::gateway::GatewayError;

/// A component with a setup / run / stop lifecycle.
#[async_trait]
pub trait Service: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Acquires external resources. Failure is fatal to startup.
    async fn setup(&self) -> Result<(), ServiceError>;

    /// Runs until stopped or until a fatal error occurs.
    async fn run(&self) -> Result<(), ServiceError>;

    /// Requests shutdown and releases resources that `run` may be blocked on.
    ///
    /// Idempotent. Must cause a pending `run` to return promptly.
    async fn stop(&self) -> Result<(), ServiceError>;
}

/// Errors surfaced through the [`Service`] lifecycle.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} was run before setup")]
    NotSetUp(&'static str),

    #[error("Consumer error: {0}")]
    Consumer(#[from] ConsumerError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
}
