//! WebSocket gateway.
//!
//! The gateway:
//! - Binds a TCP listener during `setup()`
//! - Accepts connections until `stop()`, spawning a `ConnectionHandler` each
//! - Owns the `ClientRegistry` the dispatcher delivers through
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │     Gateway     │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐ register_scoped ┌─────────────────┐
//! │ConnectionHandler│────────────────▶│ ClientRegistry  │
//! │   (per client)  │                 │                 │
//! └─────────────────┘                 └─────────────────┘
//! ```
//!
//! Stopping the gateway only ends the accept loop. Open connections are
//! closed through [`ClientRegistry::close_all`] and can then be awaited
//! with [`Gateway::wait_connections`].
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and allow continued operation

mod connection;

pub use connection::{
    authenticate, rejection_reason, ConnectionError, ConnectionHandler, HANDSHAKE_TIMEOUT,
};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::{AuthConfig, GatewayConfig};
use crate::registry::{ClientRegistry, TokenVerifier};
use crate::service::{Service, ServiceError};

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts and authenticates WebSocket clients.
pub struct Gateway {
    config: GatewayConfig,

    /// Shared by every connection handler
    verifier: Arc<TokenVerifier>,

    /// Lowercase name of the header carrying the token
    token_header: Arc<str>,

    /// Live connections, shared with the dispatcher
    registry: Arc<ClientRegistry>,

    /// Bound by `setup()`, taken by `run()`
    listener: Mutex<Option<TcpListener>>,

    /// Address actually bound, known after `setup()`
    local_addr: OnceLock<SocketAddr>,

    /// Cancels the accept loop
    cancel_token: CancellationToken,

    /// Connection counter for generating connection ids
    connection_counter: AtomicU64,

    /// Spawned connection tasks
    connections: TaskTracker,
}

impl Gateway {
    /// Creates a gateway with an empty registry.
    pub fn new(config: GatewayConfig, auth: &AuthConfig) -> Self {
        Self::with_registry(config, auth, Arc::new(ClientRegistry::new()))
    }

    /// Creates a gateway that registers clients into `registry`.
    pub fn with_registry(
        config: GatewayConfig,
        auth: &AuthConfig,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            config,
            verifier: Arc::new(TokenVerifier::from_config(auth)),
            token_header: Arc::from(auth.token_header.to_ascii_lowercase()),
            registry,
            listener: Mutex::new(None),
            local_addr: OnceLock::new(),
            cancel_token: CancellationToken::new(),
            connection_counter: AtomicU64::new(0),
            connections: TaskTracker::new(),
        }
    }

    /// Returns the registry the gateway registers clients into.
    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    /// Returns the bound address, once `setup()` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Number of connection tasks still running.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Waits up to `grace` for every connection task to finish.
    ///
    /// Returns false if some were still running when the grace period ended.
    pub async fn wait_connections(&self, grace: Duration) -> bool {
        self.connections.close();
        tokio::time::timeout(grace, self.connections.wait())
            .await
            .is_ok()
    }

    fn handle_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let connection_id = self.connection_counter.fetch_add(1, Ordering::Relaxed);
        let handler = ConnectionHandler::new(
            stream,
            peer,
            connection_id,
            Arc::clone(&self.verifier),
            Arc::clone(&self.token_header),
            Arc::clone(&self.registry),
        );

        self.connections.spawn(handler.run());
    }
}

#[async_trait]
impl Service for Gateway {
    fn name(&self) -> &'static str {
        "gateway"
    }

    async fn setup(&self) -> Result<(), ServiceError> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(addr.as_str())
            .await
            .map_err(|e| GatewayError::Bind {
                addr: addr.clone(),
                error: e.to_string(),
            })?;

        let local = listener
            .local_addr()
            .map_err(|e| GatewayError::Bind {
                addr: addr.clone(),
                error: e.to_string(),
            })?;
        let _ = self.local_addr.set(local);
        *self.listener.lock().await = Some(listener);

        info!(addr = %local, "WebSocket gateway is set");
        Ok(())
    }

    async fn run(&self) -> Result<(), ServiceError> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(ServiceError::NotSetUp("gateway"))?;

        info!(addr = ?self.local_addr(), "WebSocket gateway is running");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Gateway shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.handle_connection(stream, peer),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            // Continue accepting other connections
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
            }
        }

        debug!(
            connections = self.active_connections(),
            "Accept loop finished"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        info!("Stopping WebSocket gateway");
        self.cancel_token.cancel();
        Ok(())
    }
}

/// Errors that can occur in gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(port: u16) -> GatewayConfig {
        GatewayConfig {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    #[test]
    fn test_bind_error_display() {
        let err = GatewayError::Bind {
            addr: "0.0.0.0:80".to_string(),
            error: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("0.0.0.0:80"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[tokio::test]
    async fn test_setup_binds_ephemeral_port() {
        let gateway = Gateway::new(config(0), &AuthConfig::default());
        assert!(gateway.local_addr().is_none());

        gateway.setup().await.unwrap();
        let addr = gateway.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_setup_fails_on_taken_port() {
        let first = Gateway::new(config(0), &AuthConfig::default());
        first.setup().await.unwrap();
        let port = first.local_addr().unwrap().port();

        let second = Gateway::new(config(port), &AuthConfig::default());
        assert!(matches!(
            second.setup().await,
            Err(ServiceError::Gateway(GatewayError::Bind { .. }))
        ));
    }

    #[tokio::test]
    async fn test_run_before_setup_fails() {
        let gateway = Gateway::new(config(0), &AuthConfig::default());
        assert!(matches!(
            gateway.run().await,
            Err(ServiceError::NotSetUp("gateway"))
        ));
    }

    #[tokio::test]
    async fn test_stop_ends_accept_loop() {
        let gateway = Arc::new(Gateway::new(config(0), &AuthConfig::default()));
        gateway.setup().await.unwrap();

        let task = tokio::spawn({
            let gateway = Arc::clone(&gateway);
            async move { gateway.run().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        gateway.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("accept loop should stop")
            .unwrap()
            .unwrap();
        assert!(gateway.wait_connections(Duration::from_millis(100)).await);
    }

    #[test]
    fn test_shares_given_registry() {
        let registry = Arc::new(ClientRegistry::new());
        let gateway = Gateway::with_registry(config(0), &AuthConfig::default(), Arc::clone(&registry));
        assert!(Arc::ptr_eq(&gateway.registry(), &registry));
    }
}
