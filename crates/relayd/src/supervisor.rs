//! Builds the relay pipeline and drives its services.
//!
//! ```text
//! setup()  ── every service concurrently; first failure aborts startup
//! run()    ── one task per service; returns on shutdown or first exit
//! stop()   ── stop every service, close all clients, bounded wait, abort
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, try_join_all};
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel;
use crate::config::{RelayConfig, JWT_SECRET_ENV};
use crate::consumer::Consumer;
use crate::dispatcher::Dispatcher;
use crate::gateway::Gateway;
use crate::registry::ClientRegistry;
use crate::service::{Service, ServiceError};

/// Time allowed for services and connections to finish after `stop()` (10 seconds)
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// How a service task ended.
enum Exit {
    Returned(Result<(), ServiceError>),
    Panicked,
}

/// Owns the relay services and their shared registry.
pub struct Supervisor {
    services: Vec<Arc<dyn Service>>,
    registry: Arc<ClientRegistry>,
    gateway: Option<Arc<Gateway>>,
    grace: Duration,
    tasks: Mutex<JoinSet<(&'static str, Exit)>>,
}

impl Supervisor {
    /// Supervises `services`, closing the clients of `registry` on stop.
    pub fn new(services: Vec<Arc<dyn Service>>, registry: Arc<ClientRegistry>) -> Self {
        Self {
            services,
            registry,
            gateway: None,
            grace: SHUTDOWN_GRACE,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Wires consumer → channel → dispatcher → registry ← gateway.
    pub fn from_config(config: &RelayConfig) -> Self {
        if config.auth.uses_insecure_default() {
            warn!(
                env = JWT_SECRET_ENV,
                "No token secret configured, using the insecure default"
            );
        }

        let (sender, receiver) = channel::bounded(config.channel_capacity);

        let gateway = Arc::new(Gateway::new(config.gateway.clone(), &config.auth));
        let registry = gateway.registry();
        let dispatcher = Arc::new(Dispatcher::new(receiver, Arc::clone(&registry)));
        let consumer = Arc::new(Consumer::new(config.broker.clone(), sender));

        let services: Vec<Arc<dyn Service>> =
            vec![consumer, dispatcher, Arc::clone(&gateway) as Arc<dyn Service>];

        let mut supervisor = Self::new(services, registry);
        supervisor.gateway = Some(gateway);
        supervisor
    }

    /// Overrides how long `stop()` waits before aborting.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    /// The gateway built by [`from_config`](Self::from_config), if any.
    pub fn gateway(&self) -> Option<Arc<Gateway>> {
        self.gateway.clone()
    }

    /// Sets up every service concurrently.
    ///
    /// On the first failure every service is asked to stop so partially
    /// acquired resources are released.
    pub async fn setup(&self) -> Result<(), SupervisorError> {
        let result = try_join_all(self.services.iter().map(|service| async move {
            debug!(service = service.name(), "Setting up service");
            service
                .setup()
                .await
                .map_err(|error| SupervisorError::Setup {
                    service: service.name(),
                    error,
                })
        }))
        .await;

        if let Err(e) = result {
            error!(error = %e, "Startup failed");
            self.stop_services().await;
            return Err(e);
        }

        info!(services = self.services.len(), "All services are set");
        Ok(())
    }

    /// Runs every service until `shutdown` fires or any service exits.
    ///
    /// A service exiting on its own, even without an error, is reported so
    /// the caller shuts the rest down.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SupervisorError> {
        let mut tasks = self.tasks.lock().await;

        for service in &self.services {
            let service = Arc::clone(service);
            tasks.spawn(async move {
                let name = service.name();
                let exit = match AssertUnwindSafe(service.run()).catch_unwind().await {
                    Ok(result) => Exit::Returned(result),
                    Err(_) => Exit::Panicked,
                };
                (name, exit)
            });
        }
        info!(services = self.services.len(), "Relay is running");

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested");
                Ok(())
            }

            Some(Ok((service, exit))) = tasks.join_next() => match exit {
                Exit::Returned(Ok(())) => {
                    warn!(service, "Service stopped unexpectedly");
                    Err(SupervisorError::Exited { service })
                }
                Exit::Returned(Err(error)) => {
                    error!(service, error = %error, "Service failed");
                    Err(SupervisorError::Failed { service, error })
                }
                Exit::Panicked => {
                    error!(service, "Service task panicked");
                    Err(SupervisorError::Panicked { service })
                }
            }
        }
    }

    /// Stops every service, closes all client connections and waits for
    /// everything to finish, aborting what is still running after the
    /// grace period.
    pub async fn stop(&self) {
        let deadline = Instant::now() + self.grace;

        self.stop_services().await;
        self.registry.close_all().await;

        let mut tasks = self.tasks.lock().await;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, tasks.join_next()).await {
                Ok(Some(Ok((service, Exit::Returned(Ok(())))))) => {
                    debug!(service, "Service finished");
                }
                Ok(Some(Ok((service, Exit::Returned(Err(e)))))) => {
                    warn!(service, error = %e, "Service finished with error");
                }
                Ok(Some(Ok((service, Exit::Panicked)))) => {
                    warn!(service, "Service panicked during shutdown");
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "Service task ended abnormally");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = tasks.len(), "Services did not stop in time, aborting");
                    tasks.shutdown().await;
                    break;
                }
            }
        }
        drop(tasks);

        if let Some(gateway) = &self.gateway {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !gateway.wait_connections(remaining).await {
                warn!(
                    connections = gateway.active_connections(),
                    "Client connections did not close in time"
                );
            }
        }

        info!("Relay stopped");
    }

    async fn stop_services(&self) {
        join_all(self.services.iter().map(|service| async move {
            if let Err(e) = service.stop().await {
                warn!(service = service.name(), error = %e, "Failed to stop service");
            }
        }))
        .await;
    }
}

/// Errors that end the relay.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to set up {service}: {error}")]
    Setup {
        service: &'static str,
        #[source]
        error: ServiceError,
    },

    #[error("{service} failed: {error}")]
    Failed {
        service: &'static str,
        #[source]
        error: ServiceError,
    },

    #[error("{service} stopped unexpectedly")]
    Exited { service: &'static str },

    #[error("{service} panicked")]
    Panicked { service: &'static str },
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Configurable service for exercising the supervisor.
    #[derive(Default)]
    struct FakeService {
        name: &'static str,
        fail_setup: bool,
        fail_run: bool,
        fail_stop: bool,
        ignore_stop: bool,
        stops: AtomicUsize,
        finished: AtomicBool,
        token: CancellationToken,
    }

    impl FakeService {
        fn named(name: &'static str) -> Self {
            Self {
                name,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Service for FakeService {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn setup(&self) -> Result<(), ServiceError> {
            if self.fail_setup {
                return Err(ServiceError::NotSetUp(self.name));
            }
            Ok(())
        }

        async fn run(&self) -> Result<(), ServiceError> {
            if self.fail_run {
                return Err(ServiceError::NotSetUp(self.name));
            }
            if self.ignore_stop {
                std::future::pending::<()>().await;
            }
            self.token.cancelled().await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), ServiceError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.token.cancel();
            if self.fail_stop {
                return Err(ServiceError::NotSetUp(self.name));
            }
            Ok(())
        }
    }

    fn supervisor(services: &[Arc<FakeService>]) -> Supervisor {
        let services = services
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn Service>)
            .collect();
        Supervisor::new(services, Arc::new(ClientRegistry::new()))
            .with_grace(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_setup_failure_aborts_startup() {
        let good = Arc::new(FakeService::named("good"));
        let bad = Arc::new(FakeService {
            fail_setup: true,
            ..FakeService::named("bad")
        });
        let sup = supervisor(&[Arc::clone(&good), Arc::clone(&bad)]);

        let err = sup.setup().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Setup { service: "bad", .. }));
        assert_eq!(good.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_until_shutdown_then_stop() {
        let a = Arc::new(FakeService::named("a"));
        let b = Arc::new(FakeService::named("b"));
        let sup = supervisor(&[Arc::clone(&a), Arc::clone(&b)]);
        sup.setup().await.unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        sup.run(shutdown).await.unwrap();
        sup.stop().await;

        assert!(a.finished.load(Ordering::SeqCst));
        assert!(b.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failing_service_ends_run() {
        let steady = Arc::new(FakeService::named("steady"));
        let broken = Arc::new(FakeService {
            fail_run: true,
            ..FakeService::named("broken")
        });
        let sup = supervisor(&[Arc::clone(&steady), Arc::clone(&broken)]);

        let err = timeout(Duration::from_secs(1), sup.run(CancellationToken::new()))
            .await
            .expect("run should return when a service fails")
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Failed { service: "broken", .. }));

        sup.stop().await;
        assert!(steady.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_continues_past_failing_stop() {
        let flaky = Arc::new(FakeService {
            fail_stop: true,
            ..FakeService::named("flaky")
        });
        let other = Arc::new(FakeService::named("other"));
        let sup = supervisor(&[Arc::clone(&flaky), Arc::clone(&other)]);

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        sup.run(shutdown).await.unwrap();
        sup.stop().await;

        assert_eq!(flaky.stops.load(Ordering::SeqCst), 1);
        assert_eq!(other.stops.load(Ordering::SeqCst), 1);
        assert!(other.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_aborts_stragglers() {
        let stuck = Arc::new(FakeService {
            ignore_stop: true,
            ..FakeService::named("stuck")
        });
        let sup = supervisor(&[Arc::clone(&stuck)]);

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        sup.run(shutdown).await.unwrap();

        timeout(Duration::from_secs(2), sup.stop())
            .await
            .expect("stop should give up after the grace period");
        assert!(!stuck.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_closes_registered_clients() {
        use crate::registry::{ClientConnection, ClientEntry, Outbound, SHUTDOWN_REASON};
        use relay_core::Identity;

        let sup = supervisor(&[]);
        let (conn, mut rx) = ClientConnection::channel(1);
        sup.registry()
            .register(ClientEntry::new(Identity::new("a"), conn))
            .await;

        sup.stop().await;
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Close {
                reason: SHUTDOWN_REASON.to_string()
            })
        );
    }

    #[test]
    fn test_from_config_wires_gateway_registry() {
        let sup = Supervisor::from_config(&RelayConfig::default());
        let gateway = sup.gateway().unwrap();
        assert!(Arc::ptr_eq(&gateway.registry(), &sup.registry()));
    }
}
