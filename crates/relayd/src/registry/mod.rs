//! Identity-keyed directory of live client connections.
//!
//! The registry is the only state shared between the gateway (which
//! registers and releases connections) and the dispatcher (which delivers
//! through it).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐ register/release ┌──────────────────────────────┐
//! │ConnectionHandler│─────────────────▶│        ClientRegistry        │
//! │  (per client)   │                  │ RwLock<HashMap<Identity,     │
//! └─────────────────┘                  │            ClientEntry>>     │
//!                                      └──────────────┬───────────────┘
//! ┌─────────────────┐ broadcast /                     │ snapshot, then
//! │   Dispatcher    │─targeted_send──────────────────▶│ concurrent sends
//! └─────────────────┘                                 ▼
//!                                         per-connection outbound queues
//! ```
//!
//! # Locking
//!
//! One `RwLock` lives as long as the registry. It guards map mutation and
//! the snapshot taken at the start of a broadcast, and is never held across
//! an `.await`.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A poisoned lock is recovered rather than propagated
//! - Delivery failures are logged per recipient and never returned

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use relay_core::Identity;
use relay_protocol::Envelope;

mod auth;
mod connection;

pub use auth::{extract_token, issue_token, verify_token, AuthError, TokenVerifier};
pub use connection::{
    ClientConnection, ClientEntry, ConnectionId, DeliveryError, Outbound, OUTBOUND_BUFFER,
    WRITE_TIMEOUT,
};

/// Close reason sent to a connection replaced by a newer one for the same identity
pub const SUPERSEDED_REASON: &str = "superseded by a newer connection";

/// Close reason sent to every connection on shutdown
pub const SHUTDOWN_REASON: &str = "server shutting down";

/// Outcome of a broadcast or targeted send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections a send was attempted to
    pub attempted: usize,
    /// Connections whose outbound queue accepted the envelope
    pub delivered: usize,
}

impl DeliveryReport {
    pub fn failed(&self) -> usize {
        self.attempted - self.delivered
    }
}

/// Directory of authenticated connections, at most one per identity.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<Identity, ClientEntry>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Identity, ClientEntry>> {
        self.clients.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Identity, ClientEntry>> {
        self.clients.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `entry`, replacing any entry registered under the same identity.
    ///
    /// The replaced connection is closed after the lock is released.
    /// Returns true if an entry was replaced.
    pub async fn register(&self, entry: ClientEntry) -> bool {
        let identity = entry.identity.clone();
        let connection_id = entry.connection.id();
        let previous = self.write().insert(identity.clone(), entry);

        info!(identity = %identity, connection = connection_id, "Client registered");

        match previous {
            Some(old) if old.connection.id() != connection_id => {
                info!(
                    identity = %identity,
                    superseded = old.connection.id(),
                    "Closing superseded connection"
                );
                if let Err(e) = old.connection.close(SUPERSEDED_REASON).await {
                    debug!(
                        identity = %identity,
                        connection = old.connection.id(),
                        error = %e,
                        "Failed to close superseded connection"
                    );
                }
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Registers `entry` and returns a guard that releases it when dropped.
    pub async fn register_scoped(self: &Arc<Self>, entry: ClientEntry) -> RegistrationGuard {
        let guard = RegistrationGuard {
            registry: Arc::clone(self),
            identity: entry.identity.clone(),
            connection_id: entry.connection.id(),
        };
        self.register(entry).await;
        guard
    }

    /// Removes the entry for `identity`, if any.
    pub fn unregister(&self, identity: &str) -> Option<ClientEntry> {
        let removed = self.write().remove(identity);
        if let Some(ref entry) = removed {
            info!(
                identity = %entry.identity,
                connection = entry.connection.id(),
                "Client unregistered"
            );
        }
        removed
    }

    /// Removes the entry for `identity` only if it belongs to `connection_id`.
    ///
    /// A superseded connection's cleanup therefore never evicts its replacement.
    pub fn release(&self, identity: &Identity, connection_id: ConnectionId) -> bool {
        let mut clients = self.write();
        let owned = clients
            .get(identity)
            .is_some_and(|entry| entry.connection.id() == connection_id);
        if !owned {
            return false;
        }

        clients.remove(identity);
        drop(clients);
        info!(identity = %identity, connection = connection_id, "Client unregistered");
        true
    }

    /// Wraps `payload` with the current UTC timestamp.
    pub fn compose_envelope(payload: &str) -> Envelope {
        Envelope::now(payload)
    }

    /// Sends `payload` to every connection registered at the time of the call.
    ///
    /// Sends run concurrently. A failing recipient is logged and does not
    /// affect the others.
    pub async fn broadcast(&self, payload: &str) -> DeliveryReport {
        let recipients = self.snapshot();
        if recipients.is_empty() {
            debug!("Broadcast with no connected clients");
            return DeliveryReport::default();
        }

        let Some(frame) = encode_envelope(payload) else {
            return DeliveryReport {
                attempted: recipients.len(),
                delivered: 0,
            };
        };

        let results = join_all(
            recipients
                .iter()
                .map(|entry| deliver(entry, frame.clone())),
        )
        .await;

        let report = DeliveryReport {
            attempted: recipients.len(),
            delivered: results.into_iter().filter(|ok| *ok).count(),
        };
        debug!(
            attempted = report.attempted,
            delivered = report.delivered,
            "Broadcast complete"
        );
        report
    }

    /// Sends `payload` to the connection registered as `identity`.
    ///
    /// An unknown identity is logged and treated as success.
    pub async fn targeted_send(&self, payload: &str, identity: &str) -> DeliveryReport {
        let entry = self.read().get(identity).cloned();
        let Some(entry) = entry else {
            warn!(
                identity = %identity,
                "Cannot deliver message: client is not connected"
            );
            return DeliveryReport::default();
        };

        let delivered = match encode_envelope(payload) {
            Some(frame) => deliver(&entry, frame).await,
            None => false,
        };

        DeliveryReport {
            attempted: 1,
            delivered: usize::from(delivered),
        }
    }

    /// Closes every registered connection concurrently.
    ///
    /// Entries are removed by each connection's own cleanup once its
    /// receive loop ends.
    pub async fn close_all(&self) {
        let entries = self.snapshot();
        if entries.is_empty() {
            return;
        }

        info!(clients = entries.len(), "Closing all client connections");

        join_all(entries.iter().map(|entry| async move {
            if let Err(e) = entry.connection.close(SHUTDOWN_REASON).await {
                warn!(
                    identity = %entry.identity,
                    connection = entry.connection.id(),
                    error = %e,
                    "Failed to close client connection"
                );
            }
        }))
        .await;
    }

    /// Returns the number of registered connections.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.read().contains_key(identity)
    }

    /// Returns the registered identities in no particular order.
    pub fn identities(&self) -> Vec<Identity> {
        self.read().keys().cloned().collect()
    }

    /// Returns the connection registered as `identity`.
    pub fn connection(&self, identity: &str) -> Option<ClientConnection> {
        self.read().get(identity).map(|entry| entry.connection.clone())
    }

    fn snapshot(&self) -> Vec<ClientEntry> {
        self.read().values().cloned().collect()
    }
}

/// Releases a registration when dropped, on every exit path of the owner.
#[must_use = "dropping the guard unregisters the connection immediately"]
#[derive(Debug)]
pub struct RegistrationGuard {
    registry: Arc<ClientRegistry>,
    identity: Identity,
    connection_id: ConnectionId,
}

impl RegistrationGuard {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if !self.registry.release(&self.identity, self.connection_id) {
            debug!(
                identity = %self.identity,
                connection = self.connection_id,
                "Registration already replaced or removed"
            );
        }
    }
}

fn encode_envelope(payload: &str) -> Option<String> {
    match ClientRegistry::compose_envelope(payload).to_json() {
        Ok(json) => Some(json),
        Err(e) => {
            error!(error = %e, "Failed to serialize envelope");
            None
        }
    }
}

async fn deliver(entry: &ClientEntry, frame: String) -> bool {
    match entry.connection.send_text(frame).await {
        Ok(()) => true,
        Err(e) => {
            warn!(
                identity = %entry.identity,
                connection = entry.connection.id(),
                error = %e,
                "Failed to deliver message to client"
            );
            false
        }
    }
}
