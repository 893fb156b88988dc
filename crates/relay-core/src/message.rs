//! Messages relayed from the broker and the claims that admit a peer.

use crate::Identity;

/// A decoded broker message.
///
/// An empty `target` means broadcast. Messages are immutable once built;
/// the consumer creates them and the dispatcher consumes each exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    target: String,
    payload: String,
}

/// Where a message is going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Every registered peer
    Broadcast,
    /// Exactly one peer
    Targeted(Identity),
}

impl Message {
    pub fn new(target: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            payload: payload.into(),
        }
    }

    /// Creates a message addressed to every connected peer.
    pub fn broadcast(payload: impl Into<String>) -> Self {
        Self::new(String::new(), payload)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Returns true when the target is empty.
    pub fn is_broadcast(&self) -> bool {
        self.target.is_empty()
    }

    /// Resolves the delivery route for this message.
    pub fn route(&self) -> Route {
        if self.is_broadcast() {
            Route::Broadcast
        } else {
            Route::Targeted(Identity::new(self.target.clone()))
        }
    }

    /// Consumes the message, returning its payload.
    pub fn into_payload(self) -> String {
        self.payload
    }
}

/// Verified claims extracted from a peer's authentication token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub identity: Identity,
}

impl TokenClaims {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_target_is_broadcast() {
        let msg = Message::new("", "ping");
        assert!(msg.is_broadcast());
        assert_eq!(msg.route(), Route::Broadcast);
    }

    #[test]
    fn test_named_target_is_targeted() {
        let msg = Message::new("alice", "hi");
        assert!(!msg.is_broadcast());
        assert_eq!(msg.route(), Route::Targeted(Identity::new("alice")));
        assert_eq!(msg.into_payload(), "hi");
    }

    #[test]
    fn test_whitespace_target_is_not_broadcast() {
        // Only the exact empty string means broadcast
        let msg = Message::new(" ", "x");
        assert_eq!(msg.route(), Route::Targeted(Identity::new(" ")));
    }
}
