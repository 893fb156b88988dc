//! Relay Core - Shared domain types for notify-relay
//!
//! This crate provides the types that flow through the relay pipeline:
//! the decoded broker [`Message`], the recipient [`Identity`], and the
//! [`TokenClaims`] produced by connection authentication.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod identity;
pub mod message;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use identity::Identity;
pub use message::{Message, Route, TokenClaims};
