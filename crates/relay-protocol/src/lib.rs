//! Relay Protocol - Wire formats on both sides of the relay
//!
//! - [`parse`] decodes message bodies pulled from the broker queue
//! - [`envelope`] encodes the frames pushed to connected peers

pub mod envelope;
pub mod parse;

pub use envelope::Envelope;
pub use parse::{decode_body, DecodeError, RawBrokerMessage};
