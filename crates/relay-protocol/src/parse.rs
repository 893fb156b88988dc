//! Decoding broker message bodies.
//!
//! A body is a UTF-8 JSON object with two required string fields:
//!
//! ```json
//! {"target": "alice", "payload": "..."}
//! ```
//!
//! An empty `target` addresses every connected peer. Unknown fields are
//! ignored so producers can add metadata without breaking the relay.

use relay_core::Message;
use serde::Deserialize;
use thiserror::Error;

/// Raw broker body as produced upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBrokerMessage {
    pub target: String,
    pub payload: String,
}

impl RawBrokerMessage {
    pub fn into_message(self) -> Message {
        Message::new(self.target, self.payload)
    }
}

/// Reasons a broker body could not be turned into a [`Message`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("body is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("body is not a valid message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decodes a raw broker body into a [`Message`].
pub fn decode_body(body: &[u8]) -> Result<Message, DecodeError> {
    let text = std::str::from_utf8(body)?;
    let raw: RawBrokerMessage = serde_json::from_str(text)?;
    Ok(raw.into_message())
}
