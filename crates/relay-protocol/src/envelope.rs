//! Outbound envelopes delivered to connected peers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamped delivery unit, sent as one text frame.
///
/// Serialized as `{"dt": "<RFC 3339 UTC>", "payload": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub dt: String,
    pub payload: String,
}

impl Envelope {
    /// Wraps a payload with the current UTC time.
    pub fn now(payload: impl Into<String>) -> Self {
        Self::at(Utc::now(), payload)
    }

    /// Wraps a payload with an explicit timestamp.
    pub fn at(dt: DateTime<Utc>, payload: impl Into<String>) -> Self {
        Self {
            dt: dt.to_rfc3339(),
            payload: payload.into(),
        }
    }

    /// Parses the `dt` field back into a timestamp.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.dt)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Encodes the envelope as a JSON text frame body.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
