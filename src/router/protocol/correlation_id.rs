//! Correlation and reply-address identifiers.
//!
//! Both are opaque strings on the wire. The newtypes keep them from being
//! confused with each other or with queue names in function signatures.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Token linking a request to its eventual reply.
///
/// Generated per call from a ULID, so ids stay unique across concurrently
/// outstanding calls and sort by creation time in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh correlation id.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extract the `correlation_id` field from a JSON envelope body.
    ///
    /// Used when a message arrives without the correlation property set.
    pub(crate) fn from_json_body(body: &[u8]) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_slice(body).ok()?;
        value
            .get("correlation_id")?
            .as_str()
            .map(|s| Self(s.to_string()))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Name of the channel a reply must be published to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplyAddress(String);

impl ReplyAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplyAddress {
    fn from(address: &str) -> Self {
        Self(address.to_string())
    }
}

impl From<String> for ReplyAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}
