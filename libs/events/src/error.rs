//! Error types for bus message handling.

use thiserror::Error;

/// Errors that can occur when decoding bus messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The message payload is not valid JSON for the expected shape.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The payload decoded but is missing something required.
    #[error("invalid message payload: {0}")]
    InvalidPayload(String),

    /// A routing-table sharding mode name was not recognised.
    #[error("unknown sharding mode: {0}")]
    UnknownShardingMode(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
