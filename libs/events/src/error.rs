//! Error types for progress events.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// A required builder field was not set.
    #[error("missing event field: {0}")]
    MissingField(&'static str),

    #[error("task index {index} out of range for stage of {total}")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
