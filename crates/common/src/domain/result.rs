use std::time::Duration;
use thiserror::Error;

use crate::domain::CommandId;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Unexpected event type: {0}")]
    UnknownEventType(String),

    #[error("Envelope is missing the {0} property")]
    MissingProperty(&'static str),

    #[error("Unsupported compression algorithm: {0}")]
    UnsupportedCompression(String),

    #[error("Single event is too big: {size} bytes exceeds the limit of {max} bytes")]
    EventTooLarge { size: usize, max: usize },

    #[error("Batch for command {expected} cannot hold an event for command {actual}")]
    CommandIdMismatch {
        expected: CommandId,
        actual: CommandId,
    },

    #[error("Invalid event: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unable to publish to any endpoint: {0:#}")]
    PublishFailed(#[source] anyhow::Error),

    #[error("Checkpoint did not complete within {0:?}")]
    CheckpointTimeout(Duration),

    #[error("Failed to externalize {count} failed messages: {source:#}")]
    RetryExternalizationFailed {
        count: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Transport error: {0:#}")]
    Transport(#[from] anyhow::Error),
}

impl LifecycleError {
    /// Errors that mean the caller's code or configuration is wrong; retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LifecycleError::EventTooLarge { .. }
                | LifecycleError::CommandIdMismatch { .. }
                | LifecycleError::Configuration(_)
                | LifecycleError::CheckpointTimeout(_)
        )
    }
}
