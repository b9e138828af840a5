use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BalerError {
    /// Network, store or model hiccup worth another attempt.
    #[error("{operation} failed: {message}")]
    Transient { operation: String, message: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("{operation} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: usize,
        last: String,
    },

    /// Model or store setup that cannot be fixed by retrying.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("rejected document {source_id}: {reason}")]
    DataQuality { source_id: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = BalerError> = std::result::Result<T, E>;

impl BalerError {
    pub fn transient(operation: impl Into<String>, err: impl Display) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn data_quality(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DataQuality {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
