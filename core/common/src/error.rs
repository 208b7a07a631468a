//! Common error types for TradeSync.

use thiserror::Error;

use crate::types::FailureClass;

/// Top-level error type for TradeSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency collision. The caller must reread current
    /// state and decide whether to retry its own step; the store never
    /// retries on its behalf.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Cancellation requested for a run that is already terminal.
    #[error("Not cancellable: {0}")]
    NotCancellable(String),

    /// Queue operation failed.
    #[error("Queue error: {0}")]
    Queue(String),

    /// The external system rejected or failed a call.
    #[error("External system error ({class}): {message}")]
    External {
        class: FailureClass,
        message: String,
    },

    /// Durable store operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Build a transient external-system error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::External {
            class: FailureClass::Transient,
            message: message.into(),
        }
    }

    /// Build a permanent external-system error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::External {
            class: FailureClass::Permanent,
            message: message.into(),
        }
    }

    /// The failure class of an external error, if this is one.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            Self::External { class, .. } => Some(*class),
            _ => None,
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
