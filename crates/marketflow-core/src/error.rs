//! Error types for marketflow-core
//!
//! Manager-level errors (`Validation`, `NotFound`, `Conflict`) are returned
//! synchronously to callers of the control surface. Runner-level errors never
//! propagate out of the runner task; they are recorded on the operation and
//! published as `step:failed` / `operation:failed` events.

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request rejected at `start`; no operation is created
    #[error("validation error in '{field}': {message}")]
    Validation {
        /// Offending request field
        field: String,
        /// Detailed message
        message: String,
    },

    /// Operation (or other resource) does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Request conflicts with the current state (e.g. deleting a running operation)
    #[error("conflict: {0}")]
    Conflict(String),

    /// A step executor failed after its retries were exhausted
    #[error("execution error in step '{step}' ({code}): {message}")]
    Execution {
        /// Step name
        step: String,
        /// Machine-readable error code
        code: String,
        /// Error description
        message: String,
    },

    /// Operation was stopped by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Internal error (channel closed, serialization, etc.)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Machine-readable code, used for wire `error` messages and HTTP mapping.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Execution { .. } => "EXECUTION_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {}", err))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
