//! The shared error taxonomy every fallible cortexd operation returns.

use serde::{Deserialize, Serialize};

/// Classifies a [`CortexError`] into the result-variant kind the spec's
/// component contracts are written against, independent of the concrete
/// variant — lets the HTTP layer map any error to a status code with one
/// match instead of one per producing crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MarkerMismatch,
    InvalidInput,
    EntityNotFound,
    ValidationError,
    IoError,
    TenantDenied,
    RateLimited,
    SessionGone,
}

/// The concrete error type returned by storage, retrieval, and transport
/// operations across the workspace.
#[derive(Debug, thiserror::Error)]
pub enum CortexError {
    #[error("log marker missing or invalid: {0}")]
    MarkerMismatch(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("io error: {0}")]
    IoError(String),

    #[error("tenant access denied")]
    TenantDenied,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("session not found or expired")]
    SessionGone,
}

impl CortexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CortexError::MarkerMismatch(_) => ErrorKind::MarkerMismatch,
            CortexError::InvalidInput(_) => ErrorKind::InvalidInput,
            CortexError::EntityNotFound(_) => ErrorKind::EntityNotFound,
            CortexError::ValidationError(_) => ErrorKind::ValidationError,
            CortexError::IoError(_) => ErrorKind::IoError,
            CortexError::TenantDenied => ErrorKind::TenantDenied,
            CortexError::RateLimited { .. } => ErrorKind::RateLimited,
            CortexError::SessionGone => ErrorKind::SessionGone,
        }
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        CortexError::InvalidInput(msg.into())
    }

    pub fn entity_not_found(reference: impl Into<String>) -> Self {
        CortexError::EntityNotFound(reference.into())
    }
}

impl From<std::io::Error> for CortexError {
    fn from(err: std::io::Error) -> Self {
        CortexError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CortexError {
    fn from(err: serde_json::Error) -> Self {
        CortexError::ValidationError(err.to_string())
    }
}

/// Shorthand for `Result<T, CortexError>`, used throughout the workspace.
pub type CortexResult<T> = Result<T, CortexError>;
