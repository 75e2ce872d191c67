//! Core Error Types
//!
//! Errors raised by the result model and event contracts. Kept to
//! thiserror + std so the core crate stays free of runtime concerns.
//!
//! The application crate wraps these in `AppError` alongside the
//! admission and run-level error kinds.

use thiserror::Error;

/// Core error type for the Insight Desktop workspace.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Validation errors (malformed item input)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Parse errors (unknown item type, source, or error code)
    #[error("Parse error: {0}")]
    Parse(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for core errors
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<CoreError> for String {
    fn from(err: CoreError) -> String {
        err.to_string()
    }
}
