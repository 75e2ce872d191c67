//! Error Handling
//!
//! Unified error types for the application.
//! Uses thiserror for ergonomic error definitions.

use insight_core::{CoreError, ErrorCode};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Waited for an admission slot longer than the configured bound
    #[error("Timed out waiting for an analysis slot after {waited_secs}s ({active} running)")]
    AdmissionTimeout { waited_secs: u64, active: usize },

    /// Cancel requested while waiting for an admission slot
    #[error("Analysis cancelled while waiting in the queue")]
    AdmissionCancelled,

    /// Cancel observed while the analysis was running
    #[error("Analysis cancelled by user")]
    RunCancelled,

    /// The analysis task panicked
    #[error("Analysis panicked: {0}")]
    RunPanic(String),

    /// The analysis returned an error
    #[error("Analysis failed: {0}")]
    RunFailed(String),

    /// The result store rejected a finished batch
    #[error("Failed to persist analysis results: {0}")]
    PersistFailed(String),

    /// Cancel requested with no analysis in flight
    #[error("no analysis is currently running")]
    NothingRunning,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors raised by the core crate
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Create a run failure
    pub fn run_failed(msg: impl Into<String>) -> Self {
        Self::RunFailed(msg.into())
    }

    /// Create a persistence failure
    pub fn persist_failed(msg: impl Into<String>) -> Self {
        Self::PersistFailed(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for both admission-time and run-time cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::AdmissionCancelled | Self::RunCancelled)
    }

    /// User-facing code for this error.
    ///
    /// Run failures are classified from their message, everything else maps
    /// directly.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::AdmissionTimeout { .. } => ErrorCode::QueueTimeout,
            Self::AdmissionCancelled => ErrorCode::QueueCancelled,
            Self::RunCancelled => ErrorCode::AnalysisCancelled,
            Self::RunPanic(_) => ErrorCode::AnalysisError,
            Self::RunFailed(msg) => insight_core::classify_failure(msg),
            Self::PersistFailed(_) => ErrorCode::DatabaseError,
            Self::NothingRunning => ErrorCode::ResourceNotFound,
            Self::Config(_) | Self::Validation(_) => ErrorCode::DataInvalid,
            Self::NotFound(_) => ErrorCode::ResourceNotFound,
            Self::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorCode::PermissionDenied
            }
            Self::Io(_) | Self::Serialization(_) | Self::Core(_) | Self::Internal(_) => {
                ErrorCode::AnalysisError
            }
        }
    }
}

/// Convert AppError to a string suitable for command responses
impl From<AppError> for String {
    fn from(err: AppError) -> String {
        err.to_string()
    }
}
