//! Response Types
//!
//! Standard response types for the command layer.

use serde::{Deserialize, Serialize};

use crate::utils::error::AppError;

/// Generic command response for all commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    /// Error code for the UI, e.g. `QUEUE_TIMEOUT`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl<T> CommandResponse<T> {
    /// Create a successful response with data
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    /// Create an error response with message
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            code: None,
        }
    }
}

impl<T> From<Result<T, AppError>> for CommandResponse<T> {
    fn from(result: Result<T, AppError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self {
                code: Some(e.error_code().to_string()),
                ..Self::err(e.to_string())
            },
        }
    }
}

/// Returned when an analysis is submitted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub request_id: String,
    pub session_id: String,
}
