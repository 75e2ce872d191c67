//! Error Codes and Recovery Suggestions
//!
//! User-facing classification of analysis failures. Each code carries a short
//! default message and a list of things the user can try next; the UI shows
//! both alongside the technical details.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::result_item::now_millis;

/// Category of an analysis failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AnalysisError,
    AnalysisTimeout,
    AnalysisCancelled,
    QueueTimeout,
    QueueCancelled,
    PythonExecution,
    PythonSyntax,
    PythonImport,
    PythonMemory,
    DataNotFound,
    DataInvalid,
    DataEmpty,
    DataTooLarge,
    ConnectionFailed,
    ConnectionTimeout,
    PermissionDenied,
    ResourceBusy,
    ResourceNotFound,
    DatabaseError,
    LlmError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AnalysisError => "ANALYSIS_ERROR",
            ErrorCode::AnalysisTimeout => "ANALYSIS_TIMEOUT",
            ErrorCode::AnalysisCancelled => "ANALYSIS_CANCELLED",
            ErrorCode::QueueTimeout => "QUEUE_TIMEOUT",
            ErrorCode::QueueCancelled => "QUEUE_CANCELLED",
            ErrorCode::PythonExecution => "PYTHON_EXECUTION",
            ErrorCode::PythonSyntax => "PYTHON_SYNTAX",
            ErrorCode::PythonImport => "PYTHON_IMPORT",
            ErrorCode::PythonMemory => "PYTHON_MEMORY",
            ErrorCode::DataNotFound => "DATA_NOT_FOUND",
            ErrorCode::DataInvalid => "DATA_INVALID",
            ErrorCode::DataEmpty => "DATA_EMPTY",
            ErrorCode::DataTooLarge => "DATA_TOO_LARGE",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::ResourceBusy => "RESOURCE_BUSY",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::LlmError => "LLM_ERROR",
        }
    }

    /// Short message shown when no better text is available.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::AnalysisError => "An error occurred during analysis",
            ErrorCode::AnalysisTimeout => "Analysis timed out, please try again later",
            ErrorCode::AnalysisCancelled => "Analysis cancelled",
            ErrorCode::QueueTimeout => "Timed out waiting for an analysis slot",
            ErrorCode::QueueCancelled => "Analysis cancelled while waiting in the queue",
            ErrorCode::PythonExecution => "Code execution failed",
            ErrorCode::PythonSyntax => "Generated code has a syntax error",
            ErrorCode::PythonImport => "A required analysis library is missing",
            ErrorCode::PythonMemory => "Out of memory, the data set may be too large",
            ErrorCode::DataNotFound => "The requested data was not found",
            ErrorCode::DataInvalid => "The data format is invalid",
            ErrorCode::DataEmpty => "The query returned no data",
            ErrorCode::DataTooLarge => "The data exceeds the size limit",
            ErrorCode::ConnectionFailed => "Connection failed, please check the network",
            ErrorCode::ConnectionTimeout => "Connection timed out",
            ErrorCode::PermissionDenied => "Permission denied",
            ErrorCode::ResourceBusy => "The resource is busy, please try again later",
            ErrorCode::ResourceNotFound => "The resource was not found",
            ErrorCode::DatabaseError => "A database query failed",
            ErrorCode::LlmError => "The language model request failed",
        }
    }

    /// What the user can try next.
    pub fn recovery_suggestions(&self) -> Vec<String> {
        let suggestions: &[&str] = match self {
            ErrorCode::AnalysisError => &[
                "Check that the question is clear and specific",
                "Try simplifying the query conditions",
                "If the problem persists, reload and try again",
            ],
            ErrorCode::AnalysisTimeout => &[
                "Simplify the query or narrow the data range",
                "Check that the network connection is stable",
                "Try again later, other tasks may be running",
            ],
            ErrorCode::AnalysisCancelled => &[
                "You can start the analysis again",
                "If this was a mistake, submit the same question again",
            ],
            ErrorCode::QueueTimeout => &[
                "Wait for running analyses to finish, then try again",
                "Raise the concurrent analysis limit in settings",
            ],
            ErrorCode::QueueCancelled => &["You can start the analysis again"],
            ErrorCode::PythonExecution => &[
                "Check that the data format is correct",
                "Try a different analysis approach",
                "If the problem persists, contact support",
            ],
            ErrorCode::PythonSyntax => &[
                "The generated code had a syntax problem",
                "Try describing the analysis differently",
                "Use a simpler question",
            ],
            ErrorCode::PythonImport => &[
                "A required analysis library may not be installed",
                "Ask an administrator to check the environment",
                "Try another analysis method",
            ],
            ErrorCode::PythonMemory => &[
                "Reduce the query range",
                "Process the data in smaller batches",
                "Try again later while resources are released",
            ],
            ErrorCode::DataNotFound => &[
                "Check that the data source is configured",
                "Confirm the table and column names",
                "Check whether the data was moved or deleted",
            ],
            ErrorCode::DataInvalid => &[
                "Check that the data format meets the requirements",
                "Confirm the column data types",
                "Try cleaning or re-importing the data",
            ],
            ErrorCode::DataEmpty => &[
                "No data matches the current conditions",
                "Try adjusting the filters",
                "Check that the data source contains the data you need",
            ],
            ErrorCode::DataTooLarge => &[
                "Reduce the data range",
                "Add more filters",
                "Consider paging or batching the query",
            ],
            ErrorCode::ConnectionFailed => &[
                "Check the network connection",
                "Confirm the service is running",
                "Try again later",
            ],
            ErrorCode::ConnectionTimeout => &[
                "Check the network status",
                "The service may be busy, try again later",
                "If the problem persists, contact support",
            ],
            ErrorCode::PermissionDenied => &[
                "You may not have access to this resource",
                "Ask an administrator for permission",
                "Check your account status",
            ],
            ErrorCode::ResourceBusy => &[
                "The resource is used by another task",
                "Try again later",
                "If the problem persists, contact support",
            ],
            ErrorCode::ResourceNotFound => &[
                "Check the resource path",
                "Confirm the resource was not deleted",
                "Ask an administrator to check the resource",
            ],
            ErrorCode::DatabaseError => &[
                "Check that the data source is reachable",
                "Confirm the table and column names",
            ],
            ErrorCode::LlmError => &[
                "Check the model provider settings and API key",
                "Try again later",
            ],
        };
        suggestions.iter().map(|s| s.to_string()).collect()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guess a code for a free-form failure message from the analysis engine.
pub fn classify_failure(message: &str) -> ErrorCode {
    let lower = message.to_lowercase();
    let has = |needle: &str| lower.contains(needle);

    if has("cancelled by user") || has("cancelled while waiting") {
        ErrorCode::AnalysisCancelled
    } else if has("timeout") || has("timed out") || has("deadline exceeded") {
        ErrorCode::AnalysisTimeout
    } else if has("connection") || has("network") {
        ErrorCode::ConnectionFailed
    } else if has("database") || has("sqlite") || has("sql") {
        ErrorCode::DatabaseError
    } else if has("memoryerror") || has("out of memory") {
        ErrorCode::PythonMemory
    } else if has("syntaxerror") {
        ErrorCode::PythonSyntax
    } else if has("modulenotfounderror") || has("importerror") {
        ErrorCode::PythonImport
    } else if has("python") {
        ErrorCode::PythonExecution
    } else if has("llm") || has("api") || has("model") {
        ErrorCode::LlmError
    } else {
        ErrorCode::AnalysisError
    }
}

/// Detailed, user-presentable error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    pub details: String,
    pub recovery_suggestions: Vec<String>,
    pub timestamp: i64,
}

impl ErrorInfo {
    /// Build error info for `code`. An empty `message` falls back to the
    /// code's default message.
    pub fn new(code: ErrorCode, message: impl Into<String>, details: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            code.default_message().to_string()
        } else {
            message
        };
        Self {
            code,
            message,
            details: details.into(),
            recovery_suggestions: code.recovery_suggestions(),
            timestamp: now_millis(),
        }
    }
}
