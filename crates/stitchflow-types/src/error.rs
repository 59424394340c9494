//! Closed error taxonomy for pipeline execution.
//!
//! Node executors never panic or throw across the executor boundary: every
//! failure is a structured [`NodeError`] carrying one of the closed
//! [`ErrorKind`] variants. The execution engine is the sole retry-vs-fail
//! decision point and consults a node's `retryable_errors` allowlist against
//! these kinds.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of error kinds surfaced by node executors and the callback layer.
///
/// Wire format is SCREAMING_SNAKE_CASE (e.g. `PROVIDER_ERROR`), matching the
/// `retryable_errors` lists stored in pipeline definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidConfig,
    MissingInput,
    ExecutionFailed,
    Timeout,
    RetryExhausted,
    ProviderError,
    ToolError,
    KbRetrieveError,
    InternalError,
    // Callback-layer kinds (reconciliation rejections).
    SignatureInvalid,
    TimestampExpired,
    TaskNotFound,
    StepNotFound,
}

impl ErrorKind {
    /// Wire name of this kind (`PROVIDER_ERROR` etc.).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidConfig => "INVALID_CONFIG",
            ErrorKind::MissingInput => "MISSING_INPUT",
            ErrorKind::ExecutionFailed => "EXECUTION_FAILED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::RetryExhausted => "RETRY_EXHAUSTED",
            ErrorKind::ProviderError => "PROVIDER_ERROR",
            ErrorKind::ToolError => "TOOL_ERROR",
            ErrorKind::KbRetrieveError => "KB_RETRIEVE_ERROR",
            ErrorKind::InternalError => "INTERNAL_ERROR",
            ErrorKind::SignatureInvalid => "SIGNATURE_INVALID",
            ErrorKind::TimestampExpired => "TIMESTAMP_EXPIRED",
            ErrorKind::TaskNotFound => "TASK_NOT_FOUND",
            ErrorKind::StepNotFound => "STEP_NOT_FOUND",
        }
    }

    /// Kinds that are never retried regardless of a node's allowlist:
    /// re-running a misconfigured node cannot change the outcome.
    pub fn is_never_retryable(&self) -> bool {
        matches!(self, ErrorKind::InvalidConfig | ErrorKind::MissingInput)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured executor error: a closed kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, message)
    }

    pub fn missing_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingInput, message)
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionFailed, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderError, message)
    }

    pub fn kb_retrieve(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::KbRetrieveError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }
}

/// Errors from repository operations (used by trait definitions in stitchflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_wire_names() {
        assert_eq!(ErrorKind::InvalidConfig.as_str(), "INVALID_CONFIG");
        assert_eq!(ErrorKind::KbRetrieveError.as_str(), "KB_RETRIEVE_ERROR");
        assert_eq!(ErrorKind::SignatureInvalid.as_str(), "SIGNATURE_INVALID");
    }

    #[test]
    fn test_error_kind_serde_roundtrip() {
        for kind in [
            ErrorKind::InvalidConfig,
            ErrorKind::MissingInput,
            ErrorKind::ExecutionFailed,
            ErrorKind::Timeout,
            ErrorKind::RetryExhausted,
            ErrorKind::ProviderError,
            ErrorKind::ToolError,
            ErrorKind::KbRetrieveError,
            ErrorKind::InternalError,
            ErrorKind::SignatureInvalid,
            ErrorKind::TimestampExpired,
            ErrorKind::TaskNotFound,
            ErrorKind::StepNotFound,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let parsed: ErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_never_retryable_kinds() {
        assert!(ErrorKind::InvalidConfig.is_never_retryable());
        assert!(ErrorKind::MissingInput.is_never_retryable());
        assert!(!ErrorKind::ProviderError.is_never_retryable());
        assert!(!ErrorKind::Timeout.is_never_retryable());
    }

    #[test]
    fn test_node_error_display() {
        let err = NodeError::provider("upstream returned 503");
        assert_eq!(err.to_string(), "PROVIDER_ERROR: upstream returned 503");
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }
}
