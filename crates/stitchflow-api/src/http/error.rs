//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use stitchflow_core::engine::EngineError;
use stitchflow_core::graph::CompileError;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Request validation failure.
    Validation(String),
    /// Referenced entity does not exist.
    NotFound(String),
    /// Engine-level failure.
    Engine(EngineError),
    /// Generic internal error.
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Engine(EngineError::Compile(e @ CompileError::InvalidConfig { .. })) => {
                (StatusCode::BAD_REQUEST, "INVALID_CONFIG", e.to_string())
            }
            AppError::Engine(EngineError::Compile(e)) => {
                (StatusCode::BAD_REQUEST, "INVALID_PIPELINE", e.to_string())
            }
            AppError::Engine(EngineError::RunNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "RUN_NOT_FOUND",
                format!("run {id} not found"),
            ),
            AppError::Engine(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ENGINE_ERROR", e.to_string())
            }
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        };

        let body = json!({
            "data": null,
            "meta": {
                "request_id": "",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "response_time_ms": 0
            },
            "errors": [{
                "code": code,
                "message": message,
            }]
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
