//! Completion-callback receiver.
//!
//! POST /api/v1/callbacks/steps -- invoked by external compute workers when
//! an async step finishes. There is no auth header; trust derives solely
//! from the HMAC signature over the body, verified by the reconciler. The
//! response shape `{success, message}` is part of the worker contract and
//! bypasses the envelope format.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use stitchflow_core::reconcile::ReconcileError;
use stitchflow_types::callback::{CallbackResponse, StepCallback};

use crate::state::AppState;

/// POST /api/v1/callbacks/steps - Reconcile one step completion.
pub async fn receive_step_callback(State(state): State<AppState>, body: Bytes) -> Response {
    let callback: StepCallback = match serde_json::from_slice(&body) {
        Ok(callback) => callback,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(CallbackResponse::rejected(format!("invalid callback body: {e}"))),
            )
                .into_response();
        }
    };

    match state.reconciler.handle(&callback).await {
        Ok(outcome) => {
            let message = if outcome.already_terminal {
                "step already reconciled".to_string()
            } else if outcome.resumed {
                "step reconciled; run resumed".to_string()
            } else {
                format!("step reconciled; run {}", outcome.run_status.as_str())
            };
            (StatusCode::OK, Json(CallbackResponse::ok(message))).into_response()
        }
        Err(e) => {
            let status = match &e {
                ReconcileError::SignatureInvalid => StatusCode::FORBIDDEN,
                ReconcileError::TimestampExpired { .. } | ReconcileError::MissingField(_) => {
                    StatusCode::BAD_REQUEST
                }
                ReconcileError::TaskNotFound(_) | ReconcileError::StepNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                ReconcileError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let message = match e.error_kind() {
                Some(kind) => format!("{kind}: {e}"),
                None => e.to_string(),
            };
            tracing::warn!(status = %status, message = message.as_str(), "callback rejected");
            (status, Json(CallbackResponse::rejected(message))).into_response()
        }
    }
}
