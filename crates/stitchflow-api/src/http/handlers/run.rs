//! Pipeline-run handlers: trigger, inspect, cancel, pause.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use stitchflow_core::graph::legacy::into_definition;
use stitchflow_core::repository::RunRepository;
use stitchflow_types::pipeline::PipelineSource;
use stitchflow_types::run::{StepRecord, TaskRecord};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Request body for triggering a run.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRunRequest {
    /// Pipeline definition: graph JSON or legacy step array.
    pub definition: Value,
    /// Caller inputs seeding the `form.*` scope.
    #[serde(default)]
    pub form: Map<String, Value>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// POST /api/v1/pipelines/runs - Trigger a pipeline run.
///
/// Format detection follows the definition shape: a JSON array is the legacy
/// linear format, an object with `nodes` and `edges` is graph form. The run
/// executes in the background; the response carries the run id immediately.
pub async fn trigger_run(
    State(state): State<AppState>,
    Json(request): Json<TriggerRunRequest>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let source = PipelineSource::from_value(&request.definition).map_err(AppError::Validation)?;
    let definition = into_definition(source);
    let run_id = Uuid::now_v7();
    let user_id = request.user_id.unwrap_or_else(|| "anonymous".to_string());

    tracing::info!(
        run_id = %run_id,
        pipeline = definition.name.as_str(),
        user_id = user_id.as_str(),
        "pipeline run submitted"
    );

    // Background execution; the engine persists every state transition.
    let engine = Arc::clone(&state.engine);
    let form = request.form;
    tokio::spawn(async move {
        match engine.execute_run(run_id, &definition, form, &user_id).await {
            Ok(result) => {
                tracing::info!(
                    run_id = %result.run_id,
                    status = result.status.as_str(),
                    "pipeline run settled"
                );
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "pipeline run failed to start");
            }
        }
    });

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(
        json!({ "runId": run_id, "status": "submitted" }),
        request_id,
        elapsed,
    )
    .with_link("run", &format!("/api/v1/runs/{run_id}"))
    .with_link("steps", &format!("/api/v1/runs/{run_id}/steps"));

    Ok(Json(resp))
}

/// GET /api/v1/runs/{id} - Run status and state snapshot.
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<TaskRecord>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let run = state
        .repo
        .get_run(&id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("run {id} not found")))?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(run, request_id, elapsed)
            .with_link("steps", &format!("/api/v1/runs/{id}/steps")),
    ))
}

/// GET /api/v1/runs/{id}/steps - Dispatched async steps of a run.
pub async fn list_run_steps(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<StepRecord>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state
        .repo
        .get_run(&id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("run {id} not found")))?;

    let steps = state
        .repo
        .list_steps(&id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(steps, request_id, elapsed)))
}

/// POST /api/v1/runs/{id}/cancel - Cancel a run.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.engine.cancel(id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(
        json!({ "runId": id, "status": "cancelled" }),
        request_id,
        elapsed,
    )))
}

/// POST /api/v1/runs/{id}/pause - Pause a run.
///
/// Stops new dispatch; already-dispatched async steps still get reconciled.
pub async fn pause_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.engine.pause(id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(
        json!({ "runId": id, "status": "paused" }),
        request_id,
        elapsed,
    )))
}
