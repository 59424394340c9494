//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`. Middleware: CORS, tracing.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Pipeline runs
        .route("/pipelines/runs", post(handlers::run::trigger_run))
        .route("/runs/{id}", get(handlers::run::get_run))
        .route("/runs/{id}/steps", get(handlers::run::list_run_steps))
        .route("/runs/{id}/cancel", post(handlers::run::cancel_run))
        .route("/runs/{id}/pause", post(handlers::run::pause_run))
        // Completion callbacks from external workers
        .route(
            "/callbacks/steps",
            post(handlers::callback::receive_step_callback),
        )
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
