use axum::extract::State;
use axum::{routing::get, Json, Router};
use gridflow_core::worker::WorkerInfo;
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Worker processes currently running.
    pub live_workers: usize,
    /// One entry per running worker, oldest first.
    pub workers: Vec<WorkerInfo>,
}

/// GET /health -- returns service status and worker load.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let workers = state.orchestrator.supervisor().live_workers();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        live_workers: workers.len(),
        workers,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
