//! Handlers for the per-domain job resource.
//!
//! Every route is nested under `/{domain}`, where `domain` is one of
//! `forecast`, `profile`, or `optimization`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use gridflow_core::domain::Domain;
use gridflow_core::error::CoreError;
use gridflow_core::types::JobId;
use serde::Serialize;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::response;
use crate::state::AppState;

/// Body of a successful start.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedJob {
    pub job_id: JobId,
}

/// Body of a cancel acknowledgement.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAck {
    pub job_id: JobId,
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_domain(raw: &str) -> AppResult<Domain> {
    Ok(raw.parse::<Domain>()?)
}

/// A malformed id cannot name an existing job.
fn parse_job_id(raw: &str) -> AppResult<JobId> {
    raw.parse::<JobId>().map_err(|_| {
        CoreError::NotFound {
            entity: "Job",
            id: raw.to_string(),
        }
        .into()
    })
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

/// POST /api/v1/{domain}/start
///
/// Accept a job with the given config object and start its worker.
/// Returns 201 with the new job id; progress is pushed over the WebSocket
/// channel and readable via the status route.
pub async fn start_job(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let domain = parse_domain(&domain)?;
    let Json(config) = body.map_err(AppError::from)?;
    if !config.is_object() {
        return Err(CoreError::Validation("config must be a JSON object".into()).into());
    }

    let job_id = state.orchestrator.start_job(domain, config).await?;
    tracing::info!(job_id = %job_id, domain = %domain, "Job started");

    Ok(response::created(StartedJob { job_id }))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// GET /api/v1/{domain}/status/{job_id}
pub async fn get_status(
    State(state): State<AppState>,
    Path((domain, job_id)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let domain = parse_domain(&domain)?;
    let job_id = parse_job_id(&job_id)?;
    let record = state.orchestrator.status(domain, job_id).await?;
    Ok(response::ok(record))
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

/// GET /api/v1/{domain}/jobs
///
/// Every job of the domain, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> AppResult<impl IntoResponse> {
    let domain = parse_domain(&domain)?;
    let jobs = state.orchestrator.list(domain).await;
    Ok(response::ok(jobs))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/{domain}/{job_id}/cancel
///
/// `cancelled` is false when the job had already reached a terminal state.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path((domain, job_id)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let domain = parse_domain(&domain)?;
    let job_id = parse_job_id(&job_id)?;
    let cancelled = state.orchestrator.cancel_job(domain, job_id).await?;
    Ok(response::ok(CancelAck { job_id, cancelled }))
}
