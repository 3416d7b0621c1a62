//! Route definitions for the per-domain job resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::jobs;
use crate::state::AppState;

/// Job routes, mounted directly under `/api/v1`.
///
/// ```text
/// POST   /{domain}/start              -> start_job
/// GET    /{domain}/status/{job_id}    -> get_status
/// POST   /{domain}/{job_id}/cancel    -> cancel_job
/// GET    /{domain}/jobs               -> list_jobs
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{domain}/start", post(jobs::start_job))
        .route("/{domain}/status/{job_id}", get(jobs::get_status))
        .route("/{domain}/{job_id}/cancel", post(jobs::cancel_job))
        .route("/{domain}/jobs", get(jobs::list_jobs))
}
