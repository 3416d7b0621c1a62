pub mod health;
pub mod jobs;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /ws                                  WebSocket push channel
///
/// /{domain}/start                      start a job (POST)
/// /{domain}/status/{job_id}            job snapshot (GET)
/// /{domain}/{job_id}/cancel            cancel a job (POST)
/// /{domain}/jobs                       list jobs (GET)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .merge(jobs::router())
}
