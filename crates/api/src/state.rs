use std::sync::Arc;

use gridflow_events::ProgressRelay;

use crate::jobs::JobOrchestrator;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Job ledgers and the worker supervisor behind them.
    pub orchestrator: Arc<JobOrchestrator>,
    /// Push channel fan-out for observer connections.
    pub relay: Arc<ProgressRelay>,
}
