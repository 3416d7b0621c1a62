use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gridflow_core::worker::WorkerSupervisor;
use gridflow_events::ProgressRelay;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridflow_api::config::{ServerConfig, WorkerConfig};
use gridflow_api::jobs::JobOrchestrator;
use gridflow_api::router::build_app_router;
use gridflow_api::state::AppState;
use gridflow_api::ws;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "gridflow_api=debug,gridflow_core=debug,tower_http=debug".into()
            }),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    let worker_config = WorkerConfig::from_env();
    tracing::info!(
        max_workers = worker_config.max_workers,
        worker_dir = %worker_config.worker_dir.display(),
        interpreter = %worker_config.interpreter,
        "Loaded worker configuration",
    );
    let grace_period = worker_config.grace_period;

    // --- Worker supervisor ---
    let supervisor = Arc::new(WorkerSupervisor::new(worker_config.supervisor_config()));

    // --- Progress relay + heartbeat ---
    let relay = Arc::new(ProgressRelay::new());
    let heartbeat_stop = CancellationToken::new();
    let heartbeat_handle = ws::start_heartbeat(
        Arc::clone(&relay),
        Duration::from_secs(config.heartbeat_interval_secs),
        heartbeat_stop.clone(),
    );

    // --- Orchestrator ---
    let orchestrator = Arc::new(JobOrchestrator::new(
        Arc::clone(&supervisor),
        Arc::clone(&relay),
        worker_config.timeouts,
    ));

    // --- App state ---
    let state = AppState {
        orchestrator,
        relay: Arc::clone(&relay),
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // Workers first, so their final events still reach observers.
    supervisor
        .shutdown(grace_period * 2 + Duration::from_secs(1))
        .await;

    let observer_count = relay.connection_count().await;
    tracing::info!(observer_count, "Closing remaining WebSocket connections");
    relay.shutdown_all().await;

    heartbeat_stop.cancel();
    if let Err(e) = heartbeat_handle.await {
        tracing::warn!(error = %e, "Heartbeat task ended abnormally");
    }

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
