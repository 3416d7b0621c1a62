#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use gridflow_core::domain::Domain;
use gridflow_core::worker::{ProgramEntry, SupervisorConfig, WorkerSupervisor};
use gridflow_events::ProgressRelay;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::NamedTempFile;
use tower::ServiceExt;

use gridflow_api::config::{DomainTimeouts, ServerConfig};
use gridflow_api::jobs::JobOrchestrator;
use gridflow_api::router::build_app_router;
use gridflow_api::state::AppState;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        max_config_bytes: 4 * 1024,
        heartbeat_interval_secs: 30,
    }
}

/// Write a throw-away bash worker script.
pub fn write_script(body: &str) -> NamedTempFile {
    let mut f = tempfile::Builder::new()
        .suffix(".sh")
        .tempfile()
        .expect("create temp script");
    writeln!(f, "#!/bin/bash").expect("write shebang");
    write!(f, "{body}").expect("write body");
    f
}

/// A full application wired to a bash script standing in for every domain
/// worker.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    _script: NamedTempFile,
}

impl TestApp {
    pub fn new(script_body: &str, max_workers: usize, timeout: Duration) -> Self {
        let script = write_script(script_body);
        let path = script.path().to_string_lossy().into_owned();

        let mut supervisor_config =
            SupervisorConfig::new(max_workers).with_grace_period(Duration::from_millis(300));
        for domain in Domain::ALL {
            supervisor_config = supervisor_config
                .with_program(domain.program(), ProgramEntry::new("bash").with_arg(&path));
        }

        let config = test_config();
        let relay = Arc::new(ProgressRelay::new());
        let supervisor = Arc::new(WorkerSupervisor::new(supervisor_config));
        let orchestrator = Arc::new(JobOrchestrator::new(
            supervisor,
            Arc::clone(&relay),
            DomainTimeouts::uniform(timeout),
        ));

        let state = AppState {
            orchestrator,
            relay,
        };
        let router = build_app_router(state.clone(), &config);

        Self {
            router,
            state,
            _script: script,
        }
    }

    /// Default app: ceiling of 2, ten second worker timeout.
    pub fn with_script(script_body: &str) -> Self {
        Self::new(script_body, 2, Duration::from_secs(10))
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        get(self.router.clone(), uri).await
    }

    pub async fn post_json(&self, uri: &str, body: &Value) -> Response<Body> {
        post_json(self.router.clone(), uri, body).await
    }

    /// Start a job and return its id, asserting the 201.
    pub async fn start(&self, domain: &str, config: Value) -> String {
        let response = self
            .post_json(&format!("/api/v1/{domain}/start"), &config)
            .await;
        assert_eq!(response.status(), 201, "start must be accepted");
        let json = body_json(response).await;
        json["data"]["jobId"]
            .as_str()
            .expect("jobId in start response")
            .to_string()
    }

    /// Poll the status route until the job leaves `running`.
    pub async fn wait_terminal(&self, domain: &str, job_id: &str) -> Value {
        let uri = format!("/api/v1/{domain}/status/{job_id}");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let json = body_json(self.get(&uri).await).await;
            if json["data"]["status"] != "running" {
                return json["data"].clone();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} did not finish in time"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Wait until every worker process has been reaped.
    pub async fn wait_idle(&self) {
        let supervisor = self.state.orchestrator.supervisor();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while supervisor.live_count() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "workers still live");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Send a GET request through the router.
pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// Send a POST request with a JSON body through the router.
pub async fn post_json(app: Router, uri: &str, body: &Value) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// Collect a response body and parse it as JSON.
pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
