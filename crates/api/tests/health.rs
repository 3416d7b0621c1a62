//! Integration tests for the health check endpoint and general HTTP behaviour.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use common::{body_json, TestApp};
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Test: GET /health returns 200 with expected JSON fields
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_check_returns_ok_with_json() {
    let app = TestApp::with_script("echo '{}'\n");
    let response = app.get("/health").await;

    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["liveWorkers"], 0);
    assert_eq!(json["workers"], serde_json::json!([]));
}

// ---------------------------------------------------------------------------
// Test: liveWorkers reflects running workers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_live_workers() {
    let app = TestApp::with_script("sleep 5\n");
    let job_id = app.start("forecast", serde_json::json!({})).await;

    let json = body_json(app.get("/health").await).await;
    assert_eq!(json["liveWorkers"], 1);
    let worker = &json["workers"][0];
    assert_eq!(worker["jobId"], job_id.as_str());
    assert!(worker["pid"].is_u64());
    assert!(worker["startedAt"].is_string());
    assert!(matches!(worker["phase"].as_str(), Some("spawned" | "streaming")));

    app.post_json(
        &format!("/api/v1/forecast/{job_id}/cancel"),
        &serde_json::json!({}),
    )
    .await;
    app.wait_idle().await;
}

// ---------------------------------------------------------------------------
// Test: Unknown route returns 404
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_route_returns_404() {
    let app = TestApp::with_script("echo '{}'\n");
    let response = app.get("/this-route-does-not-exist").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Test: x-request-id header is present in response
// ---------------------------------------------------------------------------

#[tokio::test]
async fn response_contains_x_request_id_header() {
    let app = TestApp::with_script("echo '{}'\n");
    let response = app.get("/health").await;

    let request_id = response
        .headers()
        .get("x-request-id")
        .expect("Response must contain an x-request-id header");
    assert_eq!(request_id.to_str().unwrap().len(), 36, "x-request-id should be a UUID string");
}

// ---------------------------------------------------------------------------
// Test: CORS preflight OPTIONS request returns correct headers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cors_preflight_returns_correct_headers() {
    let app = TestApp::with_script("echo '{}'\n");

    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/v1/forecast/start")
        .header("Origin", "http://localhost:5173")
        .header("Access-Control-Request-Method", "POST")
        .header("Access-Control-Request-Headers", "content-type")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "http://localhost:5173"
    );
}
