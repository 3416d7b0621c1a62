//! End-to-end tests for the WebSocket push channel against a server bound
//! on an ephemeral port.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::TestApp;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Serve the app in the background and return its address.
async fn serve(app: &TestApp) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/ws"))
        .await
        .expect("websocket handshake");
    client
}

async fn send(client: &mut Client, message: Value) {
    client.send(Message::Text(message.to_string())).await.unwrap();
}

/// Next JSON text message, skipping control frames.
async fn next_json(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("message within 5s")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

// ---------------------------------------------------------------------------
// Test: a late observer learns the final state through the join snapshot
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_join_receives_terminal_snapshot() {
    let app = TestApp::with_script("echo '{\"ok\":true}'\n");
    let addr = serve(&app).await;

    let job_id = app.start("forecast", json!({})).await;
    app.wait_terminal("forecast", &job_id).await;

    let mut client = connect(addr).await;
    send(&mut client, json!({"action": "join", "jobId": job_id})).await;

    let message = next_json(&mut client).await;
    assert_eq!(message["event"], "forecast-completed");
    assert_eq!(message["data"]["jobId"], job_id.as_str());
    assert_eq!(message["data"]["status"], "completed");
    assert_eq!(message["data"]["result"], json!({"ok": true}));
    assert_eq!(message["data"]["snapshot"], true);
}

// ---------------------------------------------------------------------------
// Test: a live observer sees non-decreasing progress and one terminal event
// ---------------------------------------------------------------------------

#[tokio::test]
async fn live_join_streams_progress_then_completion() {
    let script = r#"
sleep 0.5
echo 'PROGRESS:{"progress":20,"stage":"load","status":"running"}'
echo 'PROGRESS:{"progress":60,"stage":"solve","status":"running"}'
sleep 0.2
echo 'PROGRESS:{"progress":90,"stage":"write","status":"running"}'
echo '{"value":1}'
"#;
    let app = TestApp::with_script(script);
    let addr = serve(&app).await;
    let mut client = connect(addr).await;

    let job_id = app.start("optimization", json!({})).await;
    send(&mut client, json!({"action": "join", "jobId": job_id})).await;

    let snapshot = next_json(&mut client).await;
    assert_eq!(snapshot["data"]["snapshot"], true);

    let mut last = snapshot["data"]["progress"].as_f64().unwrap_or(0.0);
    let mut terminal = Vec::new();
    let mut seen = vec![snapshot];
    while terminal.is_empty() {
        let message = next_json(&mut client).await;
        let event = message["event"].as_str().unwrap().to_string();
        if event == "optimization-progress" {
            let progress = message["data"]["progress"].as_f64().unwrap();
            assert!(progress >= last, "progress regressed: {last} -> {progress}");
            last = progress;
        } else {
            terminal.push(event);
        }
        seen.push(message);
    }

    assert_eq!(terminal, vec!["optimization-completed".to_string()]);
    let done = seen.last().unwrap();
    assert_eq!(done["data"]["result"], json!({"value": 1}));
    assert_eq!(last, 90.0);
}

// ---------------------------------------------------------------------------
// Test: cancellation is published as an error event with status cancelled
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_is_published_as_error_event() {
    let app = TestApp::with_script("sleep 5\n");
    let addr = serve(&app).await;
    let mut client = connect(addr).await;

    let job_id = app.start("profile", json!({})).await;
    send(&mut client, json!({"action": "join", "jobId": job_id})).await;
    let snapshot = next_json(&mut client).await;
    assert_eq!(snapshot["event"], "profile-progress");

    app.post_json(&format!("/api/v1/profile/{job_id}/cancel"), &json!({}))
        .await;

    let message = next_json(&mut client).await;
    assert_eq!(message["event"], "profile-error");
    assert_eq!(message["data"]["status"], "cancelled");
    assert_eq!(message["data"]["errorKind"], "cancelled");
    app.wait_idle().await;
}

// ---------------------------------------------------------------------------
// Test: joining an unknown job replies with job-error and does not join
// ---------------------------------------------------------------------------

#[tokio::test]
async fn join_unknown_job_replies_not_found() {
    let app = TestApp::with_script("echo '{}'\n");
    let addr = serve(&app).await;
    let mut client = connect(addr).await;

    let missing = uuid::Uuid::new_v4();
    send(&mut client, json!({"action": "join", "jobId": missing})).await;

    let message = next_json(&mut client).await;
    assert_eq!(message["event"], "job-error");
    assert_eq!(message["data"]["code"], "NOT_FOUND");
    assert_eq!(message["data"]["jobId"], missing.to_string());
    assert_eq!(app.state.relay.member_count(missing).await, 0);
}

#[tokio::test]
async fn malformed_message_replies_bad_request() {
    let app = TestApp::with_script("echo '{}'\n");
    let addr = serve(&app).await;
    let mut client = connect(addr).await;

    client
        .send(Message::Text("{\"action\":\"dance\"}".to_string()))
        .await
        .unwrap();

    let message = next_json(&mut client).await;
    assert_eq!(message["event"], "job-error");
    assert_eq!(message["data"]["code"], "BAD_REQUEST");
}
