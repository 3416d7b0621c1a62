use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use gridflow_events::{ProgressRelay, RelayMessage};

use crate::jobs::JobOrchestrator;
use crate::state::AppState;
use crate::ws::protocol::{job_error, ClientMessage};

/// HTTP handler that upgrades the connection to WebSocket.
///
/// After the upgrade the connection is registered with the relay and
/// managed by a spawned sender task plus the receive loop.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.orchestrator, state.relay))
}

/// Manage a single WebSocket connection after upgrade.
///
/// Splits the socket into a sink (outbound) and stream (inbound), then:
///   1. Registers the connection with the relay.
///   2. Spawns a sender task that forwards relay messages.
///   3. Dispatches inbound join/leave messages on the current task.
///   4. Cleans up on disconnect.
async fn handle_socket(
    socket: WebSocket,
    orchestrator: Arc<JobOrchestrator>,
    relay: Arc<ProgressRelay>,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, "WebSocket connected");

    let mut rx = relay.connect(conn_id.clone()).await;

    let (mut sink, mut stream) = socket.split();

    let sender_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, RelayMessage::Close);
            if sink.send(to_frame(msg)).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                dispatch(&orchestrator, &relay, &conn_id, text.as_str()).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    relay.disconnect(&conn_id).await;
    send_task.abort();
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}

/// Handle one inbound text message.
async fn dispatch(
    orchestrator: &JobOrchestrator,
    relay: &ProgressRelay,
    conn_id: &str,
    text: &str,
) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(conn_id = %conn_id, error = %e, "Unrecognised observer message");
            relay
                .send_to(conn_id, job_error(None, "BAD_REQUEST", &e.to_string()))
                .await;
            return;
        }
    };

    match message {
        ClientMessage::Join { job_id } => match orchestrator.join(conn_id, job_id).await {
            Ok(_) => {}
            Err(e) => {
                let (_, code, error) = e.classify();
                relay
                    .send_to(conn_id, job_error(Some(job_id), code, &error))
                    .await;
            }
        },
        ClientMessage::Leave { job_id } => {
            orchestrator.leave(conn_id, job_id).await;
        }
    }
}

fn to_frame(msg: RelayMessage) -> Message {
    match msg {
        RelayMessage::Event(event) => Message::Text(event.to_message().to_string().into()),
        RelayMessage::Direct(value) => Message::Text(value.to_string().into()),
        RelayMessage::Ping => Message::Ping(Bytes::new()),
        RelayMessage::Close => Message::Close(None),
    }
}
