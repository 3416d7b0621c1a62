use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use gridflow_core::job_events::{JobEvent, JobEventSink};
use gridflow_core::types::{JobId, Timestamp};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

/// Outbound message for one observer connection.
///
/// Transport-neutral; the WebSocket handler maps each variant to a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// A job lifecycle event for a channel the observer belongs to.
    Event(JobEvent),
    /// A reply addressed to this observer only.
    Direct(Value),
    /// Keep-alive ping.
    Ping,
    /// The server is going away.
    Close,
}

/// Receiver half handed back by [`ProgressRelay::connect`].
pub type ObserverReceiver = mpsc::UnboundedReceiver<RelayMessage>;

struct Observer {
    sender: mpsc::UnboundedSender<RelayMessage>,
    connected_at: Timestamp,
}

#[derive(Default)]
struct RelayState {
    connections: HashMap<String, Observer>,
    /// Channel membership: job id -> connection ids.
    channels: HashMap<JobId, HashSet<String>>,
}

impl RelayState {
    fn remove_member(&mut self, conn_id: &str, job_id: JobId) -> bool {
        let Some(members) = self.channels.get_mut(&job_id) else {
            return false;
        };
        let removed = members.remove(conn_id);
        if members.is_empty() {
            self.channels.remove(&job_id);
        }
        removed
    }
}

/// Per-job broadcast channels.
///
/// Every job id is an independent channel; a connection may belong to any
/// number of them. Published events reach current members only, there is
/// no backlog. Sends go to unbounded per-connection queues, so a slow or
/// dead observer never holds up the publisher or the other members.
///
/// Thread-safe via interior `RwLock`; wrap in `Arc` and share.
pub struct ProgressRelay {
    state: RwLock<RelayState>,
}

impl ProgressRelay {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RelayState::default()),
        }
    }

    /// Register a connection.
    ///
    /// Returns the receiver half of its outbound queue.
    pub async fn connect(&self, conn_id: impl Into<String>) -> ObserverReceiver {
        let conn_id = conn_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = Observer {
            sender: tx,
            connected_at: chrono::Utc::now(),
        };
        let previous = self.state.write().await.connections.insert(conn_id.clone(), observer);
        if previous.is_some() {
            tracing::warn!(conn_id = %conn_id, "Observer id reused, previous queue dropped");
        }
        rx
    }

    /// Remove a connection and its membership in every channel.
    pub async fn disconnect(&self, conn_id: &str) {
        let mut state = self.state.write().await;
        let Some(observer) = state.connections.remove(conn_id) else {
            return;
        };
        state.channels.retain(|_, members| {
            members.remove(conn_id);
            !members.is_empty()
        });
        let connected_for_ms = (chrono::Utc::now() - observer.connected_at).num_milliseconds();
        tracing::debug!(conn_id = %conn_id, connected_for_ms, "Observer disconnected");
    }

    /// Add `conn_id` to the channel for `job_id`.
    ///
    /// If `snapshot` is given it is queued to the joining observer before
    /// any later event, under the same lock that admits it to the channel.
    /// Joining a channel twice is harmless; the snapshot is still sent.
    /// Returns `false` if the connection is unknown.
    pub async fn join(&self, conn_id: &str, job_id: JobId, snapshot: Option<JobEvent>) -> bool {
        let mut state = self.state.write().await;
        let Some(observer) = state.connections.get(conn_id) else {
            tracing::debug!(conn_id = %conn_id, job_id = %job_id, "Join from unknown observer");
            return false;
        };
        if let Some(event) = snapshot {
            let _ = observer.sender.send(RelayMessage::Event(event));
        }
        state
            .channels
            .entry(job_id)
            .or_default()
            .insert(conn_id.to_string());
        tracing::debug!(conn_id = %conn_id, job_id = %job_id, "Observer joined job channel");
        true
    }

    /// Remove `conn_id` from the channel for `job_id`.
    ///
    /// Returns `false` if it was not a member.
    pub async fn leave(&self, conn_id: &str, job_id: JobId) -> bool {
        let removed = self.state.write().await.remove_member(conn_id, job_id);
        if removed {
            tracing::debug!(conn_id = %conn_id, job_id = %job_id, "Observer left job channel");
        }
        removed
    }

    /// Queue a message for one connection. Returns `false` if it is gone.
    pub async fn send_to(&self, conn_id: &str, message: Value) -> bool {
        match self.state.read().await.connections.get(conn_id) {
            Some(observer) => observer.sender.send(RelayMessage::Direct(message)).is_ok(),
            None => false,
        }
    }

    /// Number of connections subscribed to `job_id`.
    pub async fn member_count(&self, job_id: JobId) -> usize {
        self.state
            .read()
            .await
            .channels
            .get(&job_id)
            .map_or(0, HashSet::len)
    }

    /// Channels `conn_id` currently belongs to.
    pub async fn channels_of(&self, conn_id: &str) -> Vec<JobId> {
        self.state
            .read()
            .await
            .channels
            .iter()
            .filter(|(_, members)| members.contains(conn_id))
            .map(|(job_id, _)| *job_id)
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Queue a keep-alive ping to every connection.
    pub async fn ping_all(&self) {
        let state = self.state.read().await;
        for observer in state.connections.values() {
            let _ = observer.sender.send(RelayMessage::Ping);
        }
    }

    /// Queue a close to every connection, then forget them all.
    pub async fn shutdown_all(&self) {
        let mut state = self.state.write().await;
        let count = state.connections.len();
        for observer in state.connections.values() {
            let _ = observer.sender.send(RelayMessage::Close);
        }
        state.connections.clear();
        state.channels.clear();
        tracing::info!(count, "Closed all observer connections");
    }
}

impl Default for ProgressRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobEventSink for ProgressRelay {
    async fn publish(&self, event: JobEvent) {
        let state = self.state.read().await;
        let Some(members) = state.channels.get(&event.job_id) else {
            return;
        };

        let mut delivered = 0usize;
        for conn_id in members {
            let Some(observer) = state.connections.get(conn_id) else {
                continue;
            };
            // A closed queue means the connection is mid-teardown.
            if observer.sender.send(RelayMessage::Event(event.clone())).is_ok() {
                delivered += 1;
            }
        }
        tracing::trace!(
            job_id = %event.job_id,
            event = %event.event_name(),
            delivered,
            "Job event relayed",
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
