//! Push event envelope for job lifecycle transitions.
//!
//! Every ledger transition produces one [`JobEvent`]. Events are named
//! `<domain>-<kind>` on the wire, e.g. `forecast-progress`, and carry
//! `{ jobId, ...payload }` as their data.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::domain::Domain;
use crate::job::{JobRecord, JobStatus};
use crate::types::{JobId, Timestamp};

/// Progress update while the job is running.
pub const EVENT_KIND_PROGRESS: &str = "progress";

/// Job completed successfully.
pub const EVENT_KIND_COMPLETED: &str = "completed";

/// Job failed or was cancelled.
pub const EVENT_KIND_ERROR: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobEventKind {
    Progress,
    Completed,
    Error,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventKind::Progress => EVENT_KIND_PROGRESS,
            JobEventKind::Completed => EVENT_KIND_COMPLETED,
            JobEventKind::Error => EVENT_KIND_ERROR,
        }
    }

    /// The event kind a transition into `status` publishes.
    pub fn for_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Running => JobEventKind::Progress,
            JobStatus::Completed => JobEventKind::Completed,
            JobStatus::Failed | JobStatus::Cancelled => JobEventKind::Error,
        }
    }
}

/// A job lifecycle event addressed to one job's channel.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub domain: Domain,
    pub kind: JobEventKind,
    /// Event-specific fields merged into the outgoing data object.
    pub payload: Map<String, Value>,
    /// True for the synthetic current-state event sent on join.
    pub snapshot: bool,
    pub timestamp: Timestamp,
}

impl JobEvent {
    fn new(record: &JobRecord, kind: JobEventKind, payload: Map<String, Value>) -> Self {
        Self {
            job_id: record.job_id,
            domain: record.domain,
            kind,
            payload,
            snapshot: false,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Event for a newly accepted progress frame.
    pub fn progress(record: &JobRecord) -> Self {
        let mut payload = Map::new();
        payload.insert("status".into(), json!(record.status.as_str()));
        if let Some(frame) = &record.progress {
            payload.insert("progress".into(), json!(frame.progress));
            payload.insert("stage".into(), json!(frame.stage));
            payload.insert("status".into(), json!(frame.status));
            if let Some(details) = &frame.details {
                payload.insert("details".into(), json!(details));
            }
            payload.insert("emittedAt".into(), json!(frame.timestamp));
        } else {
            payload.insert("progress".into(), json!(0.0));
        }
        Self::new(record, JobEventKind::Progress, payload)
    }

    /// Event for a transition into a terminal state.
    pub fn terminal(record: &JobRecord) -> Self {
        let kind = JobEventKind::for_status(record.status);
        let mut payload = Map::new();
        payload.insert("status".into(), json!(record.status.as_str()));
        payload.insert("progress".into(), json!(record.percent()));
        if let Some(result) = &record.result {
            payload.insert("result".into(), result.clone());
        }
        if let Some(error) = &record.error {
            payload.insert("error".into(), json!(error.message));
            payload.insert("errorKind".into(), json!(error.kind));
        }
        payload.insert("completedAt".into(), json!(record.completed_at));
        Self::new(record, kind, payload)
    }

    /// Synthetic event describing the record's current state.
    pub fn snapshot(record: &JobRecord) -> Self {
        let mut event = if record.status.is_terminal() {
            Self::terminal(record)
        } else {
            Self::progress(record)
        };
        event.snapshot = true;
        event
    }

    /// Wire name, e.g. `optimization-completed`.
    pub fn event_name(&self) -> String {
        format!("{}-{}", self.domain, self.kind.as_str())
    }

    /// The `{ event, data }` message sent to observers.
    pub fn to_message(&self) -> Value {
        let mut data = Map::with_capacity(self.payload.len() + 3);
        data.insert("jobId".into(), json!(self.job_id));
        for (key, value) in &self.payload {
            data.insert(key.clone(), value.clone());
        }
        if self.snapshot {
            data.insert("snapshot".into(), Value::Bool(true));
        }
        data.insert("timestamp".into(), json!(self.timestamp));
        json!({
            "event": self.event_name(),
            "data": Value::Object(data),
        })
    }
}

/// Destination for ledger transitions.
///
/// The ledger awaits `publish` while it still holds the record, so a sink
/// sees one job's events in the order they were applied.
#[async_trait]
pub trait JobEventSink: Send + Sync {
    async fn publish(&self, event: JobEvent);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
