//! Job records and their lifecycle status.

use serde::{Deserialize, Serialize};

use crate::domain::Domain;
use crate::progress::ProgressFrame;
use crate::types::{JobId, Timestamp};

/// Lifecycle status of a job.
///
/// Moves strictly forward: `Running` to exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Stable classification of why a job did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidSpec,
    CapacityExceeded,
    Timeout,
    WorkerFailed,
    MalformedOutput,
    Cancelled,
    Spawn,
}

/// Error description attached to failed and cancelled jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// The orchestrator-side record of one accepted unit of work.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: JobId,
    pub domain: Domain,
    pub status: JobStatus,
    /// Latest accepted progress frame, if any.
    pub progress: Option<ProgressFrame>,
    /// Snapshot of the config the job was started with.
    pub config: serde_json::Value,
    /// Set only once the job has completed.
    pub result: Option<serde_json::Value>,
    /// Set only once the job has failed or been cancelled.
    pub error: Option<JobFailure>,
    pub created_at: Timestamp,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl JobRecord {
    pub(crate) fn new(job_id: JobId, domain: Domain, config: serde_json::Value) -> Self {
        let now = chrono::Utc::now();
        Self {
            job_id,
            domain,
            status: JobStatus::Running,
            progress: None,
            config,
            result: None,
            error: None,
            created_at: now,
            started_at: now,
            completed_at: None,
        }
    }

    /// Current progress percentage (0 before the first frame).
    pub fn percent(&self) -> f64 {
        self.progress.as_ref().map(|p| p.progress).unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
