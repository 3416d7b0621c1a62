//! Per-domain authoritative job map.
//!
//! [`JobLedger`] is the only writer of [`JobRecord`]s. Every transition is
//! applied under the ledger's write lock and published to the configured
//! [`JobEventSink`] before the lock is released, so observers of one job see
//! transitions in exactly the order they were applied.
//!
//! Lock order: ledger first, then whatever the sink locks. Anything that
//! needs both (see [`JobLedger::with_snapshot`]) must follow it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::domain::Domain;
use crate::error::CoreError;
use crate::job::{FailureKind, JobFailure, JobRecord, JobStatus};
use crate::job_events::{JobEvent, JobEventSink};
use crate::progress::ProgressFrame;
use crate::types::JobId;
use crate::worker::ProgressSink;

/// Message recorded when a job is cancelled on request.
pub const CANCELLED_MESSAGE: &str = "Cancelled by user";

/// Authoritative job records for one analytic domain.
pub struct JobLedger {
    domain: Domain,
    records: RwLock<HashMap<JobId, JobRecord>>,
    events: Arc<dyn JobEventSink>,
}

impl JobLedger {
    pub fn new(domain: Domain, events: Arc<dyn JobEventSink>) -> Self {
        Self {
            domain,
            records: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Allocate a job id and insert a running record for it.
    pub async fn create(&self, config: Value) -> JobId {
        let job_id = uuid::Uuid::new_v4();
        let record = JobRecord::new(job_id, self.domain, config);
        self.records.write().await.insert(job_id, record);
        tracing::info!(job_id = %job_id, domain = %self.domain, "Job created");
        job_id
    }

    /// Merge a progress frame under the monotonic-progress rule.
    ///
    /// Unknown ids, finished jobs, and regressed frames are dropped; progress
    /// is best-effort telemetry. Returns whether the frame was applied.
    pub async fn apply_progress(&self, job_id: JobId, frame: ProgressFrame) -> bool {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&job_id) else {
            tracing::debug!(job_id = %job_id, "Progress for unknown job dropped");
            return false;
        };
        if record.status.is_terminal() {
            tracing::debug!(job_id = %job_id, status = record.status.as_str(), "Progress after terminal state dropped");
            return false;
        }
        if frame.progress < record.percent() {
            tracing::debug!(
                job_id = %job_id,
                current = record.percent(),
                received = frame.progress,
                "Regressed progress frame dropped",
            );
            return false;
        }

        record.progress = Some(frame);
        let event = JobEvent::progress(record);
        self.events.publish(event).await;
        true
    }

    /// Mark the job completed with `result`.
    pub async fn complete(&self, job_id: JobId, result: Value) -> bool {
        self.finish(job_id, JobStatus::Completed, |record| {
            record.result = Some(result);
        })
        .await
    }

    /// Mark the job failed with `failure`.
    pub async fn fail(&self, job_id: JobId, failure: JobFailure) -> bool {
        self.finish(job_id, JobStatus::Failed, |record| {
            record.error = Some(failure);
        })
        .await
    }

    /// Mark the job cancelled.
    pub async fn cancel(&self, job_id: JobId) -> bool {
        self.finish(job_id, JobStatus::Cancelled, |record| {
            record.error = Some(JobFailure::new(FailureKind::Cancelled, CANCELLED_MESSAGE));
        })
        .await
    }

    /// Snapshot of one record.
    pub async fn get(&self, job_id: JobId) -> Result<JobRecord, CoreError> {
        self.records
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                entity: "Job",
                id: job_id.to_string(),
            })
    }

    pub async fn contains(&self, job_id: JobId) -> bool {
        self.records.read().await.contains_key(&job_id)
    }

    /// Snapshots of all records, newest first.
    pub async fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Run `f` with a current-state event for `job_id` while no transition
    /// can be applied.
    ///
    /// Used to subscribe an observer atomically with its snapshot: nothing
    /// published after `f` returns can predate the snapshot, and nothing
    /// is missed in between. Returns `None` for unknown ids.
    pub async fn with_snapshot<F, Fut, T>(&self, job_id: JobId, f: F) -> Option<T>
    where
        F: FnOnce(JobEvent) -> Fut,
        Fut: Future<Output = T>,
    {
        let records = self.records.read().await;
        let record = records.get(&job_id)?;
        Some(f(JobEvent::snapshot(record)).await)
    }

    async fn finish<F>(&self, job_id: JobId, status: JobStatus, apply: F) -> bool
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&job_id) else {
            tracing::debug!(job_id = %job_id, status = status.as_str(), "Transition for unknown job ignored");
            return false;
        };
        if record.status.is_terminal() {
            tracing::debug!(
                job_id = %job_id,
                current = record.status.as_str(),
                requested = status.as_str(),
                "Job already terminal, transition ignored",
            );
            return false;
        }

        record.status = status;
        record.completed_at = Some(chrono::Utc::now());
        apply(record);

        tracing::info!(job_id = %job_id, domain = %self.domain, status = status.as_str(), "Job finished");
        let event = JobEvent::terminal(record);
        self.events.publish(event).await;
        true
    }
}

#[async_trait]
impl ProgressSink for JobLedger {
    async fn on_progress(&self, job_id: JobId, frame: ProgressFrame) {
        self.apply_progress(job_id, frame).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
