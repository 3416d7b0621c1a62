//! Domain controller glue between HTTP, the job ledgers, and the worker
//! supervisor.
//!
//! Held in [`AppState`](crate::state::AppState) as an
//! `Arc<JobOrchestrator>`.

use std::sync::Arc;

use gridflow_core::domain::Domain;
use gridflow_core::error::CoreError;
use gridflow_core::job::JobRecord;
use gridflow_core::job_events::JobEventSink;
use gridflow_core::ledger::JobLedger;
use gridflow_core::types::JobId;
use gridflow_core::worker::{ProgressSink, WorkerError, WorkerRun, WorkerSpec, WorkerSupervisor};
use gridflow_events::ProgressRelay;
use serde_json::Value;

use crate::config::DomainTimeouts;
use crate::error::AppResult;

/// Orchestrates analytic jobs across all domains.
///
/// Manages the full lifecycle:
/// 1. Validate the request and take an admission slot.
/// 2. Create the job record (running).
/// 3. Launch the worker with the domain ledger as its progress sink.
/// 4. Route the worker outcome into a terminal ledger state.
pub struct JobOrchestrator {
    supervisor: Arc<WorkerSupervisor>,
    relay: Arc<ProgressRelay>,
    timeouts: DomainTimeouts,
    forecast: Arc<JobLedger>,
    profile: Arc<JobLedger>,
    optimization: Arc<JobLedger>,
}

impl JobOrchestrator {
    /// Create one ledger per domain, each publishing through `relay`.
    pub fn new(
        supervisor: Arc<WorkerSupervisor>,
        relay: Arc<ProgressRelay>,
        timeouts: DomainTimeouts,
    ) -> Self {
        let ledger = |domain| {
            let events: Arc<dyn JobEventSink> = relay.clone();
            Arc::new(JobLedger::new(domain, events))
        };
        Self {
            forecast: ledger(Domain::Forecast),
            profile: ledger(Domain::Profile),
            optimization: ledger(Domain::Optimization),
            supervisor,
            relay,
            timeouts,
        }
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    pub fn ledger(&self, domain: Domain) -> &Arc<JobLedger> {
        match domain {
            Domain::Forecast => &self.forecast,
            Domain::Profile => &self.profile,
            Domain::Optimization => &self.optimization,
        }
    }

    /// Accept a job for `domain` and start its worker.
    ///
    /// Rejections (unknown program, capacity) happen before any record is
    /// created. A spawn failure after creation is recorded on the job, which
    /// is still returned so the caller can inspect it.
    pub async fn start_job(&self, domain: Domain, config: Value) -> AppResult<JobId> {
        let spec = WorkerSpec::new(domain.program(), &config, self.timeouts.for_domain(domain))?;
        self.supervisor.validate(&spec)?;
        let slot = self.supervisor.reserve().inspect_err(|_| {
            tracing::warn!(domain = %domain, live = self.supervisor.live_count(), "Job rejected at capacity");
        })?;

        let ledger = Arc::clone(self.ledger(domain));
        let job_id = ledger.create(config).await;
        let sink: Arc<dyn ProgressSink> = ledger.clone();

        match self.supervisor.launch(slot, job_id, spec, sink) {
            Ok(run) => {
                tokio::spawn(track(ledger, run));
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, domain = %domain, error = %e, "Worker launch failed");
                ledger.fail(job_id, e.to_failure()).await;
            }
        }
        Ok(job_id)
    }

    /// Current snapshot of one job.
    pub async fn status(&self, domain: Domain, job_id: JobId) -> AppResult<JobRecord> {
        Ok(self.ledger(domain).get(job_id).await?)
    }

    /// All jobs of `domain`, newest first.
    pub async fn list(&self, domain: Domain) -> Vec<JobRecord> {
        self.ledger(domain).list().await
    }

    /// Cancel a job and terminate its worker.
    ///
    /// Returns whether the job transitioned to `cancelled`; `false` means it
    /// had already finished.
    pub async fn cancel_job(&self, domain: Domain, job_id: JobId) -> AppResult<bool> {
        let ledger = self.ledger(domain);
        if !ledger.contains(job_id).await {
            return Err(CoreError::NotFound {
                entity: "Job",
                id: job_id.to_string(),
            }
            .into());
        }

        let cancelled = ledger.cancel(job_id).await;
        // The worker's own Cancelled outcome then lands on a terminal record.
        let signalled = self.supervisor.cancel(job_id);
        tracing::info!(job_id = %job_id, domain = %domain, cancelled, signalled, "Job cancel requested");
        Ok(cancelled)
    }

    /// Subscribe `conn_id` to `job_id`, queueing its current state first.
    ///
    /// The snapshot and the subscription happen under the owning ledger's
    /// read lock, so no transition falls between them.
    pub async fn join(&self, conn_id: &str, job_id: JobId) -> AppResult<bool> {
        for domain in Domain::ALL {
            let joined = self
                .ledger(domain)
                .with_snapshot(job_id, |snapshot| {
                    self.relay.join(conn_id, job_id, Some(snapshot))
                })
                .await;
            if let Some(joined) = joined {
                return Ok(joined);
            }
        }
        Err(CoreError::NotFound {
            entity: "Job",
            id: job_id.to_string(),
        }
        .into())
    }

    pub async fn leave(&self, conn_id: &str, job_id: JobId) -> bool {
        self.relay.leave(conn_id, job_id).await
    }
}

/// Await the worker outcome and record it on the ledger.
async fn track(ledger: Arc<JobLedger>, run: WorkerRun) {
    let job_id = run.job_id();
    match run.await {
        Ok(result) => {
            ledger.complete(job_id, result).await;
        }
        Err(WorkerError::Cancelled) => {
            ledger.cancel(job_id).await;
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, kind = ?e.kind(), error = %e, "Worker failed");
            ledger.fail(job_id, e.to_failure()).await;
        }
    }
}
