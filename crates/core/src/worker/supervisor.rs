//! Worker supervisor: admission, spawning, streaming, and outcome.
//!
//! One call to [`WorkerSupervisor::start`] runs one worker process to
//! completion. Every call resolves exactly once, to the worker's parsed
//! JSON result or to a [`WorkerError`]. The process-table entry and the
//! deadline timer are released on every exit path, including panics, by
//! the [`Registration`] guard held by the supervising task.
//!
//! Each live worker moves through [`WorkerPhase`]s:
//! `Spawned -> Streaming -> Exited`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::spec::{ProgramEntry, SupervisorConfig, WorkerError, WorkerSpec};
#[cfg(unix)]
use super::terminate::{signal_group, Signal};
use super::terminate::{signal_then_escalate, Termination};
use super::timeout::TimeoutGuard;
use crate::progress::{self, DecoderState, ProgressFrame};
use crate::types::{JobId, Timestamp};

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Stderr kept in a `WorkerFailed` error (the tail, where tracebacks end).
const MAX_STDERR_IN_ERROR: usize = 4 * 1024;

/// Raw output kept in a `MalformedOutput` error.
const MAX_EXCERPT_CHARS: usize = 500;

/// Read buffer size for the stream readers.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Receives progress frames as the worker emits them.
///
/// Frames are delivered in emission order, and all frames of a worker are
/// delivered before its call resolves.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_progress(&self, job_id: JobId, frame: ProgressFrame);
}

/// Lifecycle phase of a live worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPhase {
    /// Process started, streams not yet attached.
    Spawned,
    /// Stream readers attached; progress is flowing.
    Streaming,
    /// Process has exited (or been terminated); result being resolved.
    Exited,
}

/// Diagnostic snapshot of one live worker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub job_id: JobId,
    pub pid: Option<u32>,
    pub started_at: Timestamp,
    pub phase: WorkerPhase,
}

/// One admission slot. Held for the whole life of a worker; dropping it
/// frees the slot.
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
}

/// Handle to a launched worker. Await it for the outcome.
#[derive(Debug)]
pub struct WorkerRun {
    job_id: JobId,
    pid: Option<u32>,
    handle: JoinHandle<Result<Value, WorkerError>>,
}

impl WorkerRun {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Future for WorkerRun {
    type Output = Result<Value, WorkerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(outcome) => outcome,
            Err(e) => Err(WorkerError::WorkerFailed {
                exit_code: -1,
                stderr: format!("supervisor task aborted: {e}"),
            }),
        })
    }
}

/// Process-table entry for one live worker.
struct LiveWorker {
    pid: Option<u32>,
    started_at: Timestamp,
    phase: WorkerPhase,
    cancel: CancellationToken,
}

type ProcessTable = HashMap<JobId, LiveWorker>;

enum ExitReason {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

/// What the stdout reader hands back once the stream closes.
struct StdoutCapture {
    state: DecoderState,
    overflowed: bool,
}

/// Spawns and supervises worker processes under a concurrency ceiling.
///
/// Constructed once at startup and shared as `Arc<WorkerSupervisor>`.
pub struct WorkerSupervisor {
    config: SupervisorConfig,
    slots: Arc<Semaphore>,
    // Never held across an await.
    table: Mutex<ProcessTable>,
    timers: TimeoutGuard,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_workers));
        Self {
            config,
            slots,
            table: Mutex::new(HashMap::new()),
            timers: TimeoutGuard::new(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Check that `spec` names a registered program.
    pub fn validate(&self, spec: &WorkerSpec) -> Result<(), WorkerError> {
        self.program(&spec.program).map(|_| ())
    }

    /// Take an admission slot without waiting.
    ///
    /// Fails with [`WorkerError::CapacityExceeded`] when every slot is in
    /// use; there is no queueing.
    pub fn reserve(&self) -> Result<WorkerSlot, WorkerError> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => Ok(WorkerSlot { _permit: permit }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                Err(WorkerError::CapacityExceeded {
                    limit: self.config.max_workers,
                })
            }
        }
    }

    /// Reserve a slot and launch in one step.
    pub fn start(
        self: &Arc<Self>,
        job_id: JobId,
        spec: WorkerSpec,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<WorkerRun, WorkerError> {
        self.validate(&spec)?;
        let slot = self.reserve()?;
        self.launch(slot, job_id, spec, sink)
    }

    /// Spawn the worker for `job_id` using a previously reserved slot.
    ///
    /// Immediate failures (unknown program, duplicate job, spawn error) are
    /// returned synchronously and release the slot. Otherwise the returned
    /// [`WorkerRun`] resolves when the worker exits, times out, or is
    /// cancelled.
    pub fn launch(
        self: &Arc<Self>,
        slot: WorkerSlot,
        job_id: JobId,
        spec: WorkerSpec,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<WorkerRun, WorkerError> {
        let entry = self.program(&spec.program)?.clone();
        let mut cmd = self.build_command(&entry, &spec);
        let cancel = CancellationToken::new();

        let mut child = {
            let mut table = self.lock_table();
            if table.contains_key(&job_id) {
                return Err(WorkerError::InvalidSpec(format!(
                    "job {job_id} already has a live worker"
                )));
            }

            let child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!(
                        job_id = %job_id,
                        program = %spec.program,
                        error = %e,
                        "Failed to spawn worker",
                    );
                    return Err(WorkerError::Spawn(e));
                }
            };

            table.insert(
                job_id,
                LiveWorker {
                    pid: child.id(),
                    started_at: chrono::Utc::now(),
                    phase: WorkerPhase::Spawned,
                    cancel: cancel.clone(),
                },
            );
            child
        };

        // Config travels as an argument; stdin is closed immediately.
        drop(child.stdin.take());

        let pid = child.id();
        tracing::info!(
            job_id = %job_id,
            program = %spec.program,
            pid,
            timeout_ms = spec.timeout.as_millis() as u64,
            live = self.live_count(),
            "Worker spawned",
        );

        let timed_out = CancellationToken::new();
        let fire = timed_out.clone();
        self.timers.arm(job_id, spec.timeout, move || fire.cancel());

        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            supervisor
                .supervise(job_id, child, slot, sink, cancel, timed_out)
                .await
        });

        Ok(WorkerRun { job_id, pid, handle })
    }

    /// Request cancellation of the worker for `job_id`.
    ///
    /// Returns `false` if no worker is live for that job.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.lock_table().get(&job_id) {
            Some(worker) => {
                tracing::info!(job_id = %job_id, pid = worker.pid, "Cancelling worker");
                worker.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every live worker. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let table = self.lock_table();
        for worker in table.values() {
            worker.cancel.cancel();
        }
        table.len()
    }

    /// Stop admitting work, cancel everything live, and wait up to `wait`
    /// for the process table to drain.
    pub async fn shutdown(&self, wait: Duration) {
        self.slots.close();
        let count = self.cancel_all();
        tracing::info!(count, "Shutting down worker supervisor");

        let deadline = tokio::time::Instant::now() + wait;
        while self.live_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.live_count();
        if remaining > 0 {
            tracing::warn!(remaining, "Workers still live after shutdown wait");
        } else {
            tracing::info!("Worker supervisor shut down complete");
        }
    }

    pub fn is_live(&self, job_id: JobId) -> bool {
        self.lock_table().contains_key(&job_id)
    }

    pub fn live_count(&self) -> usize {
        self.lock_table().len()
    }

    /// Snapshot of all live workers, oldest first.
    pub fn live_workers(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self
            .lock_table()
            .iter()
            .map(|(job_id, w)| WorkerInfo {
                job_id: *job_id,
                pid: w.pid,
                started_at: w.started_at,
                phase: w.phase,
            })
            .collect();
        workers.sort_by_key(|w| w.started_at);
        workers
    }

    // ---- private helpers ----

    fn program(&self, id: &str) -> Result<&ProgramEntry, WorkerError> {
        self.config
            .programs
            .get(id)
            .ok_or_else(|| WorkerError::InvalidSpec(format!("unknown worker program: {id}")))
    }

    fn build_command(&self, entry: &ProgramEntry, spec: &WorkerSpec) -> Command {
        let mut cmd = Command::new(&entry.command);
        cmd.args(&entry.args)
            .args(&spec.args)
            .arg(&spec.config)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .current_dir(
                spec.working_directory
                    .as_ref()
                    .unwrap_or(&self.config.working_directory),
            );

        for (key, value) in self.config.env_vars.iter().chain(&spec.env_vars) {
            cmd.env(key, value);
        }

        // Own process group, so termination reaches helper processes too.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }

    fn lock_table(&self) -> MutexGuard<'_, ProcessTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, job_id: JobId, phase: WorkerPhase) {
        if let Some(worker) = self.lock_table().get_mut(&job_id) {
            tracing::debug!(job_id = %job_id, from = ?worker.phase, to = ?phase, "Worker phase change");
            worker.phase = phase;
        }
    }

    /// Terminate a worker that is still running and detach its readers.
    async fn stop<T>(
        &self,
        job_id: JobId,
        child: &mut Child,
        stdout_task: &JoinHandle<StdoutCapture>,
        stderr_task: &JoinHandle<T>,
    ) -> Termination {
        let termination = signal_then_escalate(child, self.config.grace_period).await;
        self.set_phase(job_id, WorkerPhase::Exited);
        stdout_task.abort();
        stderr_task.abort();
        termination
    }

    /// Collect both stream readers after the worker has exited.
    ///
    /// Helpers left behind by the worker may still hold the pipes open. Once
    /// the grace window passes, the worker's process group is killed, which
    /// closes the pipes and lets the readers hand back what they captured.
    async fn drain_readers(
        &self,
        job_id: JobId,
        pid: Option<u32>,
        mut stdout_task: JoinHandle<StdoutCapture>,
        mut stderr_task: JoinHandle<Vec<u8>>,
    ) -> (StdoutCapture, Vec<u8>) {
        let grace = self.config.grace_period;

        let deadline = tokio::time::Instant::now() + grace;
        let mut stdout = tokio::time::timeout_at(deadline, &mut stdout_task).await.ok();
        let mut stderr = tokio::time::timeout_at(deadline, &mut stderr_task).await.ok();

        if stdout.is_none() || stderr.is_none() {
            tracing::warn!(job_id = %job_id, pid, "Worker output still open after exit, killing process group");
            kill_leftovers(pid);

            let deadline = tokio::time::Instant::now() + grace;
            if stdout.is_none() {
                stdout = tokio::time::timeout_at(deadline, &mut stdout_task).await.ok();
            }
            if stderr.is_none() {
                stderr = tokio::time::timeout_at(deadline, &mut stderr_task).await.ok();
            }
        }

        let capture = match stdout {
            Some(Ok(capture)) => capture,
            Some(Err(e)) => {
                tracing::warn!(job_id = %job_id, error = %e, "Stdout reader failed");
                StdoutCapture::empty()
            }
            None => {
                tracing::error!(job_id = %job_id, "Stdout reader did not finish, output lost");
                stdout_task.abort();
                StdoutCapture::empty()
            }
        };
        let stderr_bytes = match stderr {
            Some(Ok(bytes)) => bytes,
            Some(Err(_)) => Vec::new(),
            None => {
                stderr_task.abort();
                Vec::new()
            }
        };
        (capture, stderr_bytes)
    }

    async fn supervise(
        self: Arc<Self>,
        job_id: JobId,
        mut child: Child,
        slot: WorkerSlot,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
        timed_out: CancellationToken,
    ) -> Result<Value, WorkerError> {
        // Dropped in reverse order: table entry and timer first, then slot.
        let _slot = slot;
        let _registration = Registration {
            supervisor: Arc::clone(&self),
            job_id,
        };
        let started = Instant::now();
        // Kept for the process group; `child.id()` is gone once reaped.
        let pid = child.id();

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(read_stdout(child.stdout.take(), frame_tx));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take()));
        self.set_phase(job_id, WorkerPhase::Streaming);

        let reason = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break ExitReason::Cancelled,
                _ = timed_out.cancelled() => break ExitReason::TimedOut,
                Some(frame) = frame_rx.recv() => sink.on_progress(job_id, frame).await,
                status = child.wait() => break ExitReason::Exited(status),
            }
        };

        self.timers.disarm(job_id);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let status = match reason {
            ExitReason::Cancelled => {
                let termination = self.stop(job_id, &mut child, &stdout_task, &stderr_task).await;
                tracing::info!(job_id = %job_id, elapsed_ms, ?termination, "Worker cancelled");
                return Err(WorkerError::Cancelled);
            }
            ExitReason::TimedOut => {
                let termination = self.stop(job_id, &mut child, &stdout_task, &stderr_task).await;
                tracing::warn!(job_id = %job_id, elapsed_ms, ?termination, "Worker timed out");
                return Err(WorkerError::Timeout { elapsed_ms });
            }
            ExitReason::Exited(Err(e)) => {
                self.set_phase(job_id, WorkerPhase::Exited);
                stdout_task.abort();
                stderr_task.abort();
                tracing::error!(job_id = %job_id, error = %e, "Waiting for worker failed");
                return Err(WorkerError::WorkerFailed {
                    exit_code: -1,
                    stderr: e.to_string(),
                });
            }
            ExitReason::Exited(Ok(status)) => status,
        };

        self.set_phase(job_id, WorkerPhase::Exited);

        let (capture, stderr_bytes) = self
            .drain_readers(job_id, pid, stdout_task, stderr_task)
            .await;

        // The reader has finished, so every frame is already queued.
        while let Ok(frame) = frame_rx.try_recv() {
            sink.on_progress(job_id, frame).await;
        }
        let overflowed = capture.overflowed;
        let (last_frame, output) = capture.state.finish();
        if let Some(frame) = last_frame {
            sink.on_progress(job_id, frame).await;
        }

        let exit_code = status.code().unwrap_or(-1);
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr_bytes);
            tracing::warn!(job_id = %job_id, exit_code, elapsed_ms, "Worker exited with failure");
            return Err(WorkerError::WorkerFailed {
                exit_code,
                stderr: tail(stderr.trim(), MAX_STDERR_IN_ERROR).to_string(),
            });
        }

        if overflowed {
            return Err(WorkerError::MalformedOutput {
                reason: format!("output exceeds {MAX_OUTPUT_BYTES} bytes"),
                excerpt: excerpt(&output),
            });
        }

        let result = parse_result(&output)?;
        tracing::info!(job_id = %job_id, elapsed_ms, "Worker completed");
        Ok(result)
    }
}

/// Removes the process-table entry and disarms the timer when the
/// supervising task ends, however it ends.
struct Registration {
    supervisor: Arc<WorkerSupervisor>,
    job_id: JobId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.supervisor.timers.disarm(self.job_id);
        self.supervisor.lock_table().remove(&self.job_id);
    }
}

/// SIGKILL whatever is left of an exited worker's process group.
fn kill_leftovers(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        if let Err(e) = signal_group(pid, Signal::SIGKILL) {
            tracing::warn!(pid, error = %e, "Killing leftover worker processes failed");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

impl StdoutCapture {
    fn empty() -> Self {
        Self {
            state: DecoderState::new(),
            overflowed: false,
        }
    }
}

/// Decode stdout as it arrives, forwarding frames and keeping the rest.
async fn read_stdout<R: AsyncRead + Unpin>(
    handle: Option<R>,
    frames: mpsc::UnboundedSender<ProgressFrame>,
) -> StdoutCapture {
    let mut capture = StdoutCapture::empty();
    let Some(mut handle) = handle else {
        return capture;
    };

    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let n = match handle.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "Stdout read error");
                break;
            }
        };

        // Keep draining past the cap so the worker never blocks on a full
        // pipe, but stop decoding.
        if capture.overflowed {
            continue;
        }

        let (decoded, next) = progress::decode(std::mem::take(&mut capture.state), &buf[..n]);
        capture.state = next;
        for frame in decoded {
            let _ = frames.send(frame);
        }

        if capture.state.output().len() + capture.state.pending_len() > MAX_OUTPUT_BYTES {
            capture.overflowed = true;
        }
    }
    capture
}

/// Read an entire output stream into a byte buffer, capped at
/// [`MAX_OUTPUT_BYTES`]. Excess bytes are drained and discarded.
async fn read_capped<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut out = Vec::new();
    let Some(mut handle) = handle else {
        return out;
    };

    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match handle.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_OUTPUT_BYTES.saturating_sub(out.len());
                out.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    out
}

/// The result candidate must be exactly one JSON document.
fn parse_result(output: &str) -> Result<Value, WorkerError> {
    serde_json::from_str(output.trim()).map_err(|e| WorkerError::MalformedOutput {
        reason: e.to_string(),
        excerpt: excerpt(output),
    })
}

fn excerpt(output: &str) -> String {
    let mut excerpt: String = output.chars().take(MAX_EXCERPT_CHARS).collect();
    if excerpt.len() < output.len() {
        excerpt.push_str("...");
    }
    excerpt
}

/// Last `max` bytes of `s`, moved forward to a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
