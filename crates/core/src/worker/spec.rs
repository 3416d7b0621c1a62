//! Worker specifications, the program registry, and worker errors.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::job::{FailureKind, JobFailure};

/// Default grace window between the graceful and forceful termination
/// signals.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// What to run for one job. Immutable once handed to the supervisor.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Registry identifier of the worker program.
    pub program: String,
    /// Extra arguments placed before the config argument.
    pub args: Vec<String>,
    /// Serialized JSON config, passed as the final argument.
    pub config: String,
    /// Maximum wall-clock time before the worker is terminated.
    pub timeout: Duration,
    /// Additional environment variables for this worker only.
    pub env_vars: Vec<(String, String)>,
    /// Overrides the supervisor's pinned working directory.
    pub working_directory: Option<PathBuf>,
}

impl WorkerSpec {
    /// Build a spec, serializing `config` to JSON.
    ///
    /// Fails with [`WorkerError::InvalidSpec`] if the config cannot be
    /// serialized.
    pub fn new<C: Serialize + ?Sized>(
        program: impl Into<String>,
        config: &C,
        timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let config = serde_json::to_string(config)
            .map_err(|e| WorkerError::InvalidSpec(format!("config is not serializable: {e}")))?;
        Ok(Self {
            program: program.into(),
            args: Vec::new(),
            config,
            timeout,
            env_vars: Vec::new(),
            working_directory: None,
        })
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

/// How to launch one registered program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramEntry {
    /// Executable, resolved through `PATH` if not absolute.
    pub command: String,
    /// Fixed leading arguments, e.g. the script path for an interpreter.
    pub args: Vec<String>,
}

impl ProgramEntry {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Supervisor-wide settings, fixed at startup.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Admission ceiling: the most workers alive at once.
    pub max_workers: usize,
    /// Wait between the graceful signal and the forceful kill.
    pub grace_period: Duration,
    /// Pinned working directory for worker programs.
    pub working_directory: PathBuf,
    /// Environment every worker receives (dependency locations etc.).
    pub env_vars: Vec<(String, String)>,
    /// Recognized programs by identifier.
    pub programs: HashMap<String, ProgramEntry>,
}

impl SupervisorConfig {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            grace_period: DEFAULT_GRACE_PERIOD,
            working_directory: PathBuf::from("."),
            env_vars: Vec::new(),
            programs: HashMap::new(),
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn with_program(mut self, id: impl Into<String>, entry: ProgramEntry) -> Self {
        self.programs.insert(id.into(), entry);
        self
    }
}

/// Why a worker call did not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Unknown program or unserializable config. Not retried.
    #[error("Invalid worker spec: {0}")]
    InvalidSpec(String),

    /// The admission ceiling is reached. The caller may retry later.
    #[error("Worker capacity exceeded: {limit} workers already running")]
    CapacityExceeded { limit: usize },

    /// The worker outlived its timeout and was terminated.
    #[error("Worker timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The worker exited with a non-zero code (`-1` if killed by a signal).
    #[error("Worker failed with exit code {exit_code}: {stderr}")]
    WorkerFailed { exit_code: i32, stderr: String },

    /// The worker exited cleanly but its output is not one JSON document.
    #[error("Worker produced malformed output ({reason}): {excerpt}")]
    MalformedOutput { reason: String, excerpt: String },

    /// The worker was cancelled on request.
    #[error("Worker cancelled")]
    Cancelled,

    /// The OS could not start the program.
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
}

impl WorkerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidSpec(_) => FailureKind::InvalidSpec,
            Self::CapacityExceeded { .. } => FailureKind::CapacityExceeded,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::WorkerFailed { .. } => FailureKind::WorkerFailed,
            Self::MalformedOutput { .. } => FailureKind::MalformedOutput,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Spawn(_) => FailureKind::Spawn,
        }
    }

    /// The error description recorded on the job.
    pub fn to_failure(&self) -> JobFailure {
        JobFailure::new(self.kind(), self.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
