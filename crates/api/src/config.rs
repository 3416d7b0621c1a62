use std::path::{Path, PathBuf};
use std::time::Duration;

use gridflow_core::domain::Domain;
use gridflow_core::worker::{ProgramEntry, SupervisorConfig};

/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Largest accepted job config body (default: 64 KiB). The config is
    /// handed to the worker as a single argument, and Linux caps one
    /// argument at 128 KiB.
    pub max_config_bytes: usize,
    /// Seconds between WebSocket pings (default: `30`).
    pub heartbeat_interval_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `3000`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                       |
    /// | `MAX_CONFIG_BYTES`     | `65536`                    |
    /// | `WS_HEARTBEAT_SECS`    | `30`                       |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs = env_u64("REQUEST_TIMEOUT_SECS", 30);
        let max_config_bytes = env_u64("MAX_CONFIG_BYTES", 64 * 1024) as usize;
        let heartbeat_interval_secs = env_u64("WS_HEARTBEAT_SECS", 30).max(1);

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            max_config_bytes,
            heartbeat_interval_secs,
        }
    }
}

/// Worker timeout per analytic domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainTimeouts {
    pub forecast: Duration,
    pub profile: Duration,
    pub optimization: Duration,
}

impl DomainTimeouts {
    /// The same timeout for every domain.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            forecast: timeout,
            profile: timeout,
            optimization: timeout,
        }
    }

    pub fn for_domain(&self, domain: Domain) -> Duration {
        match domain {
            Domain::Forecast => self.forecast,
            Domain::Profile => self.profile,
            Domain::Optimization => self.optimization,
        }
    }
}

impl Default for DomainTimeouts {
    fn default() -> Self {
        Self {
            forecast: Duration::from_secs(600),
            profile: Duration::from_secs(600),
            optimization: Duration::from_secs(1800),
        }
    }
}

/// Worker process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Admission ceiling (default: `2`).
    pub max_workers: usize,
    /// Grace window between SIGTERM and SIGKILL (default: `5s`).
    pub grace_period: Duration,
    /// Directory holding the worker scripts; also the workers' cwd.
    pub worker_dir: PathBuf,
    /// Interpreter used to run the worker scripts (default: `python3`).
    pub interpreter: String,
    pub timeouts: DomainTimeouts,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default     |
    /// |-----------------------------|-------------|
    /// | `MAX_CONCURRENT_WORKERS`    | `2`         |
    /// | `WORKER_GRACE_SECS`         | `5`         |
    /// | `WORKER_DIR`                | `./workers` |
    /// | `WORKER_INTERPRETER`        | `python3`   |
    /// | `FORECAST_TIMEOUT_SECS`     | `600`       |
    /// | `PROFILE_TIMEOUT_SECS`      | `600`       |
    /// | `OPTIMIZATION_TIMEOUT_SECS` | `1800`      |
    pub fn from_env() -> Self {
        let max_workers = env_u64("MAX_CONCURRENT_WORKERS", 2) as usize;
        let grace_period = Duration::from_secs(env_u64("WORKER_GRACE_SECS", 5));
        let worker_dir =
            PathBuf::from(std::env::var("WORKER_DIR").unwrap_or_else(|_| "./workers".into()));
        let interpreter = std::env::var("WORKER_INTERPRETER").unwrap_or_else(|_| "python3".into());

        let timeouts = DomainTimeouts {
            forecast: Duration::from_secs(env_u64("FORECAST_TIMEOUT_SECS", 600)),
            profile: Duration::from_secs(env_u64("PROFILE_TIMEOUT_SECS", 600)),
            optimization: Duration::from_secs(env_u64("OPTIMIZATION_TIMEOUT_SECS", 1800)),
        };

        Self {
            max_workers,
            grace_period,
            worker_dir,
            interpreter,
            timeouts,
        }
    }

    /// Supervisor settings with the built-in worker programs registered.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        let worker_dir = self.worker_dir.to_string_lossy().into_owned();
        let mut config = SupervisorConfig::new(self.max_workers)
            .with_grace_period(self.grace_period)
            .with_working_directory(&self.worker_dir)
            .with_env("PYTHONPATH", worker_dir)
            .with_env("PYTHONUNBUFFERED", "1");

        for domain in Domain::ALL {
            let script = self.worker_dir.join(script_name(domain));
            config = config.with_program(domain.program(), self.program_entry(&script));
        }
        config
    }

    fn program_entry(&self, script: &Path) -> ProgramEntry {
        ProgramEntry::new(&self.interpreter).with_arg(script.to_string_lossy())
    }
}

/// Worker script serving `domain`, relative to the worker directory.
pub fn script_name(domain: Domain) -> &'static str {
    match domain {
        Domain::Forecast => "forecast_runner.py",
        Domain::Profile => "profile_generator.py",
        Domain::Optimization => "grid_optimizer.py",
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a valid u64")),
        Err(_) => default,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
