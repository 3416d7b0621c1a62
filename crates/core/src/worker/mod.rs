//! Worker process supervision.
//!
//! A worker is an independently spawned OS process that performs one unit
//! of analytic work and talks to us only through its standard streams and
//! exit code. The pieces:
//!
//! - [`spec`] -- what to run ([`WorkerSpec`](spec::WorkerSpec)), the program
//!   registry, and the [`WorkerError`](spec::WorkerError) taxonomy.
//! - [`timeout`] -- single-shot, idempotently disarmable deadlines.
//! - [`terminate`] -- the graceful-signal-then-kill sequence.
//! - [`supervisor`] -- admission control, spawning, stream decoding, and
//!   outcome resolution.

pub mod spec;
pub mod supervisor;
pub mod terminate;
pub mod timeout;

pub use spec::{ProgramEntry, SupervisorConfig, WorkerError, WorkerSpec};
pub use supervisor::{ProgressSink, WorkerInfo, WorkerPhase, WorkerRun, WorkerSlot, WorkerSupervisor};
pub use timeout::TimeoutGuard;
