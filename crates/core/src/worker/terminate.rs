//! Graceful-then-forceful process termination.
//!
//! Workers may hold external resources (solver licenses, temp files), so
//! both timeouts and cancellations first ask politely (SIGTERM to the
//! worker's process group) and only kill outright once the grace window
//! has passed.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(unix)]
pub(crate) use nix::sys::signal::Signal;
#[cfg(unix)]
use nix::{errno::Errno, sys::signal::killpg, unistd::Pid};

/// How a termination sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process was already gone before any signal was sent.
    AlreadyExited,
    /// The process exited within the grace window.
    Graceful,
    /// The grace window elapsed and the process was killed.
    Forced,
}

/// A process that can be signalled and awaited.
#[async_trait]
pub trait Terminable: Send {
    /// OS process id, or `None` once the process has been reaped.
    fn pid(&self) -> Option<u32>;

    /// Ask the process to shut down.
    fn signal_graceful(&mut self) -> io::Result<()>;

    /// Kill the process without giving it a chance to clean up.
    fn signal_forceful(&mut self) -> io::Result<()>;

    /// Wait for the process to exit and reap it.
    async fn wait_exit(&mut self) -> io::Result<Option<i32>>;
}

/// Send the graceful signal, wait up to `grace`, then escalate.
pub async fn signal_then_escalate<P>(process: &mut P, grace: Duration) -> Termination
where
    P: Terminable + ?Sized,
{
    let Some(pid) = process.pid() else {
        return Termination::AlreadyExited;
    };

    if let Err(e) = process.signal_graceful() {
        tracing::warn!(pid, error = %e, "Graceful termination signal failed");
    }

    match tokio::time::timeout(grace, process.wait_exit()).await {
        Ok(Ok(code)) => {
            tracing::debug!(pid, ?code, "Worker exited after graceful signal");
            return Termination::Graceful;
        }
        Ok(Err(e)) => {
            tracing::warn!(pid, error = %e, "Waiting for worker exit failed");
        }
        Err(_) => {
            tracing::warn!(
                pid,
                grace_ms = grace.as_millis() as u64,
                "Worker ignored graceful signal, escalating"
            );
        }
    }

    if let Err(e) = process.signal_forceful() {
        tracing::warn!(pid, error = %e, "Forceful termination signal failed");
    }
    if let Err(e) = process.wait_exit().await {
        tracing::warn!(pid, error = %e, "Reaping killed worker failed");
    }
    Termination::Forced
}

#[async_trait]
impl Terminable for tokio::process::Child {
    fn pid(&self) -> Option<u32> {
        self.id()
    }

    #[cfg(unix)]
    fn signal_graceful(&mut self) -> io::Result<()> {
        match self.id() {
            Some(pid) => signal_group(pid, Signal::SIGTERM),
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn signal_graceful(&mut self) -> io::Result<()> {
        self.start_kill()
    }

    fn signal_forceful(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.id() {
            // Takes down helper processes the worker started, too.
            let _ = signal_group(pid, Signal::SIGKILL);
        }
        match self.start_kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    async fn wait_exit(&mut self) -> io::Result<Option<i32>> {
        self.wait().await.map(|status| status.code())
    }
}

/// Signal every process in the group led by `pid`.
///
/// Workers are spawned as process-group leaders, so the group id equals
/// the worker's pid. The group stays addressable after the leader has been
/// reaped, as long as any member is alive.
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: Signal) -> io::Result<()> {
    let pgid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    match killpg(Pid::from_raw(pgid), signal) {
        // Group already gone.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory process that records the signals it receives.
    struct FakeProcess {
        pid: Option<u32>,
        honours_sigterm: bool,
        graceful_sent: bool,
        forceful_sent: bool,
    }

    impl FakeProcess {
        fn new(honours_sigterm: bool) -> Self {
            Self {
                pid: Some(4242),
                honours_sigterm,
                graceful_sent: false,
                forceful_sent: false,
            }
        }
    }

    #[async_trait]
    impl Terminable for FakeProcess {
        fn pid(&self) -> Option<u32> {
            self.pid
        }

        fn signal_graceful(&mut self) -> io::Result<()> {
            self.graceful_sent = true;
            Ok(())
        }

        fn signal_forceful(&mut self) -> io::Result<()> {
            self.forceful_sent = true;
            Ok(())
        }

        async fn wait_exit(&mut self) -> io::Result<Option<i32>> {
            if self.forceful_sent {
                self.pid = None;
                return Ok(None);
            }
            if self.graceful_sent && self.honours_sigterm {
                self.pid = None;
                return Ok(Some(0));
            }
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn cooperative_process_exits_gracefully() {
        let mut process = FakeProcess::new(true);
        let outcome = signal_then_escalate(&mut process, Duration::from_millis(50)).await;
        assert_eq!(outcome, Termination::Graceful);
        assert!(process.graceful_sent);
        assert!(!process.forceful_sent);
    }

    #[tokio::test]
    async fn stubborn_process_is_killed_after_grace() {
        let mut process = FakeProcess::new(false);
        let started = std::time::Instant::now();
        let outcome = signal_then_escalate(&mut process, Duration::from_millis(50)).await;
        assert_eq!(outcome, Termination::Forced);
        assert!(process.graceful_sent && process.forceful_sent);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn reaped_process_is_left_alone() {
        let mut process = FakeProcess::new(true);
        process.pid = None;
        let outcome = signal_then_escalate(&mut process, Duration::from_millis(50)).await;
        assert_eq!(outcome, Termination::AlreadyExited);
        assert!(!process.graceful_sent);
    }

    #[cfg(unix)]
    #[test]
    fn signalling_a_vanished_group_is_not_an_error() {
        // Above the kernel PID_MAX_LIMIT, so no such group exists.
        assert!(signal_group(4_194_305, Signal::SIGTERM).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_child_ignoring_sigterm_is_killed() {
        let mut child = tokio::process::Command::new("bash")
            .arg("-c")
            .arg("trap '' TERM; sleep 30")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .expect("spawn bash");

        // Give bash a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let outcome = signal_then_escalate(&mut child, Duration::from_millis(200)).await;
        assert_eq!(outcome, Termination::Forced);
        assert!(child.id().is_none(), "child must be reaped");
    }
}
