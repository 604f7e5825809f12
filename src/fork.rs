//! Fork, kill and reap primitives.
//!
//! A [`ProcessHandle`] is the parent's reference to one forked worker process.
//! Liveness is never cached: [`is_alive`] first reaps the pid with a
//! non-blocking `waitpid` (an un-reaped zombie still answers `kill(pid, 0)`),
//! then probes it with signal 0.
//!
//! The supervisor talks to the OS through the [`Processes`] trait so the
//! reconciliation logic can run against an in-memory process table in tests;
//! [`UnixProcesses`] is the real implementation.

use std::panic::{self, AssertUnwindSafe};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, error, warn};

use crate::error::SpawnError;
use crate::signals;

/// Exit code of a child whose entry point panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

/// Exit code of a worker whose setup, startup or loop failed.
pub const FAILURE_EXIT_CODE: i32 = 1;

/// The parent's handle on one forked worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: Pid,
    worker: String,
}

impl ProcessHandle {
    pub fn new(pid: Pid, worker: impl Into<String>) -> Self {
        Self {
            pid,
            worker: worker.into(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Name of the worker this process runs.
    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Reap-then-probe liveness check. See [`is_alive`].
    pub fn is_alive(&self) -> bool {
        is_alive(self.pid)
    }

    /// Deliver `signal`, ignoring a process that is already gone.
    pub fn kill(&self, signal: Signal) {
        send_signal(self.pid, signal);
    }
}

/// Fork the current process.
///
/// Signals are blocked across the fork. The child installs the worker
/// handlers for `shutdown`, unblocks, names itself after `worker`, then runs
/// `child_main` and exits with the code it returns ([`PANIC_EXIT_CODE`] if it
/// panics); this function never returns there. A shutdown signal that hits
/// the child before its handlers exist stays pending until they do. In the
/// parent, the mask is restored and the handle returned immediately.
pub fn spawn(
    worker: &str,
    shutdown: Signal,
    child_main: &mut dyn FnMut() -> i32,
) -> Result<ProcessHandle, SpawnError> {
    let saved = signals::block_all()
        .map_err(|e| warn!(worker, "failed to block signals before fork: {e}"))
        .ok();
    // SAFETY: the supervisor is single-threaded; the child continues on a
    // private copy of the address space and terminates via `exit`.
    let forked = unsafe { fork() };
    let restore = || {
        if let Some(mask) = &saved {
            signals::restore_mask(mask);
        }
    };
    match forked {
        Ok(ForkResult::Parent { child }) => {
            restore();
            debug!(worker, pid = child.as_raw(), "forked worker process");
            Ok(ProcessHandle::new(child, worker))
        }
        Ok(ForkResult::Child) => {
            let code = match signals::install_child_handlers(shutdown) {
                Ok(()) => {
                    restore();
                    set_process_name(worker);
                    panic::catch_unwind(AssertUnwindSafe(child_main)).unwrap_or(PANIC_EXIT_CODE)
                }
                Err(e) => {
                    error!("Worker {worker}: {e}");
                    FAILURE_EXIT_CODE
                }
            };
            std::process::exit(code)
        }
        Err(source) => {
            restore();
            Err(SpawnError {
                worker: worker.to_string(),
                source,
            })
        }
    }
}

/// Whether `pid` is still running.
///
/// Reaps the pid if it is our exited child, then sends signal 0. Returns
/// `false` exactly when the process was reaped or no longer answers the
/// probe.
pub fn is_alive(pid: Pid) -> bool {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED)) {
        Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => return false,
        // Not our child (or SIGCHLD is ignored and the kernel reaped it):
        // fall through to the probe.
        Ok(_) | Err(_) => {}
    }
    match signal::kill(pid, None) {
        Ok(()) => true,
        // Exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Send `signal` to `pid`. A vanished process is not an error.
pub fn send_signal(pid: Pid, signal: Signal) -> bool {
    match signal::kill(pid, signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!("failed to send {signal} to pid {pid}: {e}");
            false
        }
    }
}

/// Set the kernel-visible name of the current process (Linux only).
pub fn set_process_name(name: &str) {
    #[cfg(target_os = "linux")]
    {
        let Ok(cname) = std::ffi::CString::new(name) else {
            return;
        };
        if let Err(e) = nix::sys::prctl::set_name(&cname) {
            debug!("failed to set process name to {name}: {e}");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = name;
    }
}

/// The supervisor's view of the OS process table.
pub trait Processes {
    /// Fork a process for `worker` that stops on `shutdown` and runs
    /// `child_main`.
    fn spawn(
        &mut self,
        worker: &str,
        shutdown: Signal,
        child_main: &mut dyn FnMut() -> i32,
    ) -> Result<ProcessHandle, SpawnError>;

    /// Reap-then-probe liveness check.
    fn is_alive(&mut self, handle: &ProcessHandle) -> bool;

    /// Deliver `signal`; a vanished process is silently ignored.
    fn kill(&mut self, handle: &ProcessHandle, signal: Signal);
}

/// Real processes via `fork(2)`, `waitpid(2)` and `kill(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixProcesses;

impl Processes for UnixProcesses {
    fn spawn(
        &mut self,
        worker: &str,
        shutdown: Signal,
        child_main: &mut dyn FnMut() -> i32,
    ) -> Result<ProcessHandle, SpawnError> {
        spawn(worker, shutdown, child_main)
    }

    fn is_alive(&mut self, handle: &ProcessHandle) -> bool {
        handle.is_alive()
    }

    fn kill(&mut self, handle: &ProcessHandle, signal: Signal) {
        handle.kill(signal);
    }
}
