//! Graceful-then-forceful termination of a set of worker processes.
//!
//! ```text
//!   signal all ──▶ poll is_alive every poll_interval ──▶ all gone? ── done
//!                        │ (bounded by shutdown_timeout)
//!                        ▼
//!                  SIGKILL survivors ──▶ short bounded reap ── done
//! ```
//!
//! Each handle receives the shutdown signal exactly once and SIGKILL at most
//! once. Every handle is signalled before any waiting starts.

use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::events::{Event, EventKind, Observers};
use crate::fork::{ProcessHandle, Processes};
use crate::sleeper::Sleeper;

/// How often the number of resisting processes is logged while waiting.
const REPORT_EVERY: Duration = Duration::from_secs(1);

/// Upper bound for waiting on processes after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Timing and signal for one termination run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Policy {
    pub signal: Signal,
    pub timeout: Duration,
    pub poll: Duration,
}

/// Outcome of [`terminate`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TerminateReport {
    /// Processes that received the shutdown signal.
    pub signalled: usize,
    /// Processes that outlived the timeout and were SIGKILLed.
    pub killed: Vec<Pid>,
}

impl TerminateReport {
    pub fn all_graceful(&self) -> bool {
        self.killed.is_empty()
    }
}

/// Stop every process in `handles`, in the given order.
pub(crate) fn terminate<P: Processes>(
    processes: &mut P,
    sleeper: &dyn Sleeper,
    observers: &Observers,
    policy: Policy,
    handles: &[ProcessHandle],
) -> TerminateReport {
    let mut report = TerminateReport::default();
    if handles.is_empty() {
        return report;
    }

    for handle in handles {
        debug!(worker = handle.worker(), pid = handle.pid().as_raw(), "sending {}", policy.signal);
        processes.kill(handle, policy.signal);
        report.signalled += 1;
    }

    let poll = policy.poll.max(Duration::from_millis(1));
    let max_polls = policy.timeout.as_millis().div_ceil(poll.as_millis()).max(1);
    let start = sleeper.now();
    let mut last_report = start;
    let mut polls = 0u128;
    let mut alive: Vec<ProcessHandle> = handles.to_vec();

    loop {
        alive.retain(|h| processes.is_alive(h));
        if alive.is_empty() {
            return report;
        }
        let now = sleeper.now();
        if polls >= max_polls || now.duration_since(start) >= policy.timeout {
            break;
        }
        if now.duration_since(last_report) >= REPORT_EVERY {
            info!("Waiting for {} worker process(es) to shut down", alive.len());
            last_report = now;
        }
        sleeper.sleep(poll);
        polls += 1;
    }

    warn!(
        "{} worker process(es) did not stop within {:?}, killing",
        alive.len(),
        policy.timeout
    );
    for handle in &alive {
        observers.emit(
            &Event::new(EventKind::WorkerKill)
                .with_worker(handle.worker())
                .with_pid(handle.pid()),
        );
        processes.kill(handle, Signal::SIGKILL);
        report.killed.push(handle.pid());
    }

    let start = sleeper.now();
    loop {
        alive.retain(|h| processes.is_alive(h));
        if alive.is_empty() || sleeper.now().duration_since(start) >= KILL_REAP_TIMEOUT {
            break;
        }
        sleeper.sleep(poll);
    }
    if !alive.is_empty() {
        warn!("{} worker process(es) still present after SIGKILL", alive.len());
    }
    report
}
