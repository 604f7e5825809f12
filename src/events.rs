//! Lifecycle events emitted by the supervisor and its worker processes.
//!
//! Observers are plain synchronous callbacks. The supervisor emits parent-side
//! events (`DaemonStopping`, `WorkerStarting`, ...) in its own process; worker
//! children carry a copy of the observer set across `fork` and emit
//! `WorkerStopping`/`WorkerStopped` from inside the child.
//!
//! ```rust
//! use procwarden::events::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::WorkerStarted).with_worker("mailer");
//! assert_eq!(ev.worker.as_deref(), Some("mailer"));
//! ```

use std::sync::Arc;

use nix::unistd::Pid;
use tracing::{debug, info, warn};

/// Classification of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Supervisor begins a full shutdown.
    DaemonStopping,
    /// All worker processes are gone.
    DaemonStopped,

    /// About to fork a process. Sets `worker`.
    WorkerStarting,
    /// Process forked. Sets `worker` and `pid`.
    WorkerStarted,
    /// Inside the child, a shutdown signal was observed.
    WorkerStopping,
    /// Inside the child, the loop has exited.
    WorkerStopped,
    /// A process outlived the shutdown timeout and gets SIGKILL.
    WorkerKill,

    /// Restart signal handled, workers are about to be swapped.
    Restarting,
    /// New worker set is registered.
    Restarted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DaemonStopping => "daemon.stopping",
            Self::DaemonStopped => "daemon.stopped",
            Self::WorkerStarting => "worker.starting",
            Self::WorkerStarted => "worker.started",
            Self::WorkerStopping => "worker.stopping",
            Self::WorkerStopped => "worker.stopped",
            Self::WorkerKill => "worker.kill",
            Self::Restarting => "daemon.restarting",
            Self::Restarted => "daemon.restarted",
        }
    }
}

/// One lifecycle event with optional worker metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub worker: Option<String>,
    pub pid: Option<Pid>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            worker: None,
            pid: None,
        }
    }

    #[must_use]
    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    #[must_use]
    pub fn with_pid(mut self, pid: Pid) -> Self {
        self.pid = Some(pid);
        self
    }
}

/// Receives lifecycle events. Must not block for long: it runs inline in the
/// supervision loop.
pub trait Observer {
    fn on_event(&self, event: &Event);
}

impl<F: Fn(&Event)> Observer for F {
    fn on_event(&self, event: &Event) {
        self(event);
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_event(&self, event: &Event) {
        let worker = event.worker.as_deref().unwrap_or("-");
        let pid = event.pid.map(Pid::as_raw);
        match event.kind {
            EventKind::WorkerKill => warn!(worker, ?pid, "{}", event.kind.as_str()),
            EventKind::WorkerStarting | EventKind::WorkerStarted => {
                debug!(worker, ?pid, "{}", event.kind.as_str());
            }
            _ => info!(worker, ?pid, "{}", event.kind.as_str()),
        }
    }
}

/// Ordered fan-out to every registered observer.
#[derive(Clone, Default)]
pub struct Observers {
    inner: Vec<Arc<dyn Observer>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn Observer>) {
        self.inner.push(observer);
    }

    pub fn emit(&self, event: &Event) {
        for observer in &self.inner {
            observer.on_event(event);
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers").field("len", &self.inner.len()).finish()
    }
}
