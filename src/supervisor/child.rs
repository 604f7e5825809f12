//! Entry point of a forked worker process.
//!
//! The child never looks at the supervisor's (copied) state to decide when to
//! stop. It learns about shutdown only from its own signal handlers, which
//! [`fork::spawn`](crate::fork::spawn) installs before this code runs.

use std::time::Duration;

use nix::unistd::getpid;
use tracing::{debug, error};

use crate::events::{Event, EventKind, Observers};
use crate::fork::FAILURE_EXIT_CODE;
use crate::signals;
use crate::sleeper::Sleeper;
use crate::worker::Worker;

/// Run `worker` inside a freshly forked child and return its exit code.
pub(crate) fn worker_main(worker: &mut Worker, sleeper: &dyn Sleeper, observers: &Observers, poll: Duration) -> i32 {
    if worker.has_startup() {
        debug!("Worker {}: running startup", worker.name());
    }
    if let Err(e) = worker.startup() {
        error!("Worker {}: startup failed: {e}", worker.name());
        return FAILURE_EXIT_CODE;
    }

    worker_loop(worker, sleeper, observers, poll, &signals::worker_stop_requested)
}

/// Invoke the job, then wait out the interval in `poll` slices, until `stop`
/// fires. A stop that is already pending skips the job entirely. A failing
/// job ends the loop with [`FAILURE_EXIT_CODE`].
pub(crate) fn worker_loop(
    worker: &mut Worker,
    sleeper: &dyn Sleeper,
    observers: &Observers,
    poll: Duration,
    stop: &dyn Fn() -> bool,
) -> i32 {
    while !stop() {
        if let Err(e) = worker.run_once() {
            error!("Worker {}: loop failed: {e}", worker.name());
            return FAILURE_EXIT_CODE;
        }
        if sleeper.sleep_unless(worker.interval(), poll, stop) {
            break;
        }
    }

    let pid = getpid();
    observers.emit(
        &Event::new(EventKind::WorkerStopping)
            .with_worker(worker.name())
            .with_pid(pid),
    );
    debug!("Worker {}: loop exited (pid {pid})", worker.name());
    observers.emit(
        &Event::new(EventKind::WorkerStopped)
            .with_worker(worker.name())
            .with_pid(pid),
    );
    0
}
