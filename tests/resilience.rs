//! A worker that ignores the shutdown signal is SIGKILLed after the timeout;
//! its cooperative sibling is not.

mod common;

use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::getpid;
use procwarden::{signals, CallableJob, Supervisor, WorkerSpec};

use common::{append, logging_worker, pids_of, wait_until};

#[test]
fn test_stubborn_worker_is_killed_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("out.log");
    let stubborn_log = log.clone();

    let stubborn = CallableJob::with_startup(
        |_| signals::ignore(Signal::SIGQUIT).map_err(|e| procwarden::error::WorkerError::failed(e.to_string())),
        move |_, _: &mut ()| {
            append(&stubborn_log, &format!("stubborn {}", getpid()));
            Ok(())
        },
    );

    let timeout = Duration::from_secs(1);
    let mut supervisor = Supervisor::builder("it-resilience")
        .worker("stubborn", WorkerSpec::new(stubborn).interval(Duration::from_millis(50)))
        .worker("polite", logging_worker("polite", &log, Duration::from_millis(50), 1))
        .shutdown_timeout(timeout)
        .poll_interval(Duration::from_millis(20))
        .build()
        .unwrap();

    supervisor.tick();
    // Both must be past startup before the signal goes out.
    assert!(wait_until(Duration::from_secs(5), || {
        !pids_of(&log, "stubborn").is_empty() && !pids_of(&log, "polite").is_empty()
    }));
    let stubborn_pid = supervisor.running("stubborn")[0];
    let polite_pid = supervisor.running("polite")[0];

    let started = Instant::now();
    let report = supervisor.shutdown();
    let took = started.elapsed();

    assert_eq!(report.signalled, 2);
    assert_eq!(report.killed, vec![stubborn_pid]);
    assert!(!report.killed.contains(&polite_pid));
    assert!(took >= timeout, "force kill came too early: {took:?}");
    assert!(took < timeout + Duration::from_secs(3), "shutdown took {took:?}");
    assert!(!procwarden::fork::is_alive(stubborn_pid));
    assert!(!procwarden::fork::is_alive(polite_pid));
}
