//! In-place restart of a detached supervisor via its restart signal.

mod common;

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use procwarden::{Event, EventKind, HaltOutcome, PidFile, Supervisor, Worker, WorkerDefinition};

use common::{append, exists, lines, logging_worker, pids_of, wait_until};

#[test]
fn test_restart_signal_swaps_worker_set() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("out.log");
    let pidfile = PidFile::new(dir.path().join("restart.pid"));

    let swap_log = log.clone();
    let event_log = log.clone();
    let mut supervisor = Supervisor::builder("it-restart")
        .worker("a", logging_worker("a", &log, Duration::from_millis(50), 1))
        .restart_signal(Signal::SIGUSR1)
        .tick_interval(Duration::from_millis(100))
        .poll_interval(Duration::from_millis(20))
        .shutdown_timeout(Duration::from_secs(2))
        .observer(Arc::new(move |event: &Event| {
            if event.kind == EventKind::Restarted {
                append(&event_log, "restarted");
            }
        }))
        .on_restart(move |registry| {
            registry.unregister("a");
            let spec = logging_worker("b", &swap_log, Duration::from_millis(50), 1);
            registry.register(Worker::from_definition("b", WorkerDefinition::from(spec))?)
        })
        .build()
        .unwrap();

    let daemon = supervisor.run_detached(&pidfile).unwrap();
    assert_eq!(pidfile.read(), Some(daemon));
    assert!(wait_until(Duration::from_secs(5), || !pids_of(&log, "a").is_empty()));

    signal::kill(daemon, Signal::SIGUSR1).unwrap();
    assert!(wait_until(Duration::from_secs(5), || !pids_of(&log, "b").is_empty()));

    let halt = Supervisor::builder("it-restart-halt")
        .shutdown_timeout(Duration::from_secs(3))
        .poll_interval(Duration::from_millis(20))
        .build()
        .unwrap();
    assert_eq!(halt.halt(&pidfile, false).unwrap(), HaltOutcome::Stopped);
    assert!(!pidfile.path().exists());

    let out = lines(&log);
    let last_a = out.iter().rposition(|l| l.starts_with("a ")).unwrap();
    let restarted = out.iter().position(|l| l == "restarted").unwrap();
    let first_b = out.iter().position(|l| l.starts_with("b ")).unwrap();
    assert!(last_a < restarted, "a kept running after restart: {out:?}");
    assert!(restarted < first_b, "b started before restart finished: {out:?}");

    for pid in pids_of(&log, "a").into_iter().chain(pids_of(&log, "b")) {
        assert!(!exists(pid), "worker {pid} outlived its supervisor");
    }
}
