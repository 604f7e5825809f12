//! Helpers shared by the real-fork integration tests.

#![allow(dead_code)]

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::sys::signal;
use nix::unistd::{getpid, Pid};
use procwarden::{CallableJob, WorkerSpec};

/// Append one line to `path`. Each line is a single `write`, so lines from
/// concurrent processes never interleave.
pub fn append(path: &Path, line: &str) {
    let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
    file.write_all(format!("{line}\n").as_bytes()).unwrap();
}

pub fn lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Poll `cond` every 20ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}

/// A worker that logs `"<tag> <pid>"` to `log` on every iteration.
pub fn logging_worker(tag: &str, log: &Path, interval: Duration, amount: usize) -> WorkerSpec {
    let tag = tag.to_string();
    let log = log.to_path_buf();
    WorkerSpec::new(CallableJob::new(move |_| {
        append(&log, &format!("{tag} {}", getpid()));
        Ok(())
    }))
    .interval(interval)
    .amount(amount)
}

/// Pids logged under `tag`, in first-seen order.
pub fn pids_of(path: &Path, tag: &str) -> Vec<Pid> {
    let mut pids = Vec::new();
    for line in lines(path) {
        let mut parts = line.split_whitespace();
        if parts.next() != Some(tag) {
            continue;
        }
        if let Some(pid) = parts.next().and_then(|p| p.parse().ok()).map(Pid::from_raw) {
            if !pids.contains(&pid) {
                pids.push(pid);
            }
        }
    }
    pids
}

/// Whether `pid` still exists, without reaping it.
pub fn exists(pid: Pid) -> bool {
    signal::kill(pid, None).is_ok()
}

/// Whether `pid` is running: it exists and, where `/proc` says so, is not a
/// zombie waiting for a reaper.
pub fn running(pid: Pid) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z"),
        Err(_) => !Path::new("/proc/self").exists() && exists(pid),
    }
}
