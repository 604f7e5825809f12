//! Pid-file driven background start and stop.
//!
//! `run_detached` forks once. The child becomes a session leader, points its
//! stdio at `/dev/null`, records its pid and reports readiness to the parent
//! over a pipe before entering the supervision loop:
//!
//! ```text
//!  caller ── fork ──▶ child: setsid ─▶ stdio → /dev/null ─▶ write pid ─▶ 'K' ─▶ run()
//!    │                       │ fail                           │ fail
//!    │                       ▼                                ▼
//!    └◀──── read 1 byte ──── 'S'                              'P'
//! ```
//!
//! `halt` is the inverse: read the pid, send the shutdown signal, wait, and
//! optionally SIGKILL.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, getpid, pipe, setsid, ForkResult, Pid};
use tracing::{error, info, warn};

use crate::error::{DetachError, HaltError};
use crate::fork::{self as procs, Processes, UnixProcesses};
use crate::pidfile::PidFile;
use crate::supervisor::Supervisor;

const READY: u8 = b'K';
const NO_SESSION: u8 = b'S';
const NO_PIDFILE: u8 = b'P';

/// How long a SIGKILLed supervisor gets to disappear.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Result of [`Supervisor::halt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltOutcome {
    /// The process shut down after the shutdown signal.
    Stopped,
    /// The process outlived the timeout and was SIGKILLed.
    Killed,
    /// No live process was recorded in the pid file.
    AlreadyStopped,
}

impl Supervisor<UnixProcesses> {
    /// Start supervising in a detached background process.
    ///
    /// Returns the pid of the background supervisor once it has written the
    /// pid file. Refuses to start when the pid file names a live process.
    pub fn run_detached(&mut self, pidfile: &PidFile) -> Result<Pid, DetachError> {
        let path = pidfile.path().to_path_buf();
        if let Some(pid) = pidfile.read() {
            if procs::is_alive(pid) {
                return Err(DetachError::AlreadyRunning { pid, path });
            }
            info!("Found stale pid {pid} in {}, overwriting", path.display());
        }
        // Any early return below drops the claim, which removes a pid file
        // this call created.
        let claim = pidfile.claim().map_err(|source| DetachError::PidFile {
            path: path.clone(),
            source,
        })?;

        let (read_end, write_end) = pipe().map_err(DetachError::Pipe)?;

        // SAFETY: called from the single-threaded supervisor process before
        // any worker exists; the child only runs this crate's code and exits.
        match unsafe { fork() }.map_err(DetachError::Fork)? {
            ForkResult::Parent { child } => {
                drop(write_end);
                let mut status = [0u8; 1];
                let read = File::from(read_end).read(&mut status).unwrap_or(0);
                let result = match (read, status[0]) {
                    (1, READY) => {
                        claim.keep();
                        return Ok(child);
                    }
                    (1, NO_SESSION) => DetachError::SessionLeader,
                    (1, NO_PIDFILE) => DetachError::PidWrite { path },
                    _ => DetachError::ChildVanished,
                };
                let _ = waitpid(child, None);
                Err(result)
            }
            ForkResult::Child => {
                claim.keep();
                drop(read_end);
                let code = self.detached_main(pidfile, File::from(write_end));
                std::process::exit(code)
            }
        }
    }

    fn detached_main(&mut self, pidfile: &PidFile, mut ready: File) -> i32 {
        if setsid().is_err() {
            let _ = ready.write_all(&[NO_SESSION]);
            return 1;
        }
        if let Err(e) = redirect_stdio() {
            warn!("Failed to redirect stdio to /dev/null: {e}");
        }
        let pid = getpid();
        if let Err(e) = pidfile.write(pid) {
            error!("Failed to write pid file {}: {e}", pidfile.path().display());
            let _ = ready.write_all(&[NO_PIDFILE]);
            return 1;
        }
        let _ = ready.write_all(&[READY]);
        drop(ready);

        let code = match self.run() {
            Ok(()) => 0,
            Err(e) => {
                error!("{}: {e}", self.config().name);
                1
            }
        };
        if pidfile.read() == Some(pid) {
            let _ = pidfile.remove();
        }
        code
    }
}

impl<P: Processes> Supervisor<P> {
    /// Stop the supervisor recorded in `pidfile`.
    ///
    /// Waits up to the shutdown timeout plus one second, since the target
    /// itself needs up to the shutdown timeout to stop its workers. With
    /// `force`, a process still running after that is SIGKILLed; otherwise
    /// [`HaltError::Timeout`] is returned and the pid file is left in place.
    pub fn halt(&self, pidfile: &PidFile, force: bool) -> Result<HaltOutcome, HaltError> {
        let remove = || {
            pidfile.remove().map_err(|source| HaltError::PidFile {
                path: pidfile.path().to_path_buf(),
                source,
            })
        };

        let Some(pid) = pidfile.read() else {
            remove()?;
            return Ok(HaltOutcome::AlreadyStopped);
        };
        if !procs::is_alive(pid) {
            info!("Process {pid} from {} is not running", pidfile.path().display());
            remove()?;
            return Ok(HaltOutcome::AlreadyStopped);
        }

        let signal = self.config().shutdown_signal;
        match signal::kill(pid, signal) {
            Ok(()) => info!("Sent {signal} to {pid}"),
            Err(Errno::ESRCH) => {
                remove()?;
                return Ok(HaltOutcome::AlreadyStopped);
            }
            Err(source) => return Err(HaltError::Signal { pid, source }),
        }

        let timeout = self.config().shutdown_timeout;
        if self.wait_gone(pid, timeout.saturating_add(Duration::from_secs(1))) {
            remove()?;
            return Ok(HaltOutcome::Stopped);
        }
        if !force {
            return Err(HaltError::Timeout { pid, signal, timeout });
        }

        warn!("Process {pid} did not stop within {timeout:?}, killing");
        match signal::kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(source) => return Err(HaltError::Signal { pid, source }),
        }
        if !self.wait_gone(pid, KILL_GRACE) {
            warn!("Process {pid} still present after SIGKILL");
        }
        remove()?;
        Ok(HaltOutcome::Killed)
    }

    fn wait_gone(&self, pid: Pid, limit: Duration) -> bool {
        let sleeper = self.sleeper();
        let poll = self.config().poll_interval;
        let start = sleeper.now();
        loop {
            if !procs::is_alive(pid) {
                return true;
            }
            if sleeper.now().duration_since(start) >= limit {
                return false;
            }
            sleeper.sleep(poll);
        }
    }
}

fn redirect_stdio() -> io::Result<()> {
    let devnull = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for target in 0..=2 {
        // SAFETY: `devnull` stays open for the call; dup2 atomically replaces
        // the standard descriptor.
        if unsafe { libc::dup2(devnull.as_raw_fd(), target) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
