//! The unit of work a worker process repeats.
//!
//! [`Job`] is the seam between the supervisor and caller code. Two
//! implementations ship with the crate:
//!
//! - [`CallableJob`]: closures, with optional typed startup state that is
//!   handed mutably to every loop call.
//! - [`ExecutableJob`]: runs an external program once per iteration.
//!
//! Any other type implementing [`Job`] can be registered directly.

use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::time::Duration;

use nix::unistd::Pid;
use tracing::debug;

use crate::error::{ConfigError, WorkerError};
use crate::fork;
use crate::signals;

use super::WorkerContext;

/// Work run inside a worker process.
///
/// `startup` runs once per process before the first `run`; `run` is invoked
/// repeatedly with the worker's interval in between. Returning an error from
/// either ends the process, and the supervisor replaces it on its next tick.
pub trait Job {
    fn startup(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        Ok(())
    }

    fn run(&mut self, ctx: &WorkerContext) -> Result<(), WorkerError>;

    /// Whether [`startup`](Job::startup) does anything. Only used for logging.
    fn has_startup(&self) -> bool {
        false
    }
}

type StartupFn<S> = Box<dyn FnMut(&WorkerContext) -> Result<S, WorkerError>>;
type LoopFn<S> = Box<dyn FnMut(&WorkerContext, &mut S) -> Result<(), WorkerError>>;

/// Closure-backed job.
///
/// The value returned by the startup closure is kept for the lifetime of the
/// process and passed to every loop invocation.
pub struct CallableJob<S = ()> {
    startup: StartupFn<S>,
    run: LoopFn<S>,
    has_startup: bool,
    state: Option<S>,
}

impl CallableJob<()> {
    /// A job without startup.
    pub fn new<F>(mut run: F) -> Self
    where
        F: FnMut(&WorkerContext) -> Result<(), WorkerError> + 'static,
    {
        Self {
            startup: Box::new(|_| Ok(())),
            run: Box::new(move |ctx, _| run(ctx)),
            has_startup: false,
            state: None,
        }
    }
}

impl<S: 'static> CallableJob<S> {
    /// A job whose `startup` produces state shared by all loop calls of one
    /// process.
    pub fn with_startup<U, F>(startup: U, run: F) -> Self
    where
        U: FnMut(&WorkerContext) -> Result<S, WorkerError> + 'static,
        F: FnMut(&WorkerContext, &mut S) -> Result<(), WorkerError> + 'static,
    {
        Self {
            startup: Box::new(startup),
            run: Box::new(run),
            has_startup: true,
            state: None,
        }
    }
}

impl<S> Job for CallableJob<S> {
    fn startup(&mut self, ctx: &WorkerContext) -> Result<(), WorkerError> {
        self.state = Some((self.startup)(ctx)?);
        Ok(())
    }

    fn run(&mut self, ctx: &WorkerContext) -> Result<(), WorkerError> {
        if self.state.is_none() {
            self.state = Some((self.startup)(ctx)?);
        }
        match self.state.as_mut() {
            Some(state) => (self.run)(ctx, state),
            None => Ok(()),
        }
    }

    fn has_startup(&self) -> bool {
        self.has_startup
    }
}

impl<S> fmt::Debug for CallableJob<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableJob")
            .field("has_startup", &self.has_startup)
            .field("started", &self.state.is_some())
            .finish_non_exhaustive()
    }
}

/// How often a running program is checked for exit and pending stops.
const EXEC_POLL: Duration = Duration::from_millis(20);

/// Runs an external program once per loop iteration and waits for it.
///
/// The worker name and interval are exported to the program as
/// `PROCWARDEN_WORKER` and `PROCWARDEN_INTERVAL_MS`. A non-zero exit is a
/// worker failure, except after a shutdown signal reached the worker: that
/// signal is passed on to the program, and however it then exits, the
/// iteration counts as a clean stop. On Linux the program is also killed if
/// the worker process dies first.
#[derive(Debug, Clone)]
pub struct ExecutableJob {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl ExecutableJob {
    /// Fails unless `program` is an executable regular file.
    pub fn new(
        worker: &str,
        program: impl Into<PathBuf>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let program = program.into();
        if !is_executable(&program) {
            return Err(ConfigError::NotExecutable {
                name: worker.to_string(),
                path: program,
            });
        }
        Ok(Self { program, args, env })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl ExecutableJob {
    fn exec_error(&self, source: std::io::Error) -> WorkerError {
        WorkerError::Exec {
            program: self.program.clone(),
            source,
        }
    }

    /// Wait for `child`, relaying the worker's shutdown signal to it once.
    /// Returns the exit status and whether a stop was relayed.
    fn wait_relaying(&self, child: &mut Child) -> Result<(ExitStatus, bool), WorkerError> {
        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(child.id() as i32);
        let mut relayed = false;
        loop {
            if let Some(status) = child.try_wait().map_err(|e| self.exec_error(e))? {
                return Ok((status, relayed));
            }
            if !relayed {
                if let Some(signal) = signals::worker_stop_signal() {
                    debug!("relaying {signal} to {} (pid {pid})", self.program.display());
                    fork::send_signal(pid, signal);
                    relayed = true;
                }
            }
            std::thread::sleep(EXEC_POLL);
        }
    }
}

impl Job for ExecutableJob {
    fn run(&mut self, ctx: &WorkerContext) -> Result<(), WorkerError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .env("PROCWARDEN_WORKER", ctx.name())
            .env("PROCWARDEN_INTERVAL_MS", ctx.interval().as_millis().to_string());
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::process::CommandExt;
            // SAFETY: prctl is async-signal-safe.
            unsafe {
                command.pre_exec(|| {
                    nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL).map_err(std::io::Error::from)
                });
            }
        }

        let mut child = command.spawn().map_err(|e| self.exec_error(e))?;
        let (status, relayed) = self.wait_relaying(&mut child)?;
        if status.success() || relayed {
            Ok(())
        } else {
            Err(WorkerError::ExitStatus {
                program: self.program.clone(),
                status,
            })
        }
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}
