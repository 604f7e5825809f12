//! Error types for the supervisor and its collaborators.
//!
//! - [`ConfigError`]: malformed worker definitions, registry conflicts and
//!   config file problems. Always raised synchronously at build time.
//! - [`SpawnError`]: a fork attempt failed. Retryable: the supervisor logs it
//!   and tries again on the next tick.
//! - [`SignalError`]: a signal disposition could not be installed.
//! - [`WorkerError`]: a worker body failed inside its child process. The child
//!   exits and the parent respawns it.
//! - [`DetachError`] / [`HaltError`]: pid-file driven start/stop.

use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use thiserror::Error;

/// Invalid worker definitions, registry conflicts and config file failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("worker with name '{0}' already registered")]
    DuplicateName(String),

    #[error("worker needs a name")]
    MissingName,

    #[error("worker '{0}' is missing the loop definition")]
    MissingLoop(String),

    #[error("worker '{0}' must run at least one process")]
    ZeroAmount(String),

    #[error("worker name '{actual}' and register name '{expected}' do not match")]
    NameMismatch { expected: String, actual: String },

    #[error("loop command \"{}\" of worker '{name}' needs to be executable", path.display())]
    NotExecutable { name: String, path: PathBuf },

    #[error("unknown signal '{0}'")]
    UnknownSignal(String),

    #[error("{field} must be a finite, non-negative number of seconds, got {value}")]
    InvalidDuration { field: String, value: f64 },

    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// A fork attempt for a worker failed (usually resource exhaustion).
#[derive(Debug, Error)]
#[error("failed to fork process for worker '{worker}': {source}")]
pub struct SpawnError {
    pub worker: String,
    #[source]
    pub source: nix::Error,
}

/// Installing a signal disposition failed.
#[derive(Debug, Error)]
#[error("failed to install handler for {signal}: {source}")]
pub struct SignalError {
    pub signal: Signal,
    #[source]
    pub source: nix::Error,
}

/// Failure of a worker body inside its child process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{0}")]
    Failed(String),

    #[error("failed to execute \"{}\": {source}", program.display())]
    Exec {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("\"{}\" exited with {status}", program.display())]
    ExitStatus {
        program: PathBuf,
        status: std::process::ExitStatus,
    },
}

impl WorkerError {
    /// Convenience constructor for ad-hoc failures from closures.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Errors from [`crate::Supervisor::run`].
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// Errors from [`crate::Supervisor::run_detached`].
#[derive(Debug, Error)]
pub enum DetachError {
    #[error("found running process with pid {pid} in {} -> will not start", path.display())]
    AlreadyRunning { pid: Pid, path: PathBuf },

    #[error("pid file {} is not writable: {source}", path.display())]
    PidFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to create readiness pipe: {0}")]
    Pipe(#[source] nix::Error),

    #[error("failed to fork from parent: {0}")]
    Fork(#[source] nix::Error),

    #[error("detached process failed to become session leader")]
    SessionLeader,

    #[error("detached process could not write its pid to {}", path.display())]
    PidWrite { path: PathBuf },

    #[error("detached process exited before reporting readiness")]
    ChildVanished,
}

/// Errors from [`crate::Supervisor::halt`].
#[derive(Debug, Error)]
pub enum HaltError {
    #[error("sent {signal} to {pid} but it did not shut down within {timeout:?}")]
    Timeout {
        pid: Pid,
        signal: Signal,
        timeout: Duration,
    },

    #[error("failed to signal {pid}: {source}")]
    Signal {
        pid: Pid,
        source: nix::Error,
    },

    #[error("failed to remove pid file {}: {source}", path.display())]
    PidFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_name_message() {
        let err = ConfigError::DuplicateName("mailer".into());
        assert_eq!(err.to_string(), "worker with name 'mailer' already registered");
    }

    #[test]
    fn test_spawn_error_names_worker() {
        let err = SpawnError {
            worker: "w".into(),
            source: nix::Error::EAGAIN,
        };
        assert!(err.to_string().contains("'w'"));
    }

    #[test]
    fn test_not_executable_mentions_path() {
        let err = ConfigError::NotExecutable {
            name: "job".into(),
            path: PathBuf::from("/etc/passwd"),
        };
        assert!(err.to_string().contains("/etc/passwd"));
    }
}
