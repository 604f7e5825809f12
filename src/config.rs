//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `PROCWARDEN_PID_FILE`,
//!    `PROCWARDEN_LOG_LEVEL`, `PROCWARDEN_SHUTDOWN_TIMEOUT`
//! 2. **Config file**: path via `--config <path>`, or `procwarden.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [supervisor]
//! name = "procwarden"
//! shutdown_signal = "SIGQUIT"
//! shutdown_timeout_secs = 30
//! restart_signal = "SIGUSR1"       # optional, enables in-place restart
//! tick_interval_ms = 2000
//! poll_interval_ms = 100
//! pid_file = "~/procwarden.pid"    # optional default for start/stop
//!
//! [sleeper]
//! kind = "real"                    # real | fuzzy | eco
//! fuzziness = 0.5
//! pause_every_secs = 1.0
//!
//! [logging]
//! level = "info"
//! file = "/var/log/procwarden.log" # optional, required when detached
//!
//! # One table per worker, started in file order
//! [workers.hello]
//! command = "/bin/echo"
//! args = ["hello"]
//! env = { GREETING = "hi" }
//! interval_secs = 10
//! amount = 2
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::signals::parse_signal;
use crate::sleeper::{EcoSleeper, FuzzySleeper, RealSleeper, Sleeper};
use crate::supervisor::SupervisorConfig;
use crate::util::config_path;
use crate::worker::{ExecutableJob, Worker, WorkerSpec};

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "procwarden.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub sleeper: SleeperSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Workers keyed by name, in file order.
    #[serde(default)]
    pub workers: IndexMap<String, WorkerConfig>,
}

/// Supervisor timing and signals.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSettings {
    /// Process name and log prefix (default `procwarden`).
    #[serde(default = "default_name")]
    pub name: String,
    /// Signal sent to workers on shutdown (default `SIGQUIT`).
    #[serde(default = "default_shutdown_signal")]
    pub shutdown_signal: String,
    /// Seconds workers get before SIGKILL (default 30). Override with
    /// `PROCWARDEN_SHUTDOWN_TIMEOUT`.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Signal that reloads the worker set in place. Disabled when unset.
    pub restart_signal: Option<String>,
    /// Milliseconds between reconciliation passes (default 2000).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Granularity of interruptible waits in milliseconds (default 100).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pid file used by `start` and `stop`. Override with `PROCWARDEN_PID_FILE`.
    pub pid_file: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SleeperKind {
    #[default]
    Real,
    Fuzzy,
    Eco,
}

/// Wait strategy shared by the supervisor and its workers.
#[derive(Debug, Clone, Deserialize)]
pub struct SleeperSettings {
    #[serde(default)]
    pub kind: SleeperKind,
    /// Fuzz factor in `[0, 1]` (default 0.5 for `fuzzy`, ignored by `real`).
    #[serde(default = "default_fuzziness")]
    pub fuzziness: f64,
    /// Batch length for `eco` in seconds (default 1.0).
    #[serde(default = "default_pause_every_secs")]
    pub pause_every_secs: f64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` and
    /// `PROCWARDEN_LOG_LEVEL`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Append log output to this file instead of stderr.
    pub file: Option<String>,
}

/// One worker running an external command each iteration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Seconds between two runs (default 10).
    pub interval_secs: Option<f64>,
    /// Parallel processes (default 1).
    pub amount: Option<usize>,
}

fn default_name() -> String {
    "procwarden".to_string()
}
fn default_shutdown_signal() -> String {
    "SIGQUIT".to_string()
}
fn default_shutdown_timeout_secs() -> u64 {
    30
}
fn default_tick_interval_ms() -> u64 {
    2000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_fuzziness() -> f64 {
    0.5
}
fn default_pause_every_secs() -> f64 {
    1.0
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            shutdown_signal: default_shutdown_signal(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            restart_signal: None,
            tick_interval_ms: default_tick_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            pid_file: None,
        }
    }
}

impl Default for SleeperSettings {
    fn default() -> Self {
        Self {
            kind: SleeperKind::default(),
            fuzziness: default_fuzziness(),
            pause_every_secs: default_pause_every_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `procwarden.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply env var overrides through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("PROCWARDEN_PID_FILE") {
            self.supervisor.pid_file = Some(path);
        }
        if let Some(level) = lookup("PROCWARDEN_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(secs) = lookup("PROCWARDEN_SHUTDOWN_TIMEOUT").and_then(|s| s.trim().parse().ok()) {
            self.supervisor.shutdown_timeout_secs = secs;
        }
    }

    /// Resolve signal names and durations.
    pub fn supervisor_config(&self) -> Result<SupervisorConfig, ConfigError> {
        let s = &self.supervisor;
        Ok(SupervisorConfig {
            name: s.name.clone(),
            shutdown_signal: parse_signal(&s.shutdown_signal)?,
            shutdown_timeout: Duration::from_secs(s.shutdown_timeout_secs),
            restart_signal: s.restart_signal.as_deref().map(parse_signal).transpose()?,
            tick_interval: Duration::from_millis(s.tick_interval_ms),
            poll_interval: Duration::from_millis(s.poll_interval_ms),
        })
    }

    pub fn sleeper(&self) -> Result<Arc<dyn Sleeper>, ConfigError> {
        let s = &self.sleeper;
        Ok(match s.kind {
            SleeperKind::Real => Arc::new(RealSleeper),
            SleeperKind::Fuzzy => Arc::new(FuzzySleeper::new(s.fuzziness)),
            SleeperKind::Eco => Arc::new(EcoSleeper::new(
                s.fuzziness,
                seconds("sleeper.pause_every_secs", s.pause_every_secs)?,
            )),
        })
    }

    /// Build every configured worker, in file order.
    pub fn workers(&self) -> Result<Vec<Worker>, ConfigError> {
        self.workers
            .iter()
            .map(|(name, w)| w.build(name))
            .collect()
    }

    pub fn pid_file(&self) -> Option<PathBuf> {
        self.supervisor
            .pid_file
            .as_deref()
            .map(config_path)
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.logging
            .file
            .as_deref()
            .map(config_path)
    }
}

/// Fractional seconds from the config file as a `Duration`.
fn seconds(field: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidDuration {
        field: field.to_string(),
        value,
    })
}

impl WorkerConfig {
    /// Validate the command and turn this entry into a worker named `name`.
    pub fn build(&self, name: &str) -> Result<Worker, ConfigError> {
        let job = ExecutableJob::new(
            name,
            config_path(&self.command),
            self.args.clone(),
            self.env.clone(),
        )?;
        let mut spec = WorkerSpec::new(job);
        if let Some(secs) = self.interval_secs {
            spec = spec.interval(seconds(&format!("workers.{name}.interval_secs"), secs)?);
        }
        if let Some(amount) = self.amount {
            spec = spec.amount(amount);
        }
        Worker::from_definition(name, spec.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    const SAMPLE: &str = r#"
        [supervisor]
        name = "sample"
        shutdown_signal = "TERM"
        shutdown_timeout_secs = 5
        restart_signal = "SIGUSR1"
        pid_file = "/tmp/sample.pid"

        [sleeper]
        kind = "eco"
        fuzziness = 0.8

        [workers.zeta]
        command = "/bin/sh"
        args = ["-c", "true"]
        amount = 2

        [workers.alpha]
        command = "/bin/sh"
        interval_secs = 0.5
    "#;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        let sup = config.supervisor_config().unwrap();
        assert_eq!(sup, SupervisorConfig::default());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.sleeper.kind, SleeperKind::Real);
        assert!(config.pid_file().is_none());
        assert!(config.workers().unwrap().is_empty());
    }

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        let sup = config.supervisor_config().unwrap();
        assert_eq!(sup.name, "sample");
        assert_eq!(sup.shutdown_signal, Signal::SIGTERM);
        assert_eq!(sup.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(sup.restart_signal, Some(Signal::SIGUSR1));
        assert_eq!(sup.tick_interval, Duration::from_secs(2));
        assert_eq!(config.sleeper.kind, SleeperKind::Eco);
        assert_eq!(config.pid_file(), Some(PathBuf::from("/tmp/sample.pid")));
    }

    #[test]
    fn test_workers_keep_file_order() {
        let config = Config::parse(SAMPLE).unwrap();
        let workers = config.workers().unwrap();
        let names: Vec<_> = workers.iter().map(Worker::name).collect();
        assert_eq!(names, ["zeta", "alpha"]);
        assert_eq!(workers[0].amount(), 2);
        assert_eq!(workers[1].interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_non_executable_command_rejected() {
        let config = Config::parse(
            r#"
            [workers.bad]
            command = "/etc/hostname-does-not-exist"
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.workers().unwrap_err(),
            ConfigError::NotExecutable { .. }
        ));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let config = Config::parse(
            r#"
            [workers.none]
            command = "/bin/sh"
            amount = 0
            "#,
        )
        .unwrap();
        assert!(matches!(config.workers().unwrap_err(), ConfigError::ZeroAmount(_)));
    }

    #[test]
    fn test_unknown_signal_rejected() {
        let config = Config::parse("[supervisor]\nshutdown_signal = \"SIGWHAT\"").unwrap();
        assert!(matches!(
            config.supervisor_config().unwrap_err(),
            ConfigError::UnknownSignal(_)
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.apply_overrides(|key| match key {
            "PROCWARDEN_PID_FILE" => Some("/run/other.pid".to_string()),
            "PROCWARDEN_LOG_LEVEL" => Some("debug".to_string()),
            "PROCWARDEN_SHUTDOWN_TIMEOUT" => Some("7".to_string()),
            _ => None,
        });
        assert_eq!(config.pid_file(), Some(PathBuf::from("/run/other.pid")));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.supervisor.shutdown_timeout_secs, 7);
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/procwarden.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_reports_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[supervisor\n").unwrap();
        assert!(matches!(
            Config::load(Some(&path)).unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }

    #[test]
    fn test_unrepresentable_durations_rejected() {
        let config = Config::parse(
            r#"
            [workers.forever]
            command = "/bin/sh"
            interval_secs = inf
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.workers().unwrap_err(),
            ConfigError::InvalidDuration { ref field, .. } if field == "workers.forever.interval_secs"
        ));

        let config = Config::parse("[sleeper]\nkind = \"eco\"\npause_every_secs = -1.0").unwrap();
        assert!(matches!(config.sleeper().err(), Some(ConfigError::InvalidDuration { .. })));
        let config = Config::parse("[sleeper]\nkind = \"eco\"\npause_every_secs = 1e300").unwrap();
        assert!(config.sleeper().is_err());
    }
}
