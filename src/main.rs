#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # procwarden
//!
//! Forking process supervisor. Keeps a configured number of processes alive
//! for each named worker, replaces crashed ones, and shuts everything down
//! gracefully (signal, wait, SIGKILL) on request.
//!
//! ## Subcommands
//!
//! - `procwarden run`: supervise in the foreground
//! - `procwarden start`: supervise in a detached background process
//! - `procwarden stop [--force]`: stop the background supervisor
//!
//! All three accept `--config <path>`; `start` and `stop` also accept
//! `--pidfile <path>`, falling back to `supervisor.pid_file` from the config.
//!
//! ## Signals
//!
//! | Signal                  | Effect on the supervisor                    |
//! |-------------------------|---------------------------------------------|
//! | SIGTERM, SIGQUIT, SIGINT | graceful shutdown of all workers, then exit |
//! | `restart_signal`        | stop all workers, re-read config, resume    |

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use clap::{CommandFactory, Parser, Subcommand};
use thiserror::Error;
use tracing::{error, info, warn};

use procwarden::error::{ConfigError, DetachError, HaltError, SupervisorError};
use procwarden::{Config, HaltOutcome, PidFile, Supervisor, WorkerRegistry};

/// Forking process supervisor.
#[derive(Parser)]
#[command(name = "procwarden", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise the configured workers in the foreground.
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Supervise in a detached background process.
    Start {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Pid file of the background supervisor.
        #[arg(long)]
        pidfile: Option<PathBuf>,
    },
    /// Stop the background supervisor.
    Stop {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Pid file of the background supervisor.
        #[arg(long)]
        pidfile: Option<PathBuf>,
        /// SIGKILL the supervisor if it does not stop in time.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Detach(#[from] DetachError),
    #[error(transparent)]
    Halt(#[from] HaltError),
    #[error("failed to open log file {}: {source}", path.display())]
    LogFile { path: PathBuf, source: std::io::Error },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("procwarden: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Run { config } => {
            let cfg = Config::load(config.as_deref())?;
            init_tracing(&cfg)?;
            info!("procwarden v{} starting", env!("CARGO_PKG_VERSION"));
            let mut supervisor = build_supervisor(&cfg, config)?;
            if supervisor.registry().is_empty() {
                warn!("No workers configured");
            }
            supervisor.run()?;
        }
        Commands::Start { config, pidfile } => {
            let cfg = Config::load(config.as_deref())?;
            init_tracing(&cfg)?;
            let pidfile = resolve_pidfile(pidfile, &cfg);
            if cfg.log_file().is_none() {
                warn!("No logging.file configured, background output is discarded");
            }
            let mut supervisor = build_supervisor(&cfg, config)?;
            let pid = supervisor.run_detached(&pidfile)?;
            println!("procwarden started (pid {pid})");
        }
        Commands::Stop {
            config,
            pidfile,
            force,
        } => {
            let cfg = Config::load(config.as_deref())?;
            init_tracing(&cfg)?;
            let pidfile = resolve_pidfile(pidfile, &cfg);
            let supervisor = Supervisor::builder(cfg.supervisor.name.clone())
                .config(cfg.supervisor_config()?)
                .build()?;
            match supervisor.halt(&pidfile, force)? {
                HaltOutcome::Stopped => println!("procwarden stopped"),
                HaltOutcome::Killed => println!("procwarden killed"),
                HaltOutcome::AlreadyStopped => println!("procwarden was not running"),
            }
        }
    }
    Ok(())
}

/// `--pidfile` wins over the config. Having neither is a usage error.
fn resolve_pidfile(flag: Option<PathBuf>, config: &Config) -> PidFile {
    match flag.or_else(|| config.pid_file()) {
        Some(path) => PidFile::new(path),
        None => Cli::command()
            .error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "no pid file: pass --pidfile or set supervisor.pid_file",
            )
            .exit(),
    }
}

fn init_tracing(config: &Config) -> Result<(), CliError> {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    match config.log_file() {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| CliError::LogFile { path, source })?;
            tracing_subscriber::fmt()
                .with_env_filter(log_filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(log_filter).init(),
    }
    Ok(())
}

fn build_supervisor(config: &Config, config_path: Option<PathBuf>) -> Result<Supervisor, ConfigError> {
    let mut builder = Supervisor::builder(config.supervisor.name.clone())
        .config(config.supervisor_config()?)
        .sleeper(config.sleeper()?);
    for worker in config.workers()? {
        let name = worker.name().to_string();
        builder = builder.worker(name, worker);
    }
    builder
        .on_restart(move |registry| reload_workers(config_path.as_deref(), registry))
        .build()
}

/// Restart handler: swap the registry contents for the workers currently in
/// the config file. The file is validated before anything is replaced.
fn reload_workers(path: Option<&Path>, registry: &mut WorkerRegistry) -> Result<(), ConfigError> {
    let workers = Config::load(path)?.workers()?;
    registry.clear();
    for worker in workers {
        registry.register(worker)?;
    }
    info!("Reloaded {} worker(s) from config", registry.len());
    Ok(())
}
