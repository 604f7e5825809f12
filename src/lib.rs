#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! procwarden library: a forking supervisor for long-running worker loops.
//!
//! A [`Supervisor`] keeps `amount` forked processes alive for every
//! registered [`Worker`], replaces crashed ones on its next tick, and stops
//! them with a graceful-then-forceful protocol on shutdown or restart.
//!
//! - `supervisor`: reconciliation loop, shutdown protocol, restart
//! - `worker`: worker definitions, jobs and the registry
//! - `fork`: fork/kill/reap primitives behind the `Processes` seam
//! - `signals`: parent and child signal dispositions
//! - `sleeper`: real, fuzzy and eco wait strategies
//! - `events`: lifecycle events and observers
//! - `detach` / `pidfile`: background start and pid-file driven stop
//! - `config`: TOML + env-var configuration for the binary
//!
//! ```no_run
//! use std::time::Duration;
//! use procwarden::{Supervisor, WorkerSpec, CallableJob};
//!
//! let mut supervisor = Supervisor::builder("demo")
//!     .worker("hello", WorkerSpec::new(CallableJob::new(|ctx| {
//!         println!("hello from {}", ctx.name());
//!         Ok(())
//!     })).interval(Duration::from_secs(1)).amount(2))
//!     .build()?;
//! supervisor.run()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod detach;
pub mod error;
pub mod events;
pub mod fork;
pub mod pidfile;
pub mod signals;
pub mod sleeper;
pub mod supervisor;
pub mod util;
pub mod worker;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use detach::HaltOutcome;
pub use events::{Event, EventKind, LogObserver, Observer, Observers};
pub use fork::{ProcessHandle, Processes, UnixProcesses};
pub use pidfile::PidFile;
pub use sleeper::{EcoSleeper, FuzzySleeper, RealSleeper, Sleeper};
pub use supervisor::{Phase, Supervisor, SupervisorBuilder, SupervisorConfig, TerminateReport};
pub use worker::{
    CallableJob, ExecutableJob, Job, Worker, WorkerContext, WorkerDefinition, WorkerRegistry, WorkerSpec,
};
