//! Worker definitions: what runs, how often, and in how many processes.
//!
//! A [`Worker`] pairs a [`Job`] with its loop interval and desired process
//! count. Workers are usually built from a [`WorkerDefinition`], which accepts
//! a bare closure, a partial [`WorkerSpec`], or an already-built `Worker`.
//!
//! ```text
//!  WorkerDefinition ──from_definition──▶ Worker ──register──▶ WorkerRegistry
//!    Callable(fn)                         name                  name → Worker
//!    Configured(spec)                     interval                     + pids
//!    Custom(worker)                       amount
//!                                         job
//! ```

pub mod job;
pub mod registry;

use std::fmt;
use std::time::Duration;

use crate::error::{ConfigError, WorkerError};

pub use job::{CallableJob, ExecutableJob, Job};
pub use registry::WorkerRegistry;

/// Pause between two loop invocations when none is given.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Processes per worker when none is given.
pub const DEFAULT_AMOUNT: usize = 1;

/// Read-only view of a worker handed to its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext {
    name: String,
    interval: Duration,
    amount: usize,
}

impl WorkerContext {
    pub fn new(name: impl Into<String>, interval: Duration, amount: usize) -> Self {
        Self {
            name: name.into(),
            interval,
            amount,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn amount(&self) -> usize {
        self.amount
    }
}

/// A named job run repeatedly in `amount` parallel processes.
pub struct Worker {
    name: String,
    interval: Duration,
    amount: usize,
    job: Box<dyn Job>,
}

impl Worker {
    /// A worker with the default interval and amount.
    pub fn new(name: impl Into<String>, job: impl Job + 'static) -> Self {
        Self::from_boxed(name, Box::new(job))
    }

    pub fn from_boxed(name: impl Into<String>, job: Box<dyn Job>) -> Self {
        Self {
            name: name.into(),
            interval: DEFAULT_INTERVAL,
            amount: DEFAULT_AMOUNT,
            job,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the process count. Zero is rejected.
    pub fn with_amount(mut self, amount: usize) -> Result<Self, ConfigError> {
        self.set_amount(amount)?;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn amount(&self) -> usize {
        self.amount
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Change the desired process count. Takes effect on the next tick.
    pub fn set_amount(&mut self, amount: usize) -> Result<(), ConfigError> {
        if amount == 0 {
            return Err(ConfigError::ZeroAmount(self.name.clone()));
        }
        self.amount = amount;
        Ok(())
    }

    pub fn context(&self) -> WorkerContext {
        WorkerContext::new(self.name.clone(), self.interval, self.amount)
    }

    pub(crate) fn startup(&mut self) -> Result<(), WorkerError> {
        let ctx = self.context();
        self.job.startup(&ctx)
    }

    pub(crate) fn run_once(&mut self) -> Result<(), WorkerError> {
        let ctx = self.context();
        self.job.run(&ctx)
    }

    pub(crate) fn has_startup(&self) -> bool {
        self.job.has_startup()
    }

    /// Build a worker named `name` from any accepted definition shape.
    ///
    /// Fails on an empty name, a missing loop, a zero amount, or a pre-built
    /// worker whose own name differs from `name`.
    pub fn from_definition(name: &str, definition: WorkerDefinition) -> Result<Self, ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::MissingName);
        }
        match definition {
            WorkerDefinition::Callable(run) => Ok(Self::from_boxed(name, Box::new(CallableJob::new(run)))),
            WorkerDefinition::Configured(spec) => {
                let job = spec.job.ok_or_else(|| ConfigError::MissingLoop(name.to_string()))?;
                let mut worker = Self::from_boxed(name, job);
                if let Some(interval) = spec.interval {
                    worker.set_interval(interval);
                }
                if let Some(amount) = spec.amount {
                    worker.set_amount(amount)?;
                }
                Ok(worker)
            }
            WorkerDefinition::Custom(worker) => {
                if worker.name != name {
                    return Err(ConfigError::NameMismatch {
                        expected: name.to_string(),
                        actual: worker.name,
                    });
                }
                Ok(worker)
            }
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("amount", &self.amount)
            .finish_non_exhaustive()
    }
}

type LoopClosure = Box<dyn FnMut(&WorkerContext) -> Result<(), WorkerError>>;

/// The shapes a worker can be declared in.
pub enum WorkerDefinition {
    /// Just the loop body; interval and amount take their defaults.
    Callable(LoopClosure),
    /// Loop plus optional overrides.
    Configured(WorkerSpec),
    /// A fully built worker, registered as-is.
    Custom(Worker),
}

impl WorkerDefinition {
    pub fn callable<F>(run: F) -> Self
    where
        F: FnMut(&WorkerContext) -> Result<(), WorkerError> + 'static,
    {
        Self::Callable(Box::new(run))
    }
}

impl From<WorkerSpec> for WorkerDefinition {
    fn from(spec: WorkerSpec) -> Self {
        Self::Configured(spec)
    }
}

impl From<Worker> for WorkerDefinition {
    fn from(worker: Worker) -> Self {
        Self::Custom(worker)
    }
}

/// Partial worker description. Everything but the job is optional.
#[derive(Default)]
pub struct WorkerSpec {
    pub job: Option<Box<dyn Job>>,
    pub interval: Option<Duration>,
    pub amount: Option<usize>,
}

impl WorkerSpec {
    pub fn new(job: impl Job + 'static) -> Self {
        Self {
            job: Some(Box::new(job)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    #[must_use]
    pub fn amount(mut self, amount: usize) -> Self {
        self.amount = Some(amount);
        self
    }
}
