//! The reconciliation loop: keep `amount` processes alive per worker.
//!
//! ```text
//!            ┌────────────────────── Supervisor (parent) ──────────────────────┐
//!  signals ─▶│ atomics ─▶ absorb ─▶ restart? ─▶ tick ─▶ idle (tick_interval)   │
//!            │                                  │                              │
//!            │                 reap dead / spawn deficit / stop excess         │
//!            └──────────────────────────────────┼──────────────────────────────┘
//!                                    fork       ▼
//!                          ┌──────────┐ ┌──────────┐ ┌──────────┐
//!                          │ worker a │ │ worker a │ │ worker b │   children
//!                          └──────────┘ └──────────┘ └──────────┘
//! ```
//!
//! Phases move `Running → Stopping → Stopped`. A restart is an excursion from
//! `Running`: every process is stopped, the restart handler rewires the
//! registry, and reconciliation resumes with the new worker set.
//!
//! All OS interaction goes through [`Processes`], so the whole state machine
//! runs against an in-memory process table in tests.

mod child;
mod shutdown;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{error, info, warn};

use crate::error::{ConfigError, SupervisorError};
use crate::events::{Event, EventKind, LogObserver, Observer, Observers};
use crate::fork::{self, ProcessHandle, Processes, UnixProcesses};
use crate::signals;
use crate::sleeper::{RealSleeper, Sleeper};
use crate::worker::{Worker, WorkerDefinition, WorkerRegistry};

pub use crate::fork::FAILURE_EXIT_CODE;
pub use shutdown::TerminateReport;

/// Rewires the registry during a restart.
pub type RestartHandler = Box<dyn FnMut(&mut WorkerRegistry) -> Result<(), ConfigError>>;

/// Runs once after every worker process is gone during a full shutdown.
pub type ShutdownHandler = Box<dyn FnMut()>;

/// Supervisor timing and signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Process name of the supervisor, also used as log prefix.
    pub name: String,
    /// Sent to workers to ask them to stop.
    pub shutdown_signal: Signal,
    /// How long workers get before SIGKILL.
    pub shutdown_timeout: Duration,
    /// Operator signal that triggers an in-place restart.
    pub restart_signal: Option<Signal>,
    /// Pause between two reconciliation passes.
    pub tick_interval: Duration,
    /// Granularity of every interruptible wait.
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            name: "procwarden".to_string(),
            shutdown_signal: Signal::SIGQUIT,
            shutdown_timeout: Duration::from_secs(30),
            restart_signal: None,
            tick_interval: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Stopping,
    Stopped,
}

pub struct Supervisor<P: Processes = UnixProcesses> {
    config: SupervisorConfig,
    registry: WorkerRegistry,
    processes: P,
    sleeper: Arc<dyn Sleeper>,
    observers: Observers,
    phase: Phase,
    stop_requested: bool,
    restart_requested: bool,
    restarting: bool,
    signal_driven: bool,
    restart_handler: Option<RestartHandler>,
    shutdown_handler: Option<ShutdownHandler>,
}

impl Supervisor<UnixProcesses> {
    pub fn builder(name: impl Into<String>) -> SupervisorBuilder {
        SupervisorBuilder::new(name)
    }
}

impl<P: Processes> Supervisor<P> {
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting
    }

    pub(crate) fn sleeper(&self) -> &dyn Sleeper {
        &*self.sleeper
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Register a worker at runtime. It is started on the next tick.
    pub fn register(&mut self, name: &str, definition: WorkerDefinition) -> Result<(), ConfigError> {
        self.registry.register(Worker::from_definition(name, definition)?)
    }

    /// Remove a worker without stopping its processes; they become orphans.
    /// Call [`stop_worker`](Self::stop_worker) first to stop them.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.registry.unregister(name).is_some()
    }

    /// Mutable access for changing amount or interval at runtime.
    pub fn worker_mut(&mut self, name: &str) -> Option<&mut Worker> {
        self.registry.get_mut(name)
    }

    /// Pids currently tracked for `name`, oldest first.
    pub fn running(&self, name: &str) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.registry.handles(name).iter().map(ProcessHandle::pid).collect();
        pids.sort();
        pids
    }

    pub fn set_restart_handler(&mut self, handler: RestartHandler) {
        self.restart_handler = Some(handler);
    }

    pub fn set_shutdown_handler(&mut self, handler: ShutdownHandler) {
        self.shutdown_handler = Some(handler);
    }

    pub fn add_observer(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    /// Ask the loop to shut down at its next check.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Ask the loop to restart at its next check.
    pub fn request_restart(&mut self) {
        self.restart_requested = true;
    }

    fn policy(&self) -> shutdown::Policy {
        shutdown::Policy {
            signal: self.config.shutdown_signal,
            timeout: self.config.shutdown_timeout,
            poll: self.config.poll_interval,
        }
    }

    /// One reconciliation pass over every worker, in registration order.
    pub fn tick(&mut self) {
        let policy = self.policy();
        let poll = self.config.poll_interval;
        let Self {
            config,
            registry,
            processes,
            sleeper,
            observers,
            ..
        } = self;
        let observers: &Observers = observers;

        registry.orphans_mut().retain(|h| processes.is_alive(h));

        for entry in registry.entries_mut() {
            entry.handles.retain(|h| processes.is_alive(h));
            let amount = entry.worker.amount();
            let alive = entry.handles.len();
            let name = entry.worker.name().to_string();

            if alive < amount {
                for _ in alive..amount {
                    observers.emit(&Event::new(EventKind::WorkerStarting).with_worker(&name));
                    let spawned = processes.spawn(&name, policy.signal, &mut || {
                        child::worker_main(&mut entry.worker, &**sleeper, observers, poll)
                    });
                    match spawned {
                        Ok(handle) => {
                            info!("{}: started worker {name} (pid {})", config.name, handle.pid());
                            observers.emit(
                                &Event::new(EventKind::WorkerStarted)
                                    .with_worker(&name)
                                    .with_pid(handle.pid()),
                            );
                            entry.handles.push(handle);
                        }
                        Err(e) => {
                            warn!("{}: {e}, retrying next tick", config.name);
                            break;
                        }
                    }
                }
            } else if alive > amount {
                entry.handles.sort_by_key(ProcessHandle::pid);
                let excess: Vec<ProcessHandle> = entry.handles.drain(..alive - amount).collect();
                info!(
                    "{}: scaling {name} down from {alive} to {amount} process(es)",
                    config.name
                );
                shutdown::terminate(processes, &**sleeper, observers, policy, &excess);
            }
        }
    }

    /// Every tracked handle: registered workers in order, pid-ascending
    /// within a worker, then orphans.
    fn ordered_handles(&self) -> Vec<ProcessHandle> {
        let mut handles = Vec::new();
        for name in self.registry.names() {
            let mut own = self.registry.handles(&name).to_vec();
            own.sort_by_key(ProcessHandle::pid);
            handles.extend(own);
        }
        let mut orphans = self.registry.orphans().to_vec();
        orphans.sort_by_key(ProcessHandle::pid);
        handles.extend(orphans);
        handles
    }

    fn terminate_all(&mut self) -> TerminateReport {
        let handles = self.ordered_handles();
        let policy = self.policy();
        let report = shutdown::terminate(
            &mut self.processes,
            &*self.sleeper,
            &self.observers,
            policy,
            &handles,
        );
        self.registry.forget_handles();
        report
    }

    /// Stop the processes of one worker with the grace/force protocol. The
    /// worker stays registered, so the next tick starts it again unless it
    /// is unregistered first.
    pub fn stop_worker(&mut self, name: &str) -> Option<TerminateReport> {
        let policy = self.policy();
        let entry = self.registry.entry_mut(name)?;
        entry.handles.sort_by_key(ProcessHandle::pid);
        let handles = std::mem::take(&mut entry.handles);
        Some(shutdown::terminate(
            &mut self.processes,
            &*self.sleeper,
            &self.observers,
            policy,
            &handles,
        ))
    }

    /// Stop everything, call the restart handler, and resume.
    pub fn restart(&mut self) -> Result<(), ConfigError> {
        self.restart_requested = false;
        if self.phase != Phase::Running {
            return Ok(());
        }
        self.restarting = true;
        info!("{}: restarting", self.config.name);
        self.observers.emit(&Event::new(EventKind::Restarting));

        self.terminate_all();
        let result = match self.restart_handler.as_mut() {
            Some(handler) => handler(&mut self.registry),
            None => Ok(()),
        };

        self.restarting = false;
        self.observers.emit(&Event::new(EventKind::Restarted));
        info!(
            "{}: restarted with {} worker(s)",
            self.config.name,
            self.registry.len()
        );
        result
    }

    /// Graceful-then-forceful stop of every process. Idempotent.
    pub fn shutdown(&mut self) -> TerminateReport {
        if self.phase != Phase::Running {
            return TerminateReport::default();
        }
        self.phase = Phase::Stopping;
        info!("{}: shutting down", self.config.name);
        self.observers.emit(&Event::new(EventKind::DaemonStopping));

        let report = self.terminate_all();
        if let Some(handler) = self.shutdown_handler.as_mut() {
            handler();
        }

        self.phase = Phase::Stopped;
        self.observers.emit(&Event::new(EventKind::DaemonStopped));
        info!(
            "{}: stopped ({} signalled, {} killed)",
            self.config.name,
            report.signalled,
            report.killed.len()
        );
        report
    }

    /// Supervise in the foreground until a shutdown signal arrives.
    ///
    /// Installs the process-wide signal handlers, so only call this in a
    /// process dedicated to supervising.
    pub fn run(&mut self) -> Result<(), SupervisorError> {
        signals::install_parent_handlers(self.config.shutdown_signal, self.config.restart_signal)?;
        fork::set_process_name(&self.config.name);
        self.signal_driven = true;
        info!(
            "{}: supervising {} worker(s) (pid {})",
            self.config.name,
            self.registry.len(),
            nix::unistd::getpid()
        );
        self.supervise(None);
        Ok(())
    }

    fn absorb_signals(&mut self) {
        if !self.signal_driven {
            return;
        }
        if signals::stop_requested() {
            self.stop_requested = true;
        }
        if signals::take_restart_request() {
            self.restart_requested = true;
        }
    }

    fn wake_requested(&self) -> bool {
        self.stop_requested
            || self.restart_requested
            || (self.signal_driven && (signals::stop_requested() || signals::restart_pending()))
    }

    /// The main loop. `max_ticks` bounds the number of passes; the loop
    /// always ends with a full shutdown.
    fn supervise(&mut self, mut max_ticks: Option<usize>) {
        loop {
            self.absorb_signals();
            if self.stop_requested {
                break;
            }
            if self.restart_requested {
                if let Err(e) = self.restart() {
                    error!("{}: restart handler failed: {e}", self.config.name);
                }
            }
            self.tick();

            if let Some(left) = max_ticks.as_mut() {
                *left = left.saturating_sub(1);
                if *left == 0 {
                    break;
                }
            }

            let sleeper = Arc::clone(&self.sleeper);
            sleeper.sleep_unless(self.config.tick_interval, self.config.poll_interval, &|| {
                self.wake_requested()
            });
        }
        self.shutdown();
    }
}

impl<P: Processes> fmt::Debug for Supervisor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("phase", &self.phase)
            .field("workers", &self.registry.names())
            .finish_non_exhaustive()
    }
}

/// Collects configuration and worker definitions, validating them on
/// [`build`](SupervisorBuilder::build).
pub struct SupervisorBuilder {
    config: SupervisorConfig,
    sleeper: Arc<dyn Sleeper>,
    observers: Observers,
    workers: Vec<(String, WorkerDefinition)>,
    restart_handler: Option<RestartHandler>,
    shutdown_handler: Option<ShutdownHandler>,
}

impl SupervisorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let mut observers = Observers::new();
        observers.push(Arc::new(LogObserver));
        Self {
            config: SupervisorConfig {
                name: name.into(),
                ..SupervisorConfig::default()
            },
            sleeper: Arc::new(RealSleeper),
            observers,
            workers: Vec::new(),
            restart_handler: None,
            shutdown_handler: None,
        }
    }

    /// Replace the whole configuration, keeping the name given to `new`
    /// when `config.name` is empty.
    #[must_use]
    pub fn config(mut self, config: SupervisorConfig) -> Self {
        let name = std::mem::take(&mut self.config.name);
        self.config = config;
        if self.config.name.is_empty() {
            self.config.name = name;
        }
        self
    }

    #[must_use]
    pub fn shutdown_signal(mut self, signal: Signal) -> Self {
        self.config.shutdown_signal = signal;
        self
    }

    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn restart_signal(mut self, signal: Signal) -> Self {
        self.config.restart_signal = Some(signal);
        self
    }

    #[must_use]
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Add an observer next to the default log observer.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Replace the observer set, dropping the default log observer.
    #[must_use]
    pub fn observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    #[must_use]
    pub fn worker(mut self, name: impl Into<String>, definition: impl Into<WorkerDefinition>) -> Self {
        self.workers.push((name.into(), definition.into()));
        self
    }

    #[must_use]
    pub fn on_restart<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut WorkerRegistry) -> Result<(), ConfigError> + 'static,
    {
        self.restart_handler = Some(Box::new(handler));
        self
    }

    #[must_use]
    pub fn on_shutdown<F: FnMut() + 'static>(mut self, handler: F) -> Self {
        self.shutdown_handler = Some(Box::new(handler));
        self
    }

    /// Build against real processes.
    pub fn build(self) -> Result<Supervisor, ConfigError> {
        self.build_with(UnixProcesses)
    }

    /// Build against a custom process table.
    pub fn build_with<P: Processes>(self, processes: P) -> Result<Supervisor<P>, ConfigError> {
        let mut registry = WorkerRegistry::new();
        for (name, definition) in self.workers {
            registry.register(Worker::from_definition(&name, definition)?)?;
        }
        Ok(Supervisor {
            config: self.config,
            registry,
            processes,
            sleeper: self.sleeper,
            observers: self.observers,
            phase: Phase::Running,
            stop_requested: false,
            restart_requested: false,
            restarting: false,
            signal_driven: false,
            restart_handler: self.restart_handler,
            shutdown_handler: self.shutdown_handler,
        })
    }
}
