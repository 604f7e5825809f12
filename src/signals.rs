//! Signal dispositions for the supervisor (parent) and its workers (children).
//!
//! Handlers never touch supervisor state directly. They only flip
//! process-global atomics, which the reconciliation loop (parent) or the worker
//! loop (child) polls between sleep slices. Signal handlers cannot reach
//! instance data, so static storage is the only option.
//!
//! | context | signal                  | effect                          |
//! |---------|-------------------------|---------------------------------|
//! | parent  | SIGTERM, SIGQUIT, SIGINT | stop requested                 |
//! | parent  | shutdown signal (cfg.)  | stop requested                  |
//! | parent  | restart signal (opt.)   | restart requested               |
//! | parent  | SIGCHLD                 | ignored, reaping is explicit    |
//! | child   | SIGTERM, SIGQUIT, SIGINT | worker stop requested          |
//! | child   | shutdown signal (cfg.)  | worker stop requested           |
//! | child   | SIGCHLD                 | default disposition             |
//!
//! Between `fork` and [`install_child_handlers`] the child still runs the
//! parent's handlers. [`crate::fork::spawn`] blocks every signal across that
//! window, and a stop request the child inherited or caught in it carries over
//! into the worker flag.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

use crate::error::{ConfigError, SignalError};

/// Signals that request a shutdown, in parent and child alike.
pub const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGQUIT, Signal::SIGINT];

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);
static RESTART_REQUESTED: AtomicBool = AtomicBool::new(false);
static WORKER_STOP_REQUESTED: AtomicBool = AtomicBool::new(false);
static WORKER_STOP_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_parent_shutdown(_: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_parent_restart(_: libc::c_int) {
    RESTART_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_worker_shutdown(sig: libc::c_int) {
    WORKER_STOP_SIGNAL.store(sig, Ordering::SeqCst);
    WORKER_STOP_REQUESTED.store(true, Ordering::SeqCst);
}

fn install(signal: Signal, handler: SigHandler) -> Result<(), SignalError> {
    let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: the installed handlers only store to atomics, which is
    // async-signal-safe.
    unsafe { signal::sigaction(signal, &action) }
        .map(|_| ())
        .map_err(|source| SignalError { signal, source })
}

/// The standard shutdown signals plus the configured one.
fn shutdown_set(configured: Signal) -> Vec<Signal> {
    let mut set = SHUTDOWN_SIGNALS.to_vec();
    if !set.contains(&configured) {
        set.push(configured);
    }
    set
}

/// Bind the supervisor's handlers: shutdown signals, optional restart signal,
/// and an explicit ignore for SIGCHLD.
pub fn install_parent_handlers(shutdown: Signal, restart: Option<Signal>) -> Result<(), SignalError> {
    for sig in shutdown_set(shutdown) {
        install(sig, SigHandler::Handler(on_parent_shutdown))?;
    }
    if let Some(sig) = restart {
        install(sig, SigHandler::Handler(on_parent_restart))?;
    }
    install(Signal::SIGCHLD, SigHandler::SigIgn)
}

/// Bind a worker child's handlers. Called right after fork, before the
/// worker's startup runs (which may override them).
///
/// A stop request already recorded by the parent's handler survives as a
/// worker stop request.
pub fn install_child_handlers(shutdown: Signal) -> Result<(), SignalError> {
    WORKER_STOP_REQUESTED.store(false, Ordering::SeqCst);
    WORKER_STOP_SIGNAL.store(0, Ordering::SeqCst);
    RESTART_REQUESTED.store(false, Ordering::SeqCst);
    for sig in shutdown_set(shutdown) {
        install(sig, SigHandler::Handler(on_worker_shutdown))?;
    }
    install(Signal::SIGCHLD, SigHandler::SigDfl)?;
    if STOP_REQUESTED.swap(false, Ordering::SeqCst) {
        WORKER_STOP_SIGNAL.store(shutdown as libc::c_int, Ordering::SeqCst);
        WORKER_STOP_REQUESTED.store(true, Ordering::SeqCst);
    }
    Ok(())
}

/// Block every blockable signal for the calling thread. Returns the previous
/// mask for [`restore_mask`].
pub(crate) fn block_all() -> nix::Result<SigSet> {
    SigSet::all().thread_swap_mask(SigmaskHow::SIG_BLOCK)
}

/// Reinstate a mask saved by [`block_all`]. Pending signals are delivered
/// to the handlers installed by then.
pub(crate) fn restore_mask(mask: &SigSet) {
    if let Err(e) = mask.thread_set_mask() {
        tracing::warn!("failed to restore signal mask: {e}");
    }
}

/// Ignore `signal` in the current process.
///
/// Meant for worker startup code that wants to outlive shutdown signals, e.g.
/// to exercise the force-kill path.
pub fn ignore(signal: Signal) -> Result<(), SignalError> {
    install(signal, SigHandler::SigIgn)
}

/// Whether a shutdown signal reached the supervisor. Never resets.
pub fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::SeqCst)
}

/// Consume a pending restart request.
pub fn take_restart_request() -> bool {
    RESTART_REQUESTED.swap(false, Ordering::SeqCst)
}

/// Whether a restart request is pending, without consuming it.
pub fn restart_pending() -> bool {
    RESTART_REQUESTED.load(Ordering::SeqCst)
}

/// Whether a shutdown signal reached this worker process.
pub fn worker_stop_requested() -> bool {
    WORKER_STOP_REQUESTED.load(Ordering::SeqCst)
}

/// The shutdown signal this worker process received, if any.
pub fn worker_stop_signal() -> Option<Signal> {
    match WORKER_STOP_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        raw => Signal::try_from(raw).ok(),
    }
}

/// Parse a signal name: `SIGTERM`, `TERM` and `term` are all accepted.
pub fn parse_signal(name: &str) -> Result<Signal, ConfigError> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full).map_err(|_| ConfigError::UnknownSignal(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_variants() {
        assert_eq!(parse_signal("SIGQUIT").unwrap(), Signal::SIGQUIT);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal(" usr1 ").unwrap(), Signal::SIGUSR1);
    }

    #[test]
    fn test_parse_signal_unknown() {
        let err = parse_signal("SIGNOPE").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSignal(ref s) if s == "SIGNOPE"));
    }

    #[test]
    fn test_shutdown_set_adds_configured_signal() {
        assert_eq!(shutdown_set(Signal::SIGQUIT).len(), 3);
        assert_eq!(shutdown_set(Signal::SIGUSR2).last(), Some(&Signal::SIGUSR2));
    }

    #[test]
    fn test_flags_start_cleared() {
        assert!(!worker_stop_requested());
        assert!(worker_stop_signal().is_none());
        assert!(!take_restart_request());
    }

    #[test]
    fn test_block_all_defers_delivery() {
        let saved = block_all().unwrap();
        let blocked = SigSet::thread_get_mask().unwrap();
        assert!(blocked.contains(Signal::SIGQUIT));
        assert!(blocked.contains(Signal::SIGUSR1));
        restore_mask(&saved);
        assert_eq!(SigSet::thread_get_mask().unwrap().contains(Signal::SIGQUIT), saved.contains(Signal::SIGQUIT));
    }
}
