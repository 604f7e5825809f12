//! Name-keyed set of workers and the processes currently running them.
//!
//! Iteration follows registration order. Handles of a worker that is
//! unregistered while its processes are still alive move to the orphan list;
//! the supervisor keeps reaping them and terminates them on shutdown.

use indexmap::IndexMap;

use crate::error::ConfigError;
use crate::fork::ProcessHandle;

use super::Worker;

pub(crate) struct Entry {
    pub(crate) worker: Worker,
    pub(crate) handles: Vec<ProcessHandle>,
}

#[derive(Default)]
pub struct WorkerRegistry {
    entries: IndexMap<String, Entry>,
    orphans: Vec<ProcessHandle>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker. Names are unique.
    pub fn register(&mut self, worker: Worker) -> Result<(), ConfigError> {
        if self.entries.contains_key(worker.name()) {
            return Err(ConfigError::DuplicateName(worker.name().to_string()));
        }
        self.entries.insert(
            worker.name().to_string(),
            Entry {
                worker,
                handles: Vec::new(),
            },
        );
        Ok(())
    }

    /// Remove a worker. Its running processes become orphans.
    pub fn unregister(&mut self, name: &str) -> Option<Worker> {
        let entry = self.entries.shift_remove(name)?;
        self.orphans.extend(entry.handles);
        Some(entry.worker)
    }

    /// Remove every worker, orphaning all their processes.
    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain(..) {
            self.orphans.extend(entry.handles);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Worker> {
        self.entries.get(name).map(|e| &e.worker)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Worker> {
        self.entries.get_mut(name).map(|e| &mut e.worker)
    }

    /// Workers in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.entries.values().map(|e| &e.worker)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Tracked processes of one worker, oldest first. Empty for unknown names.
    pub fn handles(&self, name: &str) -> &[ProcessHandle] {
        self.entries.get(name).map_or(&[][..], |e| e.handles.as_slice())
    }

    /// Processes left behind by unregistered workers.
    pub fn orphans(&self) -> &[ProcessHandle] {
        &self.orphans
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut Entry> {
        self.entries.values_mut()
    }

    pub(crate) fn entry_mut(&mut self, name: &str) -> Option<&mut Entry> {
        self.entries.get_mut(name)
    }

    pub(crate) fn orphans_mut(&mut self) -> &mut Vec<ProcessHandle> {
        &mut self.orphans
    }

    /// Forget every tracked handle. Used after a full shutdown.
    pub(crate) fn forget_handles(&mut self) {
        for entry in self.entries.values_mut() {
            entry.handles.clear();
        }
        self.orphans.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::CallableJob;
    use nix::unistd::Pid;

    fn worker(name: &str) -> Worker {
        Worker::new(name, CallableJob::new(|_| Ok(())))
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = WorkerRegistry::new();
        registry.register(worker("a")).unwrap();
        let err = registry.register(worker("a")).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName(ref n) if n == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_iteration_follows_registration_order() {
        let mut registry = WorkerRegistry::new();
        for name in ["c", "a", "b"] {
            registry.register(worker(name)).unwrap();
        }
        assert_eq!(registry.names(), ["c", "a", "b"]);
        registry.unregister("a");
        let names: Vec<_> = registry.iter().map(Worker::name).collect();
        assert_eq!(names, ["c", "b"]);
    }

    #[test]
    fn test_unregister_orphans_handles() {
        let mut registry = WorkerRegistry::new();
        registry.register(worker("a")).unwrap();
        registry
            .entry_mut("a")
            .unwrap()
            .handles
            .push(ProcessHandle::new(Pid::from_raw(4242), "a"));

        assert!(registry.unregister("a").is_some());
        assert!(registry.unregister("a").is_none());
        assert!(registry.handles("a").is_empty());
        assert_eq!(registry.orphans().len(), 1);
    }

    #[test]
    fn test_clear_keeps_processes_reachable() {
        let mut registry = WorkerRegistry::new();
        registry.register(worker("a")).unwrap();
        registry.register(worker("b")).unwrap();
        registry
            .entry_mut("b")
            .unwrap()
            .handles
            .push(ProcessHandle::new(Pid::from_raw(7), "b"));
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.orphans()[0].worker(), "b");
        registry.forget_handles();
        assert!(registry.orphans().is_empty());
    }
}
