//! Plain-text pid file holding one decimal pid.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored pid. Absent, empty and unparseable files all read as `None`.
    pub fn read(&self) -> Option<Pid> {
        let content = fs::read_to_string(&self.path).ok()?;
        let raw: i32 = content.trim().parse().ok()?;
        (raw > 0).then_some(Pid::from_raw(raw))
    }

    pub fn write(&self, pid: Pid) -> io::Result<()> {
        fs::write(&self.path, format!("{pid}\n"))
    }

    /// Remove the file. A missing file is not an error.
    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Check the file can be created or overwritten, without truncating it.
    ///
    /// If the file had to be created, the returned [`Claim`] deletes it again
    /// when dropped, unless [`Claim::keep`] is called first.
    pub fn claim(&self) -> io::Result<Claim<'_>> {
        let created = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                OpenOptions::new().append(true).open(&self.path)?;
                false
            }
            Err(e) => return Err(e),
        };
        Ok(Claim { pidfile: self, created })
    }
}

/// A pid file checked by [`PidFile::claim`], pending a successful start.
#[must_use = "dropping a claim removes a pid file it created"]
#[derive(Debug)]
pub struct Claim<'a> {
    pidfile: &'a PidFile,
    created: bool,
}

impl Claim<'_> {
    /// The start went through; leave the file alone.
    pub fn keep(mut self) {
        self.created = false;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.created {
            if let Err(e) = self.pidfile.remove() {
                tracing::warn!("failed to remove {}: {e}", self.pidfile.path().display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("w.pid"));
        assert_eq!(pidfile.read(), None);
        pidfile.write(Pid::from_raw(4321)).unwrap();
        assert_eq!(pidfile.read(), Some(Pid::from_raw(4321)));
        assert_eq!(fs::read_to_string(pidfile.path()).unwrap(), "4321\n");
    }

    #[test]
    fn test_garbage_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("w.pid"));
        for content in ["", "  \n", "abc", "-5", "0"] {
            fs::write(pidfile.path(), content).unwrap();
            assert_eq!(pidfile.read(), None, "content {content:?}");
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("w.pid"));
        pidfile.write(Pid::from_raw(1)).unwrap();
        pidfile.remove().unwrap();
        pidfile.remove().unwrap();
        assert!(!pidfile.path().exists());
    }

    #[test]
    fn test_claim_checks_writability() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PidFile::new(dir.path().join("missing/dir/w.pid")).claim().is_err());
    }

    #[test]
    fn test_abandoned_claim_removes_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("w.pid"));
        let claim = pidfile.claim().unwrap();
        assert!(pidfile.path().exists());
        drop(claim);
        assert!(!pidfile.path().exists());
    }

    #[test]
    fn test_kept_claim_leaves_file() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("w.pid"));
        pidfile.claim().unwrap().keep();
        assert!(pidfile.path().exists());
    }

    #[test]
    fn test_abandoned_claim_spares_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("w.pid"));
        pidfile.write(Pid::from_raw(77)).unwrap();
        drop(pidfile.claim().unwrap());
        assert_eq!(pidfile.read(), Some(Pid::from_raw(77)));
    }
}
