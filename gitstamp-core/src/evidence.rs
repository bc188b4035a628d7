//! The append-only evidence log and the "commit serialize" mutex that
//! guards it, rotation, and the Git commit that follows. Grounded in
//! `original_source/zeitgitter/stamper.py::log_commit` and
//! `original_source/zeitgitter/commit.py` (the `serialize` lock).

use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::sync::{Mutex, MutexGuard};
use tracing::instrument;

use crate::error::Result;

/// Append-only client-commit log plus the single mutex that serializes
/// every append, rotation, and commit against one another (§5: "a single
/// repository-level mutex ... held only for local filesystem + git
/// subprocesses; never across network I/O").
#[derive(Debug)]
pub struct EvidenceLog {
    serialize: Mutex<()>,
    working: PathBuf,
    rotated: PathBuf,
    preserved: PathBuf,
}

impl EvidenceLog {
    pub fn new(working: PathBuf, rotated: PathBuf, preserved: PathBuf) -> Self {
        EvidenceLog {
            serialize: Mutex::new(()),
            working,
            rotated,
            preserved,
        }
    }

    pub fn working_path(&self) -> &Path {
        &self.working
    }

    pub fn rotated_path(&self) -> &Path {
        &self.rotated
    }

    pub fn preserved_path(&self) -> &Path {
        &self.preserved
    }

    /// Acquire the serialize mutex for a multi-step operation (rotation +
    /// commit in the commit loop). Appends made through [`EvidenceLog::append`]
    /// take the same mutex, so they cannot interleave with a rotation.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.serialize.lock().await
    }

    /// Append `commit\n` to the working log and fsync before returning, per
    /// the append-before-sign invariant (§3, testable property 2).
    #[instrument(skip(self))]
    pub async fn append(&self, commit: &str) -> Result<()> {
        let _guard = self.serialize.lock().await;
        self.append_locked(commit)
    }

    /// Same as [`EvidenceLog::append`], but assumes the caller already
    /// holds the serialize mutex (used by the commit loop's dangling-data
    /// check, which runs under its own, already-held guard).
    pub fn append_locked(&self, commit: &str) -> Result<()> {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.working)?;
        f.write_all(format!("{commit}\n").as_bytes())?;
        f.sync_all()?;
        Ok(())
    }

    /// Rename the working log to the rotated name, returning its mtime
    /// (the evidence window's upper bound) if the working log existed.
    pub fn rotate_locked(&self) -> Result<Option<std::time::SystemTime>> {
        match std::fs::metadata(&self.working) {
            Ok(meta) => {
                std::fs::rename(&self.working, &self.rotated)?;
                Ok(Some(meta.modified()?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Rename the rotated log to the preserved name, for later email
    /// cross-timestamp binding.
    pub fn preserve_locked(&self) -> Result<()> {
        std::fs::rename(&self.rotated, &self.preserved)?;
        Ok(())
    }

    /// Recreate an empty working log after rotation.
    pub fn recreate_working_locked(&self) -> Result<()> {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.working)?;
        Ok(())
    }

    /// A rotated log left over from a crashed tick, if present, with its
    /// mtime.
    pub fn dangling_locked(&self) -> Result<Option<std::time::SystemTime>> {
        match std::fs::metadata(&self.rotated) {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn log_at(dir: &Path) -> EvidenceLog {
        EvidenceLog::new(
            dir.join("hashes.work"),
            dir.join("hashes.log"),
            dir.join("hashes.stamp"),
        )
    }

    #[tokio::test]
    async fn append_creates_and_fsyncs_working_log() {
        let dir = tempdir().unwrap();
        let log = log_at(dir.path());
        log.append(&"1".repeat(40)).await.unwrap();
        log.append(&"2".repeat(40)).await.unwrap();
        let contents = std::fs::read_to_string(log.working_path()).unwrap();
        assert_eq!(contents, format!("{}\n{}\n", "1".repeat(40), "2".repeat(40)));
    }

    #[tokio::test]
    async fn rotate_then_preserve_round_trips_bytes() {
        let dir = tempdir().unwrap();
        let log = log_at(dir.path());
        log.append(&"3".repeat(40)).await.unwrap();

        let _guard = log.lock().await;
        let mtime = log.rotate_locked().unwrap();
        assert!(mtime.is_some());
        assert!(!log.working_path().exists());
        assert!(log.rotated_path().exists());

        log.preserve_locked().unwrap();
        assert!(!log.rotated_path().exists());
        let preserved = std::fs::read_to_string(log.preserved_path()).unwrap();
        assert_eq!(preserved, format!("{}\n", "3".repeat(40)));

        log.recreate_working_locked().unwrap();
        let working = std::fs::read_to_string(log.working_path()).unwrap();
        assert_eq!(working, "");
    }

    #[tokio::test]
    async fn rotate_with_no_working_log_is_a_noop() {
        let dir = tempdir().unwrap();
        let log = log_at(dir.path());
        let _guard = log.lock().await;
        assert!(log.rotate_locked().unwrap().is_none());
    }
}
