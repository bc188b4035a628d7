//! Bounded-parallel signing over a round-robin pool of keystore replicas.
//! Grounded in `original_source/zeitgitter/stamper.py` (`Stamper.gpg`,
//! `Stamper.limited_sign`); the concurrency primitives follow the teacher's
//! habit of moving blocking work (`spawn_blocking` in
//! `repository.rs::clone_repository`) off the async runtime, swapping
//! Python's `threading.BoundedSemaphore`/`threading.Lock` for
//! `tokio::sync::{Semaphore, Mutex}`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};

#[derive(Debug)]
pub enum SignOutcome {
    Signed(String),
    Timeout,
}

#[derive(Debug)]
pub struct SignerPool {
    semaphore: Semaphore,
    timeout: Option<Duration>,
    replicas: Mutex<VecDeque<PathBuf>>,
    max_threads: AtomicUsize,
    original_home: PathBuf,
    pub keyid: String,
}

impl SignerPool {
    /// Starts single-threaded (`max_threads = 1`); call
    /// [`SignerPool::start_multi_threaded`] only once boot is complete, so
    /// replica creation never races the HTTP server starting.
    pub fn new(
        gnupg_home: impl Into<PathBuf>,
        keyid: impl Into<String>,
        max_parallel_signatures: usize,
        max_parallel_timeout: Option<Duration>,
    ) -> Self {
        let original_home = gnupg_home.into();
        let mut replicas = VecDeque::new();
        replicas.push_back(original_home.clone());
        SignerPool {
            semaphore: Semaphore::new(max_parallel_signatures),
            timeout: max_parallel_timeout,
            replicas: Mutex::new(replicas),
            max_threads: AtomicUsize::new(1),
            original_home,
            keyid: keyid.into(),
        }
    }

    pub fn start_multi_threaded(&self, number_of_gpg_agents: usize) {
        self.max_threads.store(number_of_gpg_agents, Ordering::SeqCst);
    }

    pub fn new_shared(
        gnupg_home: impl Into<PathBuf>,
        keyid: impl Into<String>,
        max_parallel_signatures: usize,
        max_parallel_timeout: Option<Duration>,
    ) -> Arc<SignerPool> {
        Arc::new(SignerPool::new(
            gnupg_home,
            keyid,
            max_parallel_signatures,
            max_parallel_timeout,
        ))
    }

    /// Return the next keystore replica in round-robin order, creating one
    /// (by copying the original, minus sockets/backups) if fewer than
    /// `max_threads` exist yet.
    #[instrument(skip(self))]
    async fn next_replica(&self) -> Result<PathBuf> {
        let mut replicas = self.replicas.lock().await;
        let max_threads = self.max_threads.load(Ordering::SeqCst);
        if replicas.len() < max_threads {
            let idx = replicas.len();
            let new_home = PathBuf::from(format!(
                "{}-{}",
                self.original_home.display(),
                idx
            ));
            info!(from = %self.original_home.display(), to = %new_home.display(), "creating GnuPG keystore replica");
            let original = self.original_home.clone();
            let target = new_home.clone();
            tokio::task::spawn_blocking(move || copy_keystore(&original, &target)).await??;
            replicas.push_back(new_home.clone());
            Ok(new_home)
        } else {
            let front = replicas.pop_front().expect("replica list is never empty");
            replicas.push_back(front.clone());
            debug!(replica = %front.display(), "reusing least-recently-used replica");
            Ok(front)
        }
    }

    /// Sign `payload`, forcing the agent's clock to exactly `now` so that
    /// identical inputs at identical `now` yield byte-identical signatures.
    /// Returns [`SignOutcome::Timeout`] if the pool is saturated for longer
    /// than `max_parallel_timeout`.
    #[instrument(skip(self, payload))]
    pub async fn sign(&self, payload: &[u8], now: i64) -> Result<SignOutcome> {
        let _permit = match self.timeout {
            Some(d) => match tokio::time::timeout(d, self.semaphore.acquire()).await {
                Ok(Ok(p)) => p,
                Ok(Err(_)) => unreachable!("semaphore is never closed"),
                Err(_) => return Ok(SignOutcome::Timeout),
            },
            None => self
                .semaphore
                .acquire()
                .await
                .expect("semaphore is never closed"),
        };

        let replica = self.next_replica().await?;
        let sig = detached_sign(&replica, &self.keyid, now, payload).await?;
        Ok(SignOutcome::Signed(sig))
    }
}

/// Invoke `gpg --detach-sign --armor` against a given keystore, forcing its
/// notion of "now" with `--faked-system-time <now>!`.
#[instrument(skip(payload))]
async fn detached_sign(gnupg_home: &Path, keyid: &str, now: i64, payload: &[u8]) -> Result<String> {
    let mut child = Command::new("gpg")
        .env("GNUPGHOME", gnupg_home)
        .arg("--batch")
        .arg("--yes")
        .arg("--local-user")
        .arg(keyid)
        .arg("--faked-system-time")
        .arg(format!("{now}!"))
        .arg("--detach-sign")
        .arg("--armor")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    child
        .stdin
        .take()
        .expect("stdin was piped")
        .write_all(payload)
        .await?;

    let mut stdout = String::new();
    child
        .stdout
        .take()
        .expect("stdout was piped")
        .read_to_string(&mut stdout)
        .await?;

    let status = child.wait().await?;
    Error::assert_exit_status(status)?;

    Ok(stdout)
}

/// Recursively copy a keystore directory, skipping GnuPG agent sockets
/// (`S.*`) and editor/backup files (`*~`) — the same exclusion patterns
/// `shutil.copytree(..., ignore=shutil.ignore_patterns("S.*", "*~"))` uses.
fn copy_keystore(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if name.starts_with("S.") || name.ends_with('~') {
            continue;
        }
        let src = entry.path();
        let dst = to.join(&file_name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_keystore(&src, &dst)?;
        } else if file_type.is_file() {
            std::fs::copy(&src, &dst)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn copy_keystore_skips_sockets_and_backups() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("pubring.kbx"), b"keys").unwrap();
        std::fs::write(src.path().join("S.gpg-agent"), b"socket").unwrap();
        std::fs::write(src.path().join("secring.gpg~"), b"backup").unwrap();

        let dst = tempdir().unwrap();
        let target = dst.path().join("replica-1");
        copy_keystore(src.path(), &target).unwrap();

        assert!(target.join("pubring.kbx").exists());
        assert!(!target.join("S.gpg-agent").exists());
        assert!(!target.join("secring.gpg~").exists());
    }
}
