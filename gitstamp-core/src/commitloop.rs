//! The periodic commit-loop state machine: waits for the next scheduled
//! tick, commits any client data accumulated since the last tick, cross-
//! timestamps with configured peers, pushes upstream, and (if configured)
//! kicks off an email cross-timestamp round trip. Grounded in
//! `original_source/zeitgitter/commit.py`.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::Result;
use crate::evidence::EvidenceLog;
use crate::mail::MailWorker;
use crate::time::iso_utc_from_system_time;

pub struct CommitLoop {
    config: Arc<Config>,
    evidence: Arc<EvidenceLog>,
    mail: Arc<MailWorker>,
    keyid: String,
    /// Chosen once at startup when `commit_offset` is not configured,
    /// matching the "one-time random pick" requirement (§4.4).
    offset: Duration,
}

impl CommitLoop {
    pub fn new(
        config: Arc<Config>,
        evidence: Arc<EvidenceLog>,
        mail: Arc<MailWorker>,
        keyid: String,
    ) -> Self {
        let offset = config.commit_offset.unwrap_or_else(|| {
            let interval = config.commit_interval.as_secs_f64();
            let mut rng = rand::thread_rng();
            Duration::from_secs_f64(rng.gen_range(0.05 * interval..0.95 * interval))
        });
        CommitLoop {
            config,
            evidence,
            mail,
            keyid,
            offset,
        }
    }

    /// Runs until `shutdown` is signalled. Each tick is awaited in place
    /// (rather than detached) and never raced against `shutdown` itself —
    /// cancellation is only checked between ticks, at the sleep boundary,
    /// so a caller performing graceful shutdown is guaranteed no tick is
    /// ever left half finished (§4.4/§5).
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let wait = self.duration_until_next_tick();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    info!("commit loop shutting down before its next tick");
                    return;
                }
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "commit tick failed");
            }
            if *shutdown.borrow() {
                info!("commit loop shutting down after finishing its in-flight tick");
                return;
            }
        }
    }

    fn duration_until_next_tick(&self) -> Duration {
        let interval = self.config.commit_interval.as_secs_f64();
        let offset = self.offset.as_secs_f64();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let mut until = now - (now % interval) + offset;
        if until <= now {
            until += interval;
        }
        Duration::from_secs_f64((until - now).max(0.0))
    }

    #[instrument(skip(self))]
    async fn tick(&self) -> Result<()> {
        let rotated_stat = {
            let _guard = self.evidence.lock().await;

            if let Some(mtime) = self.evidence.dangling_locked()? {
                info!(mtime = %iso_utc_from_system_time(mtime), "committing dangling data from a previous crash");
                self.commit_path(
                    self.evidence.rotated_path(),
                    &format!(
                        "Found uncommitted data from {}",
                        iso_utc_from_system_time(mtime)
                    ),
                )
                .await?;
                std::fs::remove_file(self.evidence.rotated_path()).ok();
            }

            let stat = self.evidence.rotate_locked()?;
            if let Some(mtime) = stat {
                self.commit_path(
                    self.evidence.rotated_path(),
                    &format!(
                        "Newly timestamped commits up to {}",
                        iso_utc_from_system_time(mtime)
                    ),
                )
                .await?;
                self.evidence.preserve_locked()?;
                self.evidence.recreate_working_locked()?;
            }

            stat
        };

        for entry in &self.config.upstream_timestamp {
            match entry.split_once('=') {
                Some((branch, server)) => {
                    crate::repository::cross_timestamp(
                        &self.config.repository,
                        server,
                        Some(branch),
                        false,
                    )
                    .await;
                }
                None => {
                    crate::repository::cross_timestamp(&self.config.repository, entry, None, true)
                        .await;
                }
            }
            if !self.config.upstream_sleep.is_zero() {
                tokio::time::sleep(self.config.upstream_sleep).await;
            }
        }

        for remote in &self.config.push_repository {
            crate::repository::push_upstream(
                &self.config.repository,
                remote,
                &self.config.push_branch,
            )
            .await;
        }

        if rotated_stat.is_some() && self.mail.is_enabled() {
            if let Err(e) = self.mail.maybe_start().await {
                warn!(error = %e, "failed to start email cross-timestamp");
            }
        }

        Ok(())
    }

    async fn commit_path(&self, path: &std::path::Path, message: &str) -> Result<()> {
        crate::repository::git_add(&self.config.repository, path).await?;
        crate::repository::git_commit_signed(
            &self.config.repository,
            message,
            &self.keyid,
            &self.config.gnupg_home,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;

    fn config_with_interval(secs: u64) -> Config {
        Config {
            commit_interval: Duration::from_secs(secs),
            ..Config::default()
        }
    }

    #[test]
    fn offset_is_chosen_within_the_five_to_ninety_five_percent_band() {
        let config = Arc::new(config_with_interval(3600));
        let evidence = Arc::new(EvidenceLog::new(
            "/tmp/does-not-matter-work".into(),
            "/tmp/does-not-matter-log".into(),
            "/tmp/does-not-matter-stamp".into(),
        ));
        let mail = Arc::new(MailWorker::new(&Config::default()));
        let loop_ = CommitLoop::new(config, evidence, mail, "DEADBEEF".to_string());
        let secs = loop_.offset.as_secs_f64();
        assert!(secs >= 0.05 * 3600.0 && secs < 0.95 * 3600.0);
    }

    #[test]
    fn explicit_offset_is_honored_verbatim() {
        let mut config = config_with_interval(3600);
        config.commit_offset = Some(Duration::from_secs(120));
        let config = Arc::new(config);
        let evidence = Arc::new(EvidenceLog::new(
            "/tmp/does-not-matter-work2".into(),
            "/tmp/does-not-matter-log2".into(),
            "/tmp/does-not-matter-stamp2".into(),
        ));
        let mail = Arc::new(MailWorker::new(&Config::default()));
        let loop_ = CommitLoop::new(config, evidence, mail, "DEADBEEF".to_string());
        assert_eq!(loop_.offset, Duration::from_secs(120));
    }
}
