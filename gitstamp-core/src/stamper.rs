//! Turns a validated client request into a signed Git tag or commit object
//! text. Grounded in `original_source/zeitgitter/stamper.py`
//! (`stamp_tag`/`stamp_branch`); see §4.3/§8 scenarios S1-S3 for the exact
//! wire format expected.

use std::sync::Arc;

use tracing::instrument;

use crate::error::Result;
use crate::evidence::EvidenceLog;
use crate::signer::{SignOutcome, SignerPool};
use crate::time::{iso_utc, sig_time};
use crate::validate::{valid_commit, valid_tag};

#[derive(Debug)]
pub enum StampResult {
    Ok(String),
    Invalid,
    Timeout,
}

pub struct Stamper {
    pub evidence: Arc<EvidenceLog>,
    pub signer: Arc<SignerPool>,
    pub own_url: String,
    pub full_identity: String,
    pub pubkey: String,
}

impl Stamper {
    pub fn new(
        evidence: Arc<EvidenceLog>,
        signer: Arc<SignerPool>,
        own_url: impl Into<String>,
        full_identity: impl Into<String>,
        pubkey: impl Into<String>,
    ) -> Self {
        Stamper {
            evidence,
            signer,
            own_url: own_url.into(),
            full_identity: full_identity.into(),
            pubkey: pubkey.into(),
        }
    }

    pub fn public_key(&self) -> &str {
        &self.pubkey
    }

    #[instrument(skip(self))]
    pub async fn stamp_tag(&self, commit: &str, tagname: &str) -> Result<StampResult> {
        if !valid_commit(commit) || !valid_tag(tagname) {
            return Ok(StampResult::Invalid);
        }

        let now = {
            let _guard = self.evidence.lock().await;
            let now = sig_time();
            self.evidence.append_locked(commit)?;
            now
        };

        let tag_object = format!(
            "object {commit}\ntype commit\ntag {tagname}\ntagger {id} {now} +0000\n\n:watch: {url} tag timestamp\n",
            commit = commit,
            tagname = tagname,
            id = self.full_identity,
            now = now,
            url = self.own_url,
        );

        match self.signer.sign(tag_object.as_bytes(), now).await? {
            SignOutcome::Timeout => Ok(StampResult::Timeout),
            SignOutcome::Signed(sig) => Ok(StampResult::Ok(tag_object + &sig)),
        }
    }

    #[instrument(skip(self))]
    pub async fn stamp_branch(
        &self,
        commit: &str,
        parent: Option<&str>,
        tree: &str,
    ) -> Result<StampResult> {
        let parent_ok = parent.map(valid_commit).unwrap_or(true);
        if !valid_commit(commit) || !valid_commit(tree) || !parent_ok {
            return Ok(StampResult::Invalid);
        }

        let now = {
            let _guard = self.evidence.lock().await;
            let now = sig_time();
            self.evidence.append_locked(commit)?;
            now
        };

        let header = match parent {
            None => format!(
                "tree {tree}\nparent {commit}\nauthor {id} {now} +0000\ncommitter {id} {now} +0000\n",
                tree = tree,
                commit = commit,
                id = self.full_identity,
                now = now,
            ),
            Some(parent) => format!(
                "tree {tree}\nparent {parent}\nparent {commit}\nauthor {id} {now} +0000\ncommitter {id} {now} +0000\n",
                tree = tree,
                parent = parent,
                commit = commit,
                id = self.full_identity,
                now = now,
            ),
        };

        let trailer = format!(
            "\n:watch: {url} branch timestamp {iso}\n",
            url = self.own_url,
            iso = iso_utc(now),
        );

        let to_sign = format!("{header}{trailer}");

        match self.signer.sign(to_sign.as_bytes(), now).await? {
            SignOutcome::Timeout => Ok(StampResult::Timeout),
            SignOutcome::Signed(sig) => {
                // Indent every continuation line with a single space and drop the
                // signature's final newline, per §4.3.
                let indented = sig.replace('\n', "\n ");
                let indented = indented
                    .strip_suffix(' ')
                    .map(str::to_string)
                    .unwrap_or(indented);
                let gpgsig = format!("gpgsig {indented}");
                Ok(StampResult::Ok(format!("{header}{gpgsig}{trailer}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn evidence_log(dir: &std::path::Path) -> Arc<EvidenceLog> {
        Arc::new(EvidenceLog::new(
            dir.join("hashes.work"),
            dir.join("hashes.log"),
            dir.join("hashes.stamp"),
        ))
    }

    #[tokio::test]
    async fn invalid_commit_never_reaches_the_signer() {
        let dir = tempdir().unwrap();
        let evidence = evidence_log(dir.path());
        // A signer pool with zero permits would deadlock if ever invoked:
        // the test relies on this to prove rejection happens before signing.
        let signer = Arc::new(SignerPool::new(dir.path().join("gnupg"), "DEADBEEF", 0, None));
        let stamper = Stamper::new(evidence, signer, "https://example.test", "Id <id@example.test>", "");

        let result = stamper.stamp_tag(&"0".repeat(39), "tag").await.unwrap();
        assert!(matches!(result, StampResult::Invalid));
        assert!(!dir.path().join("hashes.work").exists());
    }

    #[tokio::test]
    async fn stamp_branch_rejects_mismatched_lengths() {
        let dir = tempdir().unwrap();
        let evidence = evidence_log(dir.path());
        let signer = Arc::new(SignerPool::new(dir.path().join("gnupg"), "DEADBEEF", 0, None));
        let stamper = Stamper::new(evidence, signer, "https://example.test", "Id <id@example.test>", "");

        let result = stamper
            .stamp_branch(&"1".repeat(40), Some(&"2".repeat(41)), &"3".repeat(40))
            .await
            .unwrap();
        assert!(matches!(result, StampResult::Invalid));
    }
}
