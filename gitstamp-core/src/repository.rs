//! Subprocess-driven Git/GPG plumbing for the commit-loop state machine.
//! Per Design Notes §9 ("Subprocess-driven Git/GPG ... keep as external
//! subprocess invocations"), every mutation goes through `git`; reads of
//! `HEAD` use `git2` the way the teacher's `repository.rs` already does.

use std::path::Path;
use std::process::Stdio;

use git2::Repository;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};

/// Dump stdout/stderr of a finished command at `debug` level, matching
/// the teacher's `util.rs::dump_output`.
#[instrument(skip(output))]
pub async fn dump_output(command: &str, output: &std::process::Output) -> Result<()> {
    debug!(command);
    let mut lines = output.stdout.lines();
    while let Some(line) = lines.next_line().await? {
        debug!("{line}");
    }
    let mut lines = output.stderr.lines();
    while let Some(line) = lines.next_line().await? {
        debug!("{line}");
    }
    Ok(())
}

async fn run(repo: &Path, args: &[&str], env: &[(&str, &std::ffi::OsStr)]) -> Result<()> {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(repo).args(args);
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let output = cmd.spawn()?.wait_with_output().await?;
    dump_output(&format!("git {}", args.join(" ")), &output).await?;
    Error::assert_exit_status(output.status)?;
    Ok(())
}

/// `git init` + `git config user.name`/`user.email`, idempotent.
#[instrument]
pub async fn init_repository(repo: &Path, name: &str, email: &str) -> Result<()> {
    tokio::fs::create_dir_all(repo).await?;
    if !repo.join(".git").is_dir() {
        run(repo, &["init"], &[]).await?;
        run(repo, &["config", "user.name", name], &[]).await?;
        run(repo, &["config", "user.email", email], &[]).await?;
    }
    Ok(())
}

/// Commit `pubkey.asc` on first boot, if not already present.
#[instrument(skip(pubkey))]
pub async fn ensure_pubkey_committed(repo: &Path, pubkey: &str) -> Result<()> {
    let path = repo.join("pubkey.asc");
    if !path.is_file() {
        tokio::fs::write(&path, pubkey).await?;
        run(repo, &["add", "pubkey.asc"], &[]).await?;
        run(repo, &["commit", "-m", "Started timestamping"], &[]).await?;
    }
    Ok(())
}

#[instrument]
pub async fn git_add(repo: &Path, file: &Path) -> Result<()> {
    let rel = file.to_string_lossy();
    run(repo, &["add", &rel], &[]).await
}

/// `git commit --allow-empty --gpg-sign=<keyid> -m <message>`, with
/// `GNUPGHOME` set explicitly for this invocation only (never mutating the
/// process environment, per Design Notes §9).
#[instrument]
pub async fn git_commit_signed(
    repo: &Path,
    message: &str,
    keyid: &str,
    gnupg_home: &Path,
) -> Result<()> {
    let gpg_sign = format!("--gpg-sign={keyid}");
    run(
        repo,
        &["commit", "-m", message, "--allow-empty", &gpg_sign],
        &[("GNUPGHOME", gnupg_home.as_os_str())],
    )
    .await
}

/// `git push <remote> <branches...>`. Failures are logged and swallowed —
/// per §7, a failed push is a local subprocess failure that the next tick
/// retries.
#[instrument]
pub async fn push_upstream(repo: &Path, remote: &str, branches: &[String]) {
    let mut args: Vec<&str> = vec!["push", remote];
    args.extend(branches.iter().map(String::as_str));
    if let Err(e) = run(repo, &args, &[]).await {
        warn!(remote, ?branches, error = %e, "git push failed");
    }
}

/// `git timestamp --server <server> [--branch <branch>]`, optionally with
/// `ZEITGITTER_FAKE_TIME`-equivalent (`FAKE_TIME`) stripped from the
/// environment so peer cross-timestamps always use wall-clock time for
/// servers specified without a branch.
#[instrument]
pub async fn cross_timestamp(repo: &Path, server: &str, branch: Option<&str>, strip_fake_time: bool) {
    let mut args = vec!["timestamp".to_string(), "--server".to_string(), server.to_string()];
    if let Some(branch) = branch {
        args.push("--branch".to_string());
        args.push(branch.to_string());
    }
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(repo).args(&arg_refs);
    if strip_fake_time {
        cmd.env_remove("FAKE_TIME");
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    match cmd.spawn() {
        Ok(child) => match child.wait_with_output().await {
            Ok(output) => {
                let _ = dump_output(&format!("git {}", arg_refs.join(" ")), &output).await;
                if !output.status.success() {
                    warn!(server, ?branch, "git timestamp failed");
                }
            }
            Err(e) => warn!(server, error = %e, "git timestamp could not be awaited"),
        },
        Err(e) => warn!(server, error = %e, "git timestamp could not be spawned"),
    }
}

/// The current `HEAD` object id, or `None` in an unborn repository (no
/// commits yet).
#[instrument]
pub fn head_oid(repo: &Path) -> Result<Option<String>> {
    let repo = Repository::open(repo)?;
    match repo.head() {
        Ok(head) => Ok(head.target().map(|oid| oid.to_string())),
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => Ok(None),
        Err(e) => Err(e.into()),
    }
}
