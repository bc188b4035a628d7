//! Boot glue: parse configuration, resolve the signing key, bootstrap the
//! repository, start the commit loop and HTTP front end. The overall shape
//! (`setup_registry`, then build `Router`, then `axum::Server::bind`)
//! follows the teacher's `main.rs`.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

use gitstamp_core::{CommitLoop, Config, EvidenceLog, MailWorker, SignerPool, Stamper};

mod cli;
mod error;
mod http;

fn setup_registry(debug_level: &str) {
    let envfilter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(debug_level);
    tracing_subscriber::registry()
        .with(envfilter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = cli::Args::parse();
    setup_registry(&args.debug_level);
    let bind_address = args.bind_address();
    let config = Arc::new(args.into_config()?);
    info!(?config, "starting with the following configuration");

    let keyinfo =
        gitstamp_core::resolve_or_create_key(&config.gnupg_home, config.keyid.as_deref(), &config.domain)
            .await?;
    let pubkey = gitstamp_core::export_public_key(&config.gnupg_home, &keyinfo.keyid).await?;

    let (name, email) = gitstamp_core::parse_name_email(&keyinfo.uid).unwrap_or_else(|| {
        warn!(uid = %keyinfo.uid, "identity uid did not parse as 'Name <email>'");
        (keyinfo.uid.clone(), String::new())
    });
    gitstamp_core::repository::init_repository(&config.repository, &name, &email).await?;
    gitstamp_core::repository::ensure_pubkey_committed(&config.repository, &pubkey).await?;

    let evidence = Arc::new(EvidenceLog::new(
        config.working_log_path(),
        config.rotated_log_path(),
        config.preserved_log_path(),
    ));

    let signer = SignerPool::new_shared(
        config.gnupg_home.clone(),
        keyinfo.keyid.clone(),
        config.max_parallel_signatures,
        config.max_parallel_timeout,
    );

    let stamper = Arc::new(Stamper::new(
        evidence.clone(),
        signer.clone(),
        config.own_url.clone(),
        keyinfo.uid.clone(),
        pubkey,
    ));

    let mail = Arc::new(MailWorker::new(&config));
    if config.mail_marker_path().exists() {
        info!("possibly resuming cross-timestamping by mail");
        if let Err(e) = mail.resume_if_marker_exists().await {
            warn!(error = %e, "failed to resume email cross-timestamp");
        }
    }

    let commit_loop = Arc::new(CommitLoop::new(
        config.clone(),
        evidence,
        mail,
        keyinfo.keyid.clone(),
    ));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let commit_handle = tokio::spawn(commit_loop.run(shutdown_rx));

    // Only now that boot is complete do we let the signer spawn additional
    // keystore replicas, so replica creation never races repository setup.
    signer.start_multi_threaded(config.number_of_gpg_agents);

    let app = http::router(stamper);

    info!("Listening on http://{}", bind_address);

    let server = match socket_activation_listener()? {
        Some(listener) => axum::Server::from_tcp(listener)?,
        None => axum::Server::bind(&bind_address),
    };

    server
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install ctrl_c handler");
            info!("received interrupt, waiting for the in-flight commit tick to finish");
            shutdown_tx.send(true).ok();
        })
        .await?;

    commit_handle.await?;
    info!("graceful shutdown complete");
    Ok(())
}

/// Adopt fd 3 as a `TcpListener` if systemd declared exactly one passed
/// socket (`LISTEN_PID` matches our pid, `LISTEN_FDS == 1`), per §4.6.
fn socket_activation_listener() -> Result<Option<std::net::TcpListener>, Box<dyn std::error::Error>> {
    let pid_matches = std::env::var("LISTEN_PID")
        .map(|v| v == std::process::id().to_string())
        .unwrap_or(false);
    if !pid_matches {
        return Ok(None);
    }
    let nfds: u32 = std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if nfds != 1 {
        return Err("socket activation must provide exactly one socket".into());
    }
    use std::os::unix::io::FromRawFd;
    let listener = unsafe { std::net::TcpListener::from_raw_fd(3) };
    listener.set_nonblocking(true)?;
    Ok(Some(listener))
}
