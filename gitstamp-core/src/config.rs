use std::path::PathBuf;
use std::time::Duration;

/// Immutable configuration shared (via `Arc`) by every component. Built once at
/// startup from CLI/env input in `gitstampd::cli`; never mutated afterwards and
/// never stored as a global/static, per the "replace global mutable
/// configuration" design note.
#[derive(Debug, Clone)]
pub struct Config {
    // Identity
    pub own_url: String,
    pub domain: String,

    // GnuPG / signer pool
    pub gnupg_home: PathBuf,
    pub keyid: Option<String>,
    pub max_parallel_signatures: usize,
    pub max_parallel_timeout: Option<Duration>,
    pub number_of_gpg_agents: usize,

    // Repository / commit loop
    pub repository: PathBuf,
    pub commit_interval: Duration,
    pub commit_offset: Option<Duration>,
    pub upstream_timestamp: Vec<String>,
    pub upstream_sleep: Duration,
    pub push_repository: Vec<String>,
    pub push_branch: Vec<String>,

    // PGP Digital Timestamper (email cross-timestamp)
    pub stamper_own_address: Option<String>,
    pub stamper_keyid: String,
    pub stamper_to: String,
    pub stamper_from: String,
    pub stamper_smtp_server: Option<String>,
    pub stamper_imap_server: Option<String>,
    pub stamper_username: Option<String>,
    pub stamper_password: Option<String>,

    // Evidence log file names, relative to `repository`
    pub working_log_name: String,
    pub rotated_log_name: String,
    pub preserved_log_name: String,
    pub mail_marker_name: String,
    pub mail_signature_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            own_url: String::new(),
            domain: String::new(),
            gnupg_home: PathBuf::from(".gnupg"),
            keyid: None,
            max_parallel_signatures: 2,
            max_parallel_timeout: None,
            number_of_gpg_agents: 1,
            repository: PathBuf::from("repo"),
            commit_interval: Duration::from_secs(3600),
            commit_offset: None,
            upstream_timestamp: Vec::new(),
            upstream_sleep: Duration::from_secs(0),
            push_repository: Vec::new(),
            push_branch: vec!["--all".to_string()],
            stamper_own_address: None,
            stamper_keyid: "70B61F81".to_string(),
            stamper_to: "clear@stamper.itconsult.co.uk".to_string(),
            stamper_from: "mailer@stamper.itconsult.co.uk".to_string(),
            stamper_smtp_server: None,
            stamper_imap_server: None,
            stamper_username: None,
            stamper_password: None,
            working_log_name: "hashes.work".to_string(),
            rotated_log_name: "hashes.log".to_string(),
            preserved_log_name: "hashes.stamp".to_string(),
            mail_marker_name: "pgp-timestamp.tmp".to_string(),
            mail_signature_name: "pgp-timestamp.sig".to_string(),
        }
    }
}

impl Config {
    pub fn working_log_path(&self) -> PathBuf {
        self.repository.join(&self.working_log_name)
    }

    pub fn rotated_log_path(&self) -> PathBuf {
        self.repository.join(&self.rotated_log_name)
    }

    pub fn preserved_log_path(&self) -> PathBuf {
        self.repository.join(&self.preserved_log_name)
    }

    pub fn mail_marker_path(&self) -> PathBuf {
        self.repository.join(&self.mail_marker_name)
    }

    pub fn mail_signature_path(&self) -> PathBuf {
        self.repository.join(&self.mail_signature_name)
    }
}
