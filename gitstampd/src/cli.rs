//! Command-line/environment configuration surface. Field names and
//! defaults are taken from `original_source/zeitgitter/config.py`; the
//! `clap` derive style (`#[clap(long, env, value_parser)]`) follows the
//! teacher's `cli.rs`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use gitstamp_core::Config;

/// The Independent Git Timestamping server.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Amount of debug output: warn, info, or debug.
    #[clap(long, env, default_value = "info")]
    pub debug_level: String,

    /// The PGP key ID to timestamp with, creating this key first if necessary.
    #[clap(long, env)]
    pub keyid: Option<String>,

    /// The URL of this service.
    #[clap(long, env)]
    pub own_url: String,

    /// The domain name, for the SMTP greeting. Defaults to the host part of --own-url.
    #[clap(long, env)]
    pub domain: Option<String>,

    /// IP address to listen on.
    #[clap(long, env, default_value = "127.0.0.1")]
    pub listen_address: IpAddr,

    /// Port number to listen on.
    #[clap(long, env, default_value = "15177")]
    pub listen_port: u16,

    /// Maximum number of parallel timestamping operations.
    #[clap(long, env, default_value = "2")]
    pub max_parallel_signatures: usize,

    /// Seconds to wait for a timestamping thread before failing (default: wait forever).
    #[clap(long, env, value_parser = parse_duration)]
    pub max_parallel_timeout: Option<Duration>,

    /// Number of gpg-agents to run.
    #[clap(long, env, default_value = "1")]
    pub number_of_gpg_agents: usize,

    /// GnuPG home dir to use (default: $GNUPGHOME, or $HOME/.gnupg).
    #[clap(long, env)]
    pub gnupg_home: Option<PathBuf>,

    /// How often to commit.
    #[clap(long, env, default_value = "1h", value_parser = parse_duration)]
    pub commit_interval: Duration,

    /// When to commit within that interval, e.g. `37m19.3s`. Default: a random
    /// choice made once at startup.
    #[clap(long, env, value_parser = parse_duration)]
    pub commit_offset: Option<Duration>,

    /// Path to the Git repository (default: $HOME/repo).
    #[clap(long, env)]
    pub repository: Option<PathBuf>,

    /// Space-separated upstream Zeitgitter servers of the form `[<branch>=]<server>`.
    #[clap(long, env, default_value = "")]
    pub upstream_timestamp: String,

    /// Delay between cross-timestamping for different upstream servers.
    #[clap(long, env, default_value = "0s", value_parser = parse_duration)]
    pub upstream_sleep: Duration,

    /// Space-separated list of repositories to push to; setting this enables automatic push.
    #[clap(long, env, default_value = "")]
    pub push_repository: String,

    /// Space-separated list of branches to push. `*` means all.
    #[clap(long, env, default_value = "*")]
    pub push_branch: String,

    /// Our email address; enables cross-timestamping from the PGP timestamper.
    /// (also known as `--mail-address`/`--email-address` upstream)
    #[clap(long, env)]
    pub stamper_own_address: Option<String>,

    /// PGP key ID to obtain email cross-timestamps from.
    #[clap(long, env, default_value = "70B61F81")]
    pub stamper_keyid: String,

    /// Destination email address to obtain email cross-timestamps from.
    #[clap(long, env, default_value = "clear@stamper.itconsult.co.uk")]
    pub stamper_to: String,

    /// Email address used by the PGP timestamper in its replies.
    #[clap(long, env, default_value = "mailer@stamper.itconsult.co.uk")]
    pub stamper_from: String,

    /// SMTP server to use for sending mail to the PGP timestamper.
    #[clap(long, env)]
    pub stamper_smtp_server: Option<String>,

    /// IMAP server to use for receiving mail from the PGP timestamper.
    #[clap(long, env)]
    pub stamper_imap_server: Option<String>,

    /// Username for IMAP and SMTP (default: --stamper-own-address).
    #[clap(long, env)]
    pub stamper_username: Option<String>,

    /// Password for IMAP and SMTP.
    #[clap(long, env)]
    pub stamper_password: Option<String>,

    /// Some Dovecot servers mismatch the last char of stamper-from in IMAP SEARCH.
    #[clap(long, env)]
    pub no_dovecot_bug_workaround: bool,
}

fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

impl Args {
    /// Validate cross-field constraints and turn the flat CLI surface into
    /// an immutable [`Config`].
    pub fn into_config(mut self) -> Result<Config, String> {
        if self.stamper_username.is_none() {
            self.stamper_username = self.stamper_own_address.clone();
        }
        if !self.no_dovecot_bug_workaround && !self.stamper_from.is_empty() {
            self.stamper_from.pop();
        }

        let domain = self
            .domain
            .unwrap_or_else(|| self.own_url.replace("https://", ""));

        if self.stamper_own_address.is_none() {
            if self.commit_interval < Duration::from_secs(60) {
                return Err("--commit-interval may not be shorter than 1m".to_string());
            }
        } else if self.commit_interval < Duration::from_secs(600) {
            return Err(
                "--commit-interval may not be shorter than 10m when using the PGP Digital Timestamper"
                    .to_string(),
            );
        }

        if let Some(offset) = self.commit_offset {
            if offset >= self.commit_interval {
                return Err("--commit-offset must be less than --commit-interval".to_string());
            }
        }

        let gnupg_home = self.gnupg_home.unwrap_or_else(|| {
            std::env::var_os("GNUPGHOME")
                .map(PathBuf::from)
                .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".gnupg")))
                .unwrap_or_else(|| PathBuf::from(".gnupg"))
        });

        let repository = self.repository.unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(|h| PathBuf::from(h).join("repo"))
                .unwrap_or_else(|| PathBuf::from("repo"))
        });

        let upstream_timestamp = self
            .upstream_timestamp
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let push_repository = self
            .push_repository
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let push_branch = if self.push_branch == "*" {
            vec!["--all".to_string()]
        } else {
            self.push_branch
                .split_whitespace()
                .map(str::to_string)
                .collect()
        };

        Ok(Config {
            own_url: self.own_url,
            domain,
            gnupg_home,
            keyid: self.keyid,
            max_parallel_signatures: self.max_parallel_signatures,
            max_parallel_timeout: self.max_parallel_timeout,
            number_of_gpg_agents: self.number_of_gpg_agents,
            repository,
            commit_interval: self.commit_interval,
            commit_offset: self.commit_offset,
            upstream_timestamp,
            upstream_sleep: self.upstream_sleep,
            push_repository,
            push_branch,
            stamper_own_address: self.stamper_own_address,
            stamper_keyid: self.stamper_keyid,
            stamper_to: self.stamper_to,
            stamper_from: self.stamper_from,
            stamper_smtp_server: self.stamper_smtp_server,
            stamper_imap_server: self.stamper_imap_server,
            stamper_username: self.stamper_username,
            stamper_password: self.stamper_password,
            ..Config::default()
        })
    }

    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.listen_port)
    }
}

impl Default for Args {
    fn default() -> Self {
        Args {
            debug_level: "info".to_string(),
            keyid: None,
            own_url: String::new(),
            domain: None,
            listen_address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            listen_port: 15177,
            max_parallel_signatures: 2,
            max_parallel_timeout: None,
            number_of_gpg_agents: 1,
            gnupg_home: None,
            commit_interval: Duration::from_secs(3600),
            commit_offset: None,
            repository: None,
            upstream_timestamp: String::new(),
            upstream_sleep: Duration::from_secs(0),
            push_repository: String::new(),
            push_branch: "*".to_string(),
            stamper_own_address: None,
            stamper_keyid: "70B61F81".to_string(),
            stamper_to: "clear@stamper.itconsult.co.uk".to_string(),
            stamper_from: "mailer@stamper.itconsult.co.uk".to_string(),
            stamper_smtp_server: None,
            stamper_imap_server: None,
            stamper_username: None,
            stamper_password: None,
            no_dovecot_bug_workaround: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dovecot_workaround_trims_stamper_from_by_default() {
        let args = Args {
            own_url: "https://example.test".to_string(),
            commit_interval: Duration::from_secs(3600),
            ..Args::default()
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.stamper_from, "mailer@stamper.itconsult.co.u");
    }

    #[test]
    fn short_commit_interval_without_mail_is_rejected() {
        let args = Args {
            own_url: "https://example.test".to_string(),
            commit_interval: Duration::from_secs(30),
            ..Args::default()
        };
        assert!(args.into_config().is_err());
    }

    #[test]
    fn short_commit_interval_with_mail_configured_is_rejected() {
        let args = Args {
            own_url: "https://example.test".to_string(),
            commit_interval: Duration::from_secs(120),
            stamper_own_address: Some("us@example.test".to_string()),
            ..Args::default()
        };
        assert!(args.into_config().is_err());
    }

    #[test]
    fn push_branch_star_expands_to_all() {
        let args = Args {
            own_url: "https://example.test".to_string(),
            commit_interval: Duration::from_secs(3600),
            push_branch: "*".to_string(),
            ..Args::default()
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.push_branch, vec!["--all".to_string()]);
    }
}
