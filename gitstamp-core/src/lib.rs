//! Domain logic for a decentralized Git-based timestamping service:
//! validating and signing client requests, the periodic commit loop that
//! anchors accumulated evidence into the repository, and the email
//! cross-timestamp protocol. The HTTP/CLI surface lives in `gitstampd`.

pub mod commitloop;
pub mod config;
pub mod error;
pub mod evidence;
pub mod keymanager;
pub mod mail;
pub mod repository;
pub mod signer;
pub mod stamper;
pub mod time;
pub mod validate;

pub use commitloop::CommitLoop;
pub use config::Config;
pub use error::{Error, Result};
pub use evidence::EvidenceLog;
pub use keymanager::{export_public_key, parse_name_email, resolve_or_create_key, SecretKeyInfo};
pub use mail::MailWorker;
pub use signer::{SignOutcome, SignerPool};
pub use stamper::{StampResult, Stamper};
