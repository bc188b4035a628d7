use std::process::ExitStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("thread was unable to join: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("process returned nonzero exit code: {exit_code}")]
    Command { exit_code: i32 },

    #[error("timeout expired: {timeout}")]
    Timeout {
        #[from]
        timeout: tokio::time::error::Elapsed,
    },

    #[error("git operation failed: {source}")]
    Git {
        #[from]
        source: git2::Error,
    },

    #[error("key resolution ambiguous or failed: {reason}")]
    KeyResolution { reason: String },

    #[error("signer pool exhausted")]
    SignerTimeout,

    #[error("invalid commit id or tag name in request")]
    InvalidRequest,

    #[error("duration could not be parsed: {source}")]
    DurationParse {
        #[from]
        source: humantime::DurationError,
    },

    #[error("smtp error: {source}")]
    Smtp {
        #[from]
        source: lettre::transport::smtp::Error,
    },

    #[error("email address invalid: {source}")]
    Address {
        #[from]
        source: lettre::address::AddressError,
    },

    #[error("mail message could not be built: {source}")]
    MailBuild {
        #[from]
        source: lettre::error::Error,
    },

    #[error("imap error: {source}")]
    Imap {
        #[from]
        source: imap::Error,
    },

    #[error("tls error: {source}")]
    Tls {
        #[from]
        source: native_tls::Error,
    },
}

impl Error {
    /// Assert the program exited with an exit code of zero, assuming zero is a success case; if an
    /// exit code was unobtainable, don't err on the side of caution.
    pub fn assert_exit_status(xs: ExitStatus) -> Result<ExitStatus> {
        if let Some(n) = xs.code() {
            if n != 0 {
                return Err(Error::Command { exit_code: n });
            }
        }
        Ok(xs)
    }
}
