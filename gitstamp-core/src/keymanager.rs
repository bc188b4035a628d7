//! Resolves (or creates) the PGP signing key before any signer replica is
//! spawned. Grounded in `original_source/zeitgitter/stamper.py`
//! (`get_keyid`/`create_key`) and, for the subprocess plumbing, in
//! `util.rs::assert_gpg_directory` from the teacher repository.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct SecretKeyInfo {
    pub keyid: String,
    pub uid: String,
}

/// Run `gpg --list-secret-keys --with-colons [--with-fingerprint] [keyid]`
/// against a given `GNUPGHOME` and parse out keyid/uid pairs.
#[instrument]
async fn list_secret_keys(gnupg_home: &Path, keyid: Option<&str>) -> Result<Vec<SecretKeyInfo>> {
    let mut cmd = Command::new("gpg");
    cmd.env("GNUPGHOME", gnupg_home)
        .arg("--batch")
        .arg("--with-colons")
        .arg("--list-secret-keys");
    if let Some(k) = keyid {
        cmd.arg(k);
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let output = cmd.output().await?;
    // A missing key is reported as a nonzero exit; that's not a local
    // failure, it just means "no match".
    if !output.status.success() {
        return Ok(Vec::new());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut keys = Vec::new();
    let mut current_keyid: Option<String> = None;
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first() {
            Some(&"sec") => {
                current_keyid = fields.get(4).map(|s| s.to_string());
            }
            Some(&"uid") => {
                if let (Some(keyid), Some(uid)) = (current_keyid.clone(), fields.get(9)) {
                    keys.push(SecretKeyInfo {
                        keyid,
                        uid: uid.to_string(),
                    });
                }
            }
            _ => {}
        }
    }
    Ok(keys)
}

/// First dot-separated component of `domain` that isn't `zeitgitter`,
/// `igitt`, empty, or containing `stamp` — same heuristic as the Python
/// `get_nick`.
fn derive_nickname(domain: &str) -> Option<String> {
    domain
        .split('.')
        .find(|part| !part.is_empty() && *part != "igitt" && !part.contains("stamp"))
        .map(|s| {
            let mut c = s.chars();
            match c.next() {
                Some(first) => first.to_uppercase().collect::<String>() + c.as_str(),
                None => String::new(),
            }
        })
}

#[instrument]
async fn create_key(gnupg_home: &Path, name: &str, email: &str) -> Result<SecretKeyInfo> {
    let batch = format!(
        "%no-protection\n\
         Key-Type: eddsa\n\
         Key-Curve: Ed25519\n\
         Key-Usage: sign\n\
         Name-Real: {name}\n\
         Name-Email: {email}\n\
         %commit\n"
    );

    let mut child = Command::new("gpg")
        .env("GNUPGHOME", gnupg_home)
        .arg("--batch")
        .arg("--generate-key")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    child
        .stdin
        .take()
        .expect("stdin was piped")
        .write_all(batch.as_bytes())
        .await?;

    let output = tokio::time::timeout(Duration::from_secs(30), child.wait_with_output()).await??;
    Error::assert_exit_status(output.status)?;

    let keys = list_secret_keys(gnupg_home, Some(email)).await?;
    keys.into_iter()
        .next()
        .ok_or_else(|| Error::KeyResolution {
            reason: format!("key generation for {email} reported success but no key was found"),
        })
}

/// `gpg --export --armor <keyid>`, the ASCII-armored public key served at
/// `GET /?request=get-public-key-v1` and committed as `pubkey.asc`.
#[instrument]
pub async fn export_public_key(gnupg_home: &Path, keyid: &str) -> Result<String> {
    let output = Command::new("gpg")
        .env("GNUPGHOME", gnupg_home)
        .arg("--batch")
        .arg("--export")
        .arg("--armor")
        .arg(keyid)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    Error::assert_exit_status(output.status)?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Resolve (and possibly create) the signing key, per §4.1/§3. Must
/// complete before any signer replica is spawned, so replicas never
/// diverge from this key.
#[instrument]
pub async fn resolve_or_create_key(
    gnupg_home: &Path,
    keyid: Option<&str>,
    domain: &str,
) -> Result<SecretKeyInfo> {
    if let Some(keyid) = keyid {
        let matches = list_secret_keys(gnupg_home, Some(keyid)).await?;
        if matches.len() == 1 {
            return Ok(matches.into_iter().next().unwrap());
        }
        if matches.is_empty() {
            if let Some((name, email)) = parse_name_email(keyid) {
                info!(%keyid, "no matching secret key, creating one");
                return create_key(gnupg_home, &name, &email).await;
            }
            return Err(Error::KeyResolution {
                reason: format!(
                    "no secret keys match keyid '{keyid}', and it is not of the \
                     form 'Description <email>'"
                ),
            });
        }
        return Err(Error::KeyResolution {
            reason: format!("too many secret keys matching key '{keyid}'"),
        });
    }

    let all = list_secret_keys(gnupg_home, None).await?;
    if all.len() == 1 {
        return Ok(all.into_iter().next().unwrap());
    }
    if all.is_empty() {
        let nick = derive_nickname(domain).ok_or_else(|| Error::KeyResolution {
            reason: "please specify a keyid".to_string(),
        })?;
        let maildomain = domain.replacen('.', "@", 1);
        let name = format!("{nick} Timestamping Service");
        debug!(%name, %maildomain, "deriving identity for new key");
        return create_key(gnupg_home, &name, &maildomain).await;
    }
    Err(Error::KeyResolution {
        reason: "please specify a keyid in the configuration".to_string(),
    })
}

/// Split a GnuPG UID string (`Name <email>`) into its parts, as used both
/// for deriving an identity to create a key under and for `git config
/// user.name`/`user.email` at repository bootstrap.
pub fn parse_name_email(s: &str) -> Option<(String, String)> {
    let (name, rest) = s.split_once(" <")?;
    let email = rest.strip_suffix('>')?;
    if name.is_empty() || email.is_empty() {
        return None;
    }
    Some((name.to_string(), email.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_nickname_skips_zeitgitter_and_stamp_parts() {
        assert_eq!(
            derive_nickname("hagrid.snakeoil"),
            Some("Hagrid".to_string())
        );
        assert_eq!(
            derive_nickname("zeitgitter.example.com"),
            Some("Example".to_string())
        );
        assert_eq!(derive_nickname("timestamper.stamp.net"), None);
    }

    #[test]
    fn parse_name_email_accepts_well_formed_identity() {
        assert_eq!(
            parse_name_email("Hagrid Snakeoil <timestomping@hagrid.snakeoil>"),
            Some((
                "Hagrid Snakeoil".to_string(),
                "timestomping@hagrid.snakeoil".to_string()
            ))
        );
    }

    #[test]
    fn parse_name_email_rejects_malformed_identity() {
        assert!(parse_name_email("not an identity").is_none());
        assert!(parse_name_email("Name <>").is_none());
    }
}
