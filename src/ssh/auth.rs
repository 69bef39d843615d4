//! Authentication strategies for SSH sessions.
//!
//! The executor accepts an opaque ordered list of strategies and tries
//! them until one is accepted. Key parsing stays here; the session code
//! never inspects credentials.

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use russh::client;
use russh::keys::agent::client::AgentClient;
use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg, load_secret_key};
use thiserror::Error;
use tracing::{debug, warn};

use super::{Accepter, SshError};

/// Key files probed by [`default_methods`], relative to `~/.ssh`.
const DEFAULT_KEY_FILES: [&str; 4] = ["id_rsa", "id_dsa", "id_ecdsa", "id_ed25519"];

/// One way of authenticating an SSH session.
#[derive(Clone)]
pub enum AuthMethod {
    /// Sign with every identity the SSH agent offers.
    Agent,
    /// Sign with a pre-loaded private key.
    PrivateKey(Arc<PrivateKey>),
    /// Plain password authentication.
    Password(String),
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent => write!(f, "Agent"),
            Self::PrivateKey(_) => write!(f, "PrivateKey(..)"),
            Self::Password(_) => write!(f, "Password(..)"),
        }
    }
}

/// Errors raised while loading key material.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The key file is readable by group or others.
    #[error("wrong permission for the key file: {path}")]
    KeyPermissions {
        /// Offending key path.
        path: Utf8PathBuf,
    },
    /// The key file could not be read.
    #[error("cannot read key file {path}: {message}")]
    KeyRead {
        /// Offending key path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// The key file did not parse as a private key.
    #[error("cannot parse key file from {path}: {message}")]
    KeyParse {
        /// Offending key path.
        path: Utf8PathBuf,
        /// Decoder error string.
        message: String,
    },
}

/// Loads a private key from `path`.
///
/// Returns `Ok(None)` when the file does not exist, so callers can probe
/// the conventional key locations without special-casing absences.
///
/// # Errors
///
/// Returns [`AuthError::KeyPermissions`] when the file is accessible to
/// group or others, and [`AuthError::KeyRead`]/[`AuthError::KeyParse`] for
/// unreadable or malformed keys.
pub fn private_key_from_file(path: &Utf8Path) -> Result<Option<AuthMethod>, AuthError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(AuthError::KeyRead {
                path: path.to_path_buf(),
                message: err.to_string(),
            });
        }
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o077 != 0 {
            return Err(AuthError::KeyPermissions {
                path: path.to_path_buf(),
            });
        }
    }

    match load_secret_key(path.as_std_path(), None) {
        Ok(key) => Ok(Some(AuthMethod::PrivateKey(Arc::new(key)))),
        Err(err) => Err(AuthError::KeyParse {
            path: path.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

/// Builds the conventional strategy list: the agent (when
/// `SSH_AUTH_SOCK` is set) followed by the usual `~/.ssh` key files.
/// Unusable key files are skipped with a warning.
#[must_use]
pub fn default_methods() -> Vec<AuthMethod> {
    let mut methods = Vec::new();
    if std::env::var("SSH_AUTH_SOCK").is_ok_and(|sock| !sock.is_empty()) {
        methods.push(AuthMethod::Agent);
    }

    let Ok(home) = std::env::var("HOME") else {
        return methods;
    };
    let ssh_dir = Utf8PathBuf::from(home).join(".ssh");
    for name in DEFAULT_KEY_FILES {
        let path = ssh_dir.join(name);
        match private_key_from_file(&path) {
            Ok(Some(method)) => methods.push(method),
            Ok(None) => {}
            Err(err) => warn!(key = %path, error = %err, "skipping unusable key file"),
        }
    }
    methods
}

/// Tries each strategy in order until the server accepts one.
pub(super) async fn authenticate(
    handle: &mut client::Handle<Accepter>,
    user: &str,
    methods: &[AuthMethod],
    endpoint: &str,
) -> Result<(), SshError> {
    for method in methods {
        debug!(user, endpoint, method = ?method, "attempting authentication");
        let accepted = match method {
            AuthMethod::Password(password) => handle
                .authenticate_password(user, password.clone())
                .await
                .map_err(|err| handshake_error(endpoint, &err))?
                .success(),
            AuthMethod::PrivateKey(key) => {
                let hash = best_hash(handle, endpoint).await?;
                handle
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::clone(key), hash))
                    .await
                    .map_err(|err| handshake_error(endpoint, &err))?
                    .success()
            }
            AuthMethod::Agent => agent_auth(handle, user, endpoint).await?,
        };
        if accepted {
            return Ok(());
        }
    }

    Err(SshError::Auth {
        user: user.to_owned(),
        endpoint: endpoint.to_owned(),
    })
}

async fn agent_auth(
    handle: &mut client::Handle<Accepter>,
    user: &str,
    endpoint: &str,
) -> Result<bool, SshError> {
    let mut agent = match AgentClient::connect_env().await {
        Ok(agent) => agent,
        Err(err) => {
            debug!(error = %err, "ssh agent unavailable");
            return Ok(false);
        }
    };
    let identities = match agent.request_identities().await {
        Ok(identities) => identities,
        Err(err) => {
            debug!(error = %err, "ssh agent refused to list identities");
            return Ok(false);
        }
    };

    let hash = best_hash(handle, endpoint).await?;
    for key in identities {
        match handle
            .authenticate_publickey_with(user, key, hash, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => {}
            Err(err) => debug!(error = %err, "agent identity rejected"),
        }
    }
    Ok(false)
}

async fn best_hash(
    handle: &mut client::Handle<Accepter>,
    endpoint: &str,
) -> Result<Option<HashAlg>, SshError> {
    handle
        .best_supported_rsa_hash()
        .await
        .map(Option::flatten)
        .map_err(|err| handshake_error(endpoint, &err))
}

fn handshake_error(endpoint: &str, err: &dyn std::error::Error) -> SshError {
    SshError::Handshake {
        endpoint: endpoint.to_owned(),
        message: err.to_string(),
    }
}
