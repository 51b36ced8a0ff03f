//! Credential resolution
//!
//! Turns a `HostIdentity`'s credential list into an ordered sequence of
//! authentication attempts. Unusable credentials are skipped with a warning
//! rather than failing the whole connect: an encrypted key without a
//! passphrase, an empty password, or a missing agent socket just drop out
//! of the sequence.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::{HashAlg, PrivateKeyWithHashAlg};
use tracing::{debug, warn};

use super::error::SshError;
use super::identity::{Credential, HostIdentity};

/// Default private key files probed when an identity carries no credentials.
const DEFAULT_KEY_FILES: [&str; 4] = ["id_ed25519", "id_ecdsa", "id_rsa", "id_dsa"];

/// One prompt of a keyboard-interactive challenge.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub text: String,
    /// When false the response must not be echoed (password-style input).
    pub echo: bool,
}

/// Answers keyboard-interactive challenges on behalf of the user.
///
/// The CLI collaborator installs a terminal-backed handler; server-side
/// contexts keep the default [`DenyPrompts`].
#[async_trait]
pub trait PromptHandler: Send + Sync {
    /// Return one response per prompt, or `None` to abort the attempt.
    async fn respond(
        &self,
        name: &str,
        instructions: &str,
        prompts: &[Prompt],
    ) -> Option<Vec<String>>;
}

/// Refuses every interactive challenge.
pub struct DenyPrompts;

#[async_trait]
impl PromptHandler for DenyPrompts {
    async fn respond(&self, name: &str, _: &str, prompts: &[Prompt]) -> Option<Vec<String>> {
        debug!(
            "denying interactive challenge '{}' ({} prompts)",
            name,
            prompts.len()
        );
        None
    }
}

/// A single ready-to-run authentication attempt.
pub enum AuthAttempt {
    /// Keys held by the ambient SSH agent.
    Agent,
    /// A loaded private key.
    Key {
        source: String,
        key: PrivateKeyWithHashAlg,
    },
    /// A password.
    Password(String),
    /// Keyboard-interactive via the registered prompt handler.
    Interactive,
}

impl std::fmt::Debug for AuthAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthAttempt::Agent => write!(f, "Agent"),
            AuthAttempt::Key { source, .. } => write!(f, "Key({})", source),
            AuthAttempt::Password(_) => write!(f, "Password"),
            AuthAttempt::Interactive => write!(f, "Interactive"),
        }
    }
}

/// Resolves identities into ordered attempt lists.
pub struct AuthResolver;

impl AuthResolver {
    /// Produce the attempt sequence for `identity`: agent, then keys, then
    /// password, then interactive. Returns `NoCredentials` when nothing
    /// usable remains after skipping.
    pub fn resolve(identity: &HostIdentity) -> Result<Vec<AuthAttempt>, SshError> {
        let agent_endpoint = std::env::var("SSH_AUTH_SOCK").ok();
        Self::resolve_with_agent(identity, agent_endpoint.as_deref())
    }

    /// As [`resolve`], with the agent endpoint supplied explicitly.
    pub fn resolve_with_agent(
        identity: &HostIdentity,
        agent_endpoint: Option<&str>,
    ) -> Result<Vec<AuthAttempt>, SshError> {
        let mut agent = Vec::new();
        let mut keys = Vec::new();
        let mut passwords = Vec::new();
        let mut interactive = Vec::new();

        for credential in &identity.credentials {
            match credential {
                Credential::Agent => match agent_endpoint {
                    Some(_) => agent.push(AuthAttempt::Agent),
                    None => {
                        debug!("SSH_AUTH_SOCK not set, skipping agent credential");
                    }
                },
                Credential::KeyFile { path, passphrase } => {
                    match load_key_file(path, passphrase.as_deref()) {
                        Ok(key) => keys.push(AuthAttempt::Key {
                            source: path.display().to_string(),
                            key,
                        }),
                        Err(e) => {
                            warn!("skipping key {}: {}", path.display(), e);
                        }
                    }
                }
                Credential::KeyData { data, passphrase } => {
                    match load_key_data(data, passphrase.as_deref()) {
                        Ok(key) => keys.push(AuthAttempt::Key {
                            source: "inline".to_string(),
                            key,
                        }),
                        Err(e) => {
                            warn!("skipping inline key: {}", e);
                        }
                    }
                }
                Credential::Password { password } => {
                    if password.is_empty() {
                        debug!("skipping empty password credential");
                    } else {
                        passwords.push(AuthAttempt::Password(password.clone()));
                    }
                }
                Credential::Interactive => interactive.push(AuthAttempt::Interactive),
            }
        }

        // No explicit credentials: probe the well-known key files.
        if identity.credentials.is_empty() {
            for path in default_key_paths() {
                if !path.exists() {
                    continue;
                }
                match load_key_file(&path, None) {
                    Ok(key) => keys.push(AuthAttempt::Key {
                        source: path.display().to_string(),
                        key,
                    }),
                    Err(e) => {
                        debug!("default key {} not usable: {}", path.display(), e);
                    }
                }
            }
        }

        let mut attempts = agent;
        attempts.extend(keys);
        attempts.extend(passwords);
        attempts.extend(interactive);

        if attempts.is_empty() {
            return Err(SshError::NoCredentials {
                user: identity.username.clone(),
                host: identity.host.clone(),
            });
        }
        Ok(attempts)
    }
}

fn default_key_paths() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let ssh_dir = home.join(".ssh");
    DEFAULT_KEY_FILES
        .iter()
        .map(|name| ssh_dir.join(name))
        .collect()
}

fn load_key_file(path: &Path, passphrase: Option<&str>) -> Result<PrivateKeyWithHashAlg, SshError> {
    let key = russh::keys::load_secret_key(path, passphrase).map_err(|e| {
        let msg = e.to_string();
        if msg.contains("encrypted") || msg.contains("passphrase") {
            SshError::KeyLoad(format!(
                "key {} is encrypted and no passphrase was given",
                path.display()
            ))
        } else {
            SshError::KeyLoad(format!("failed to parse {}: {}", path.display(), e))
        }
    })?;
    Ok(with_hash_alg(key))
}

fn load_key_data(data: &str, passphrase: Option<&str>) -> Result<PrivateKeyWithHashAlg, SshError> {
    let key = russh::keys::decode_secret_key(data, passphrase)
        .map_err(|e| SshError::KeyLoad(format!("failed to parse inline key: {}", e)))?;
    Ok(with_hash_alg(key))
}

/// RSA keys sign with SHA-512; other algorithms use their native hash.
fn with_hash_alg(key: russh::keys::PrivateKey) -> PrivateKeyWithHashAlg {
    let hash_alg = if key.algorithm().is_rsa() {
        Some(HashAlg::Sha512)
    } else {
        None
    };
    PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg)
}
