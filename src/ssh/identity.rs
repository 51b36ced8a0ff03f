//! SSH identities and credentials
//!
//! A `HostIdentity` is the unit the rest of the crate keys on: where to
//! connect, who to connect as, what to try for authentication, and how to
//! treat the server's host key.

use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Host key verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKeyPolicy {
    /// Only hosts already present in known_hosts are accepted.
    Strict,
    /// Any key is accepted. Insecure; logged at warn on every connect.
    Accept,
    /// Trust-on-first-use: unknown keys are recorded, changed keys fail.
    Ask,
}

impl Default for HostKeyPolicy {
    fn default() -> Self {
        HostKeyPolicy::Ask
    }
}

/// One way of proving the identity to the server.
///
/// An identity may carry several; the resolver orders attempts
/// agent, then keys, then password, then interactive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// Password authentication.
    Password { password: String },

    /// Private key loaded from disk.
    KeyFile {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },

    /// Private key material supplied inline (PEM/OpenSSH encoded).
    KeyData {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },

    /// Keys held by the ambient SSH agent (`SSH_AUTH_SOCK`).
    Agent,

    /// Keyboard-interactive; challenges go to the registered prompt handler.
    Interactive,
}

/// The identity of one SSH endpoint plus how to authenticate against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostIdentity {
    /// Remote host name or address.
    pub host: String,

    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Remote username.
    pub username: String,

    /// Credentials to try, in no particular order; the resolver sorts them.
    /// An empty list triggers the default private-key search.
    #[serde(default)]
    pub credentials: Vec<Credential>,

    /// How to verify the server's host key. `None` falls back to the
    /// process-wide default policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_policy: Option<HostKeyPolicy>,

    /// Alternate known_hosts file; defaults to `~/.ssh/known_hosts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_file: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

impl HostIdentity {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            credentials: Vec::new(),
            host_key_policy: None,
            known_hosts_file: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.credentials.push(Credential::Password {
            password: password.into(),
        });
        self
    }

    pub fn with_key_file(mut self, path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        self.credentials.push(Credential::KeyFile {
            path: path.into(),
            passphrase,
        });
        self
    }

    pub fn with_agent(mut self) -> Self {
        self.credentials.push(Credential::Agent);
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = Some(policy);
        self
    }

    /// The tuple that decides transport sharing. Credentials are not part
    /// of the key: two identities that differ only in credentials share a
    /// pooled transport.
    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(&self.username, &self.host, self.port)
    }

    /// `user@host:port`, for logs and snapshots.
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Key under which transports are pooled: (username, host, port).
#[derive(Clone, Debug, Eq)]
pub struct PoolKey {
    pub username: Arc<str>,
    pub host: Arc<str>,
    pub port: u16,
}

impl PoolKey {
    pub fn new(username: &str, host: &str, port: u16) -> Self {
        Self {
            username: Arc::from(username),
            host: Arc::from(host),
            port,
        }
    }
}

impl PartialEq for PoolKey {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port
            && self.host.as_ref() == other.host.as_ref()
            && self.username.as_ref() == other.username.as_ref()
    }
}

impl Hash for PoolKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.username.as_ref().hash(state);
        self.host.as_ref().hash(state);
        self.port.hash(state);
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}
