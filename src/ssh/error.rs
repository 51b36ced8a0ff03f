//! SSH error types

use thiserror::Error;

/// Errors produced while establishing or using an SSH transport.
#[derive(Error, Debug)]
pub enum SshError {
    /// TCP connection to the SSH host could not be established.
    #[error("dial failed: {0}")]
    DialFailed(String),

    /// The SSH handshake itself failed (version exchange, kex, ...).
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Every credential attempt was rejected by the server.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The identity produced no usable credential attempts.
    #[error("no credentials available for {user}@{host}")]
    NoCredentials { user: String, host: String },

    /// A private key could not be read or parsed.
    #[error("key error: {0}")]
    KeyLoad(String),

    /// No SSH agent endpoint, or the agent refused us.
    #[error("ssh agent unavailable: {0}")]
    AgentUnavailable(String),

    /// Strict policy and the host is not in known_hosts.
    #[error("unknown host key for {host} (fingerprint {fingerprint})")]
    HostKeyUnknown { host: String, fingerprint: String },

    /// The presented host key differs from the recorded one.
    #[error("host key mismatch for {host}: expected {expected}, got {actual}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    /// The transport has been marked dead; no further operations succeed.
    #[error("transport is dead")]
    TransportDead,

    /// The pool is at capacity and the key is not already present.
    #[error("transport pool exhausted ({max} entries)")]
    PoolExhausted { max: usize },

    /// A direct-tcpip or session channel could not be opened.
    #[error("channel open failed: {0}")]
    ChannelOpenFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("ssh protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SshError {
    /// Whether retrying the same identity can ever succeed.
    ///
    /// Permanent errors stop the owning session; transient ones are retried
    /// under the supervisor's retry budget.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SshError::AuthFailed(_)
                | SshError::NoCredentials { .. }
                | SshError::HostKeyUnknown { .. }
                | SshError::HostKeyMismatch { .. }
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyLoad(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanence_classification() {
        assert!(SshError::AuthFailed("nope".into()).is_permanent());
        assert!(SshError::HostKeyMismatch {
            host: "h".into(),
            expected: "a".into(),
            actual: "b".into()
        }
        .is_permanent());
        assert!(!SshError::TransportDead.is_permanent());
        assert!(!SshError::PoolExhausted { max: 4 }.is_permanent());
        assert!(!SshError::DialFailed("refused".into()).is_permanent());
    }
}
