//! The tunnel data plane: rules, acceptors, the splicer, and SOCKS.

pub mod manager;
pub mod rule;
pub mod socks;
pub mod splice;

use thiserror::Error;

use crate::ssh::SshError;

pub use manager::{TunnelManager, TunnelState};
pub use rule::{TunnelLimits, TunnelRule};
pub use socks::{SocksError, SocksReply, SocksRequest, SocksVersion};
pub use splice::{splice, SpliceOutcome};

/// Errors that end (or refuse to start) a tunnel.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The rule is structurally unusable.
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// The local listener could not be bound. Permanent: a port in use
    /// stays in use across retries.
    #[error("failed to listen on {addr}: {reason}")]
    ListenFailed { addr: String, reason: String },

    /// The peer's listener went away while the tunnel was running.
    #[error("remote listener lost")]
    RemoteListenerLost,

    /// A SOCKS client spoke the protocol wrong. Local to one connection.
    #[error(transparent)]
    Socks(#[from] socks::SocksError),

    /// Start called in a state other than Created.
    #[error("tunnel already started")]
    AlreadyStarted,

    #[error(transparent)]
    Ssh(#[from] SshError),
}

impl TunnelError {
    /// Permanent errors stop the session; transient ones reconnect.
    pub fn is_permanent(&self) -> bool {
        match self {
            TunnelError::InvalidRule(_) => true,
            TunnelError::ListenFailed { .. } => true,
            TunnelError::RemoteListenerLost => false,
            TunnelError::Socks(_) => false,
            TunnelError::AlreadyStarted => true,
            TunnelError::Ssh(e) => e.is_permanent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanence_split() {
        assert!(TunnelError::ListenFailed {
            addr: "127.0.0.1:80".into(),
            reason: "in use".into()
        }
        .is_permanent());
        assert!(!TunnelError::RemoteListenerLost.is_permanent());
        assert!(!TunnelError::Ssh(SshError::TransportDead).is_permanent());
        assert!(TunnelError::Ssh(SshError::AuthFailed("x".into())).is_permanent());
    }
}
