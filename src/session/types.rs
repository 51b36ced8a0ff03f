//! Session records and status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::forwarding::TunnelError;
use crate::ssh::SshError;
use crate::stats::StatsSnapshot;

/// Where a session is in its lifecycle.
///
/// ```text
/// Created -> Connecting -> Connected -> Active -> Stopping -> Stopped
///                 |            |           |
///               Error <--------------------+
/// ```
///
/// `Error` is transient: the supervisor follows it with a retry delay and
/// a fresh `Connecting`, unless the failure is permanent or the retry
/// budget ran out, in which case `Stopped` follows directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Connecting,
    Connected,
    Active,
    Stopping,
    Stopped,
    Error,
}

impl SessionStatus {
    /// A session may (re)start from these states only.
    pub fn can_start(self) -> bool {
        matches!(self, SessionStatus::Created | SessionStatus::Stopped)
    }

    pub fn is_terminal(self) -> bool {
        self == SessionStatus::Stopped
    }
}

/// Mutable per-session state, guarded by the supervisor's lock.
#[derive(Debug, Clone)]
pub(crate) struct SessionRecord {
    pub status: SessionStatus,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SessionRecord {
    pub fn new() -> Self {
        Self {
            status: SessionStatus::Created,
            connected_at: None,
            disconnected_at: None,
            last_error: None,
        }
    }
}

/// Consistent copy of one session, as handed to the API layer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    /// `user@host:port` of the SSH identity.
    pub target: String,
    /// Human-readable rule description.
    pub description: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub stats: StatsSnapshot,
}

/// Errors from the session API.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {id} cannot {operation} while {status:?}")]
    InvalidState {
        id: String,
        operation: &'static str,
        status: SessionStatus,
    },

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Ssh(#[from] SshError),
}
