//! Session status events
//!
//! Every status transition is published on a broadcast channel shared by
//! all supervisors of one manager. Subscribers that fall behind lag and
//! lose old events; they never stall a supervisor.

use serde::Serialize;

use super::types::SessionStatus;

/// One status transition.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub old_status: SessionStatus,
    pub new_status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
