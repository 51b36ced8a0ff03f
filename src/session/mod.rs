//! Session supervision: one state machine per (identity, rule) binding.

pub mod events;
pub mod manager;
mod supervisor;
pub mod types;

pub use events::SessionEvent;
pub use manager::{ManagedPty, RuleStore, SessionManager, StoredRule};
pub use types::{SessionError, SessionSnapshot, SessionStatus};
