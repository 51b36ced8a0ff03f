//! portfly: an SSH tunnel runtime
//!
//! A pool of authenticated SSH transports shared by many forwarding
//! rules, a tunnel data plane (local, remote, and dynamic SOCKS
//! forwarding) with per-connection accounting, per-session supervision
//! with reconnect, and interactive PTY sessions over the same transports.
//!
//! The embedding process supplies identities ([`ssh::HostIdentity`]) and
//! rules ([`forwarding::TunnelRule`]) and drives everything through
//! [`session::SessionManager`]:
//!
//! ```no_run
//! use portfly::config::CoreConfig;
//! use portfly::forwarding::TunnelRule;
//! use portfly::session::SessionManager;
//! use portfly::ssh::HostIdentity;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = SessionManager::new(CoreConfig::default());
//!
//! let identity = HostIdentity::new("gw.example.com", 22, "alice")
//!     .with_key_file("/home/alice/.ssh/id_ed25519", None);
//! let rule = TunnelRule::local("127.0.0.1", 18080, "example.internal", 80);
//!
//! let session = manager.create_session(identity, rule)?;
//! manager.start_session(&session)?;
//!
//! let mut events = manager.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{}: {:?} -> {:?}", event.session_id, event.old_status, event.new_status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod forwarding;
pub mod pty;
pub mod session;
pub mod ssh;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use config::CoreConfig;
pub use forwarding::{TunnelError, TunnelRule};
pub use pty::{PtyInput, PtyOutput, PtySession};
pub use session::{SessionError, SessionEvent, SessionManager, SessionSnapshot, SessionStatus};
pub use ssh::{Credential, HostIdentity, HostKeyPolicy, SshError};
pub use stats::{StatsRegistry, StatsSnapshot};
