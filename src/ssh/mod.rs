//! SSH layer: identities, authentication, transports, and the pool.

pub mod auth;
pub mod client;
pub mod control;
mod error;
mod identity;
pub mod known_hosts;
pub mod pool;
pub mod transport;

pub use auth::{AuthResolver, DenyPrompts, Prompt, PromptHandler};
pub use client::{ClientHandler, SshConnector};
pub use control::{ProbeOutcome, TransportControl};
pub use error::SshError;
pub use identity::{Credential, HostIdentity, HostKeyPolicy, PoolKey};
pub use known_hosts::{HostKeyCheck, KnownHostsStore};
pub use pool::{PoolHandle, TransportPool};
pub use transport::{
    RemoteAcceptor, SshTransport, Transport, TransportConnector, TunnelStream,
};
