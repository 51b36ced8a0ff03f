//! Process-level configuration
//!
//! Supplied by the embedding process as structs; file formats and argument
//! parsing belong to the collaborator that owns them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ssh::HostKeyPolicy;

/// Everything the core reads from its caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub ssh: SshDefaults,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub tunnel: TunnelDefaults,
}

/// SSH connection defaults applied to every identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshDefaults {
    /// TCP dial + handshake budget, seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Keepalive probe cadence, seconds.
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_secs: u64,

    /// Consecutive probe failures before the transport is declared dead.
    #[serde(default = "default_keep_alive_failures")]
    pub keep_alive_failures: u32,

    /// Consecutive transient session failures before giving up.
    /// 0 means retry forever.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause between session reconnect attempts, seconds.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// Policy applied when an identity does not specify one.
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

impl Default for SshDefaults {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            keep_alive_interval_secs: default_keep_alive_interval(),
            keep_alive_failures: default_keep_alive_failures(),
            max_retries: default_max_retries(),
            retry_interval_secs: default_retry_interval(),
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}

impl SshDefaults {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

/// Transport pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Simultaneously live transports. 0 means unlimited.
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,

    /// Idle time after which an unreferenced transport is closed, seconds.
    #[serde(default = "default_pool_max_idle")]
    pub max_idle_secs: u64,

    /// Budget for one transport creation under the per-key lock, seconds.
    #[serde(default = "default_pool_create_timeout")]
    pub create_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
            max_idle_secs: default_pool_max_idle(),
            create_timeout_secs: default_pool_create_timeout(),
        }
    }
}

impl PoolConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }
}

/// Tunnel defaults applied where a rule does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelDefaults {
    /// Per-connection idle window, seconds. 0 disables the idle close.
    #[serde(default = "default_tunnel_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Per-rule concurrent connection cap. 0 means unlimited.
    #[serde(default = "default_tunnel_max_connections")]
    pub max_concurrent_connections: u64,

    /// Whether Local/Dynamic listeners may bind non-loopback addresses.
    #[serde(default)]
    pub allow_remote_connections: bool,

    /// SOCKS version for Dynamic rules that do not specify one.
    #[serde(default = "default_socks_version")]
    pub socks_version: u8,
}

impl Default for TunnelDefaults {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_tunnel_idle_timeout(),
            max_concurrent_connections: default_tunnel_max_connections(),
            allow_remote_connections: false,
            socks_version: default_socks_version(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keep_alive_interval() -> u64 {
    15
}

fn default_keep_alive_failures() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval() -> u64 {
    5
}

fn default_pool_max_size() -> usize {
    10
}

fn default_pool_max_idle() -> u64 {
    300
}

fn default_pool_create_timeout() -> u64 {
    60
}

fn default_tunnel_idle_timeout() -> u64 {
    300
}

fn default_tunnel_max_connections() -> u64 {
    100
}

fn default_socks_version() -> u8 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.ssh.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.ssh.keep_alive_failures, 3);
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.pool.max_idle(), Duration::from_secs(300));
        assert_eq!(config.tunnel.socks_version, 5);
        assert!(!config.tunnel.allow_remote_connections);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"ssh": {"max_retries": 0}, "pool": {"max_size": 2}}"#)
                .unwrap();
        assert_eq!(config.ssh.max_retries, 0);
        assert_eq!(config.ssh.retry_interval_secs, 5);
        assert_eq!(config.pool.max_size, 2);
        assert_eq!(config.tunnel.max_concurrent_connections, 100);
    }
}
