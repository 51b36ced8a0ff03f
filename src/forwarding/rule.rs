//! Forwarding rules
//!
//! One rule describes one data plane: listen locally and dial through SSH
//! (`Local`), have the peer listen and dial locally (`Remote`), or a local
//! SOCKS proxy choosing its target per connection (`Dynamic`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::TunnelError;

/// Limits shared by every rule shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelLimits {
    /// Close a connection when no bytes move in either direction for this
    /// long, seconds. 0 disables the idle close.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Cap on concurrently spliced connections. 0 means unlimited.
    #[serde(default = "default_max_connections")]
    pub max_concurrent_connections: u64,

    /// When false, Local and Dynamic listeners are forced onto loopback.
    #[serde(default)]
    pub allow_remote_connections: bool,

    /// Budget for dialing the local target of a Remote rule, seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for TunnelLimits {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            max_concurrent_connections: default_max_connections(),
            allow_remote_connections: false,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl TunnelLimits {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_max_connections() -> u64 {
    100
}

fn default_connect_timeout() -> u64 {
    10
}

/// One forwarding rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TunnelRule {
    /// Listen on `bind_addr:bind_port`, dial `remote_host:remote_port`
    /// through SSH for every accepted connection (`ssh -L`).
    Local {
        bind_addr: String,
        bind_port: u16,
        remote_host: String,
        remote_port: u16,
        #[serde(default)]
        limits: TunnelLimits,
    },

    /// Ask the peer to listen on `remote_bind_addr:remote_bind_port`; dial
    /// `local_host:local_port` for every incoming stream (`ssh -R`).
    Remote {
        remote_bind_addr: String,
        remote_bind_port: u16,
        local_host: String,
        local_port: u16,
        #[serde(default)]
        limits: TunnelLimits,
    },

    /// Listen on `bind_addr:bind_port`, negotiate SOCKS per connection,
    /// then dial the requested target through SSH (`ssh -D`).
    Dynamic {
        bind_addr: String,
        bind_port: u16,
        #[serde(default = "default_socks_version")]
        socks_version: u8,
        #[serde(default)]
        limits: TunnelLimits,
    },
}

fn default_socks_version() -> u8 {
    5
}

impl TunnelRule {
    pub fn local(
        bind_addr: impl Into<String>,
        bind_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        TunnelRule::Local {
            bind_addr: bind_addr.into(),
            bind_port,
            remote_host: remote_host.into(),
            remote_port,
            limits: TunnelLimits::default(),
        }
    }

    pub fn remote(
        remote_bind_addr: impl Into<String>,
        remote_bind_port: u16,
        local_host: impl Into<String>,
        local_port: u16,
    ) -> Self {
        TunnelRule::Remote {
            remote_bind_addr: remote_bind_addr.into(),
            remote_bind_port,
            local_host: local_host.into(),
            local_port,
            limits: TunnelLimits::default(),
        }
    }

    pub fn dynamic(bind_addr: impl Into<String>, bind_port: u16, socks_version: u8) -> Self {
        TunnelRule::Dynamic {
            bind_addr: bind_addr.into(),
            bind_port,
            socks_version,
            limits: TunnelLimits::default(),
        }
    }

    pub fn with_limits(mut self, new_limits: TunnelLimits) -> Self {
        match &mut self {
            TunnelRule::Local { limits, .. }
            | TunnelRule::Remote { limits, .. }
            | TunnelRule::Dynamic { limits, .. } => *limits = new_limits,
        }
        self
    }

    pub fn limits(&self) -> &TunnelLimits {
        match self {
            TunnelRule::Local { limits, .. }
            | TunnelRule::Remote { limits, .. }
            | TunnelRule::Dynamic { limits, .. } => limits,
        }
    }

    /// Bind address a Local/Dynamic listener should actually use: loopback
    /// unless the rule explicitly allows remote connections.
    pub fn effective_bind_addr(&self) -> Option<String> {
        match self {
            TunnelRule::Local {
                bind_addr, limits, ..
            }
            | TunnelRule::Dynamic {
                bind_addr, limits, ..
            } => {
                if limits.allow_remote_connections || is_loopback(bind_addr) {
                    Some(bind_addr.clone())
                } else {
                    Some("127.0.0.1".to_string())
                }
            }
            TunnelRule::Remote { .. } => None,
        }
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        match self {
            TunnelRule::Local {
                remote_host,
                remote_port,
                ..
            } => {
                if remote_host.is_empty() {
                    return Err(TunnelError::InvalidRule("remote host is required".into()));
                }
                if *remote_port == 0 {
                    return Err(TunnelError::InvalidRule("remote port is required".into()));
                }
            }
            TunnelRule::Remote {
                local_host,
                local_port,
                ..
            } => {
                if local_host.is_empty() {
                    return Err(TunnelError::InvalidRule("local host is required".into()));
                }
                if *local_port == 0 {
                    return Err(TunnelError::InvalidRule("local port is required".into()));
                }
            }
            TunnelRule::Dynamic { socks_version, .. } => {
                if *socks_version != 4 && *socks_version != 5 {
                    return Err(TunnelError::InvalidRule(format!(
                        "unsupported SOCKS version {}",
                        socks_version
                    )));
                }
            }
        }
        Ok(())
    }

    /// Human-readable description in ssh flag style.
    pub fn describe(&self) -> String {
        match self {
            TunnelRule::Local {
                bind_addr,
                bind_port,
                remote_host,
                remote_port,
                ..
            } => format!(
                "local {}:{} -> {}:{}",
                bind_addr, bind_port, remote_host, remote_port
            ),
            TunnelRule::Remote {
                remote_bind_addr,
                remote_bind_port,
                local_host,
                local_port,
                ..
            } => format!(
                "remote {}:{} -> {}:{}",
                remote_bind_addr, remote_bind_port, local_host, local_port
            ),
            TunnelRule::Dynamic {
                bind_addr,
                bind_port,
                socks_version,
                ..
            } => format!("socks{} proxy on {}:{}", socks_version, bind_addr, bind_port),
        }
    }
}

fn is_loopback(addr: &str) -> bool {
    if addr == "localhost" {
        return true;
    }
    addr.parse::<std::net::IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_missing_targets() {
        assert!(TunnelRule::local("127.0.0.1", 8080, "", 80).validate().is_err());
        assert!(TunnelRule::local("127.0.0.1", 8080, "db", 0).validate().is_err());
        assert!(TunnelRule::remote("0.0.0.0", 9000, "", 3000).validate().is_err());
        assert!(TunnelRule::local("127.0.0.1", 8080, "db", 5432).validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_socks_versions() {
        assert!(TunnelRule::dynamic("127.0.0.1", 1080, 6).validate().is_err());
        assert!(TunnelRule::dynamic("127.0.0.1", 1080, 4).validate().is_ok());
        assert!(TunnelRule::dynamic("127.0.0.1", 1080, 5).validate().is_ok());
    }

    #[test]
    fn bind_addr_forced_to_loopback() {
        let rule = TunnelRule::local("0.0.0.0", 8080, "db", 5432);
        assert_eq!(rule.effective_bind_addr().unwrap(), "127.0.0.1");

        let mut limits = TunnelLimits::default();
        limits.allow_remote_connections = true;
        let open = TunnelRule::local("0.0.0.0", 8080, "db", 5432).with_limits(limits);
        assert_eq!(open.effective_bind_addr().unwrap(), "0.0.0.0");

        let loopback = TunnelRule::dynamic("127.0.0.1", 1080, 5);
        assert_eq!(loopback.effective_bind_addr().unwrap(), "127.0.0.1");

        assert!(TunnelRule::remote("0.0.0.0", 9000, "localhost", 3000)
            .effective_bind_addr()
            .is_none());
    }

    #[test]
    fn describe_renders_flag_style() {
        assert_eq!(
            TunnelRule::local("127.0.0.1", 18080, "example.internal", 80).describe(),
            "local 127.0.0.1:18080 -> example.internal:80"
        );
        assert_eq!(
            TunnelRule::dynamic("127.0.0.1", 1080, 5).describe(),
            "socks5 proxy on 127.0.0.1:1080"
        );
    }

    #[test]
    fn rule_serde_round_trip() {
        let rule = TunnelRule::remote("0.0.0.0", 9000, "127.0.0.1", 3000);
        let json = serde_json::to_string(&rule).unwrap();
        assert!(json.contains("\"type\":\"remote\""));
        let back: TunnelRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn limits_defaults_via_serde() {
        let rule: TunnelRule = serde_json::from_str(
            r#"{"type":"local","bind_addr":"127.0.0.1","bind_port":8080,
                "remote_host":"db","remote_port":5432}"#,
        )
        .unwrap();
        assert_eq!(rule.limits().idle_timeout_secs, 300);
        assert_eq!(rule.limits().idle_timeout(), Some(Duration::from_secs(300)));

        let mut zero = TunnelLimits::default();
        zero.idle_timeout_secs = 0;
        assert_eq!(zero.idle_timeout(), None);
    }
}
