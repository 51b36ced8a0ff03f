//! SSH connection establishment
//!
//! `SshConnector` dials the host, runs the handshake, and walks the
//! resolved credential attempts until one authenticates. The russh
//! callback handler enforces the host-key policy and routes
//! server-initiated `forwarded-tcpip` channels to the transport's
//! remote-forward router.

use std::net::ToSocketAddrs;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::{HashAlg, PublicKey};
use russh::Channel;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::auth::{AuthAttempt, AuthResolver, Prompt, PromptHandler};
use super::control::spawn_control;
use super::error::SshError;
use super::identity::{HostIdentity, HostKeyPolicy};
use super::known_hosts::{HostKeyCheck, KnownHostsStore};
use super::transport::{RemoteForwardRouter, SshTransport, Transport, TransportConnector};
use crate::config::SshDefaults;

/// Produces live transports from identities. The production
/// [`TransportConnector`] implementation.
pub struct SshConnector {
    defaults: SshDefaults,
    prompts: Arc<dyn PromptHandler>,
}

impl SshConnector {
    pub fn new(defaults: SshDefaults, prompts: Arc<dyn PromptHandler>) -> Self {
        Self { defaults, prompts }
    }

    async fn authenticate(
        &self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
        attempts: Vec<AuthAttempt>,
    ) -> Result<(), SshError> {
        let total = attempts.len();
        for attempt in attempts {
            let label = format!("{:?}", attempt);
            match self.try_attempt(handle, username, attempt).await {
                Ok(true) => {
                    info!("authenticated as {} via {}", username, label);
                    return Ok(());
                }
                Ok(false) => {
                    debug!("attempt {} rejected by server", label);
                }
                Err(e) => {
                    debug!("attempt {} errored: {}", label, e);
                }
            }
        }
        Err(SshError::AuthFailed(format!(
            "all {} credential attempts rejected",
            total
        )))
    }

    async fn try_attempt(
        &self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
        attempt: AuthAttempt,
    ) -> Result<bool, SshError> {
        match attempt {
            AuthAttempt::Password(password) => {
                let result = handle
                    .authenticate_password(username, &password)
                    .await
                    .map_err(|e| SshError::AuthFailed(e.to_string()))?;
                Ok(result.success())
            }
            AuthAttempt::Key { key, .. } => {
                let result = handle
                    .authenticate_publickey(username, key)
                    .await
                    .map_err(|e| SshError::AuthFailed(e.to_string()))?;
                Ok(result.success())
            }
            AuthAttempt::Agent => self.authenticate_with_agent(handle, username).await,
            AuthAttempt::Interactive => self.authenticate_interactive(handle, username).await,
        }
    }

    /// Offer each agent-held identity until the server accepts one.
    async fn authenticate_with_agent(
        &self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, SshError> {
        let agent_path = std::env::var("SSH_AUTH_SOCK")
            .map_err(|_| SshError::AgentUnavailable("SSH_AUTH_SOCK not set".to_string()))?;

        let stream = tokio::net::UnixStream::connect(&agent_path)
            .await
            .map_err(|e| SshError::AgentUnavailable(format!("connect {}: {}", agent_path, e)))?;

        let mut agent = russh::keys::agent::client::AgentClient::connect(stream);
        let identities = agent
            .request_identities()
            .await
            .map_err(|e| SshError::AgentUnavailable(format!("request identities: {}", e)))?;

        if identities.is_empty() {
            debug!("agent holds no identities");
            return Ok(false);
        }

        for identity in identities {
            let hash_alg = if identity.algorithm().is_rsa() {
                Some(HashAlg::Sha512)
            } else {
                None
            };
            match handle
                .authenticate_publickey_with(username, identity, hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => continue,
                Err(e) => {
                    debug!("agent key rejected: {}", e);
                    continue;
                }
            }
        }
        Ok(false)
    }

    /// Keyboard-interactive: relay server challenges to the prompt handler
    /// until the server decides.
    async fn authenticate_interactive(
        &self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, SshError> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(username, None::<String>)
            .await
            .map_err(|e| SshError::AuthFailed(e.to_string()))?;

        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    let mapped: Vec<Prompt> = prompts
                        .into_iter()
                        .map(|p| Prompt {
                            text: p.prompt,
                            echo: p.echo,
                        })
                        .collect();

                    let Some(answers) = self.prompts.respond(&name, &instructions, &mapped).await
                    else {
                        debug!("prompt handler declined interactive challenge");
                        return Ok(false);
                    };

                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await
                        .map_err(|e| SshError::AuthFailed(e.to_string()))?;
                }
            }
        }
    }
}

#[async_trait]
impl TransportConnector for SshConnector {
    async fn connect(&self, identity: &HostIdentity) -> Result<Arc<dyn Transport>, SshError> {
        let attempts = AuthResolver::resolve(identity)?;
        let addr = format!("{}:{}", identity.host, identity.port);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::DialFailed(format!("resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| SshError::DialFailed(format!("no address for {}", addr)))?;

        info!("connecting to {}", addr);
        let stream = timeout(self.defaults.connect_timeout(), TcpStream::connect(socket_addr))
            .await
            .map_err(|_| SshError::Timeout(format!("dialing {}", addr)))?
            .map_err(|e| SshError::DialFailed(format!("{}: {}", addr, e)))?;

        // The prober drives liveness; russh's own keepalive stays off so a
        // transport death is observed in one place.
        let config = client::Config {
            inactivity_timeout: None,
            ..Default::default()
        };

        let router = Arc::new(RemoteForwardRouter::new());
        let known_hosts = Arc::new(KnownHostsStore::open(identity.known_hosts_file.clone()));
        let policy = identity
            .host_key_policy
            .unwrap_or(self.defaults.host_key_policy);
        let handler = ClientHandler::new(
            identity.host.clone(),
            identity.port,
            policy,
            known_hosts,
            router.clone(),
        );

        let mut handle = timeout(
            self.defaults.connect_timeout(),
            client::connect_stream(Arc::new(config), stream, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("handshake with {}", addr)))?
        .map_err(|e| match e {
            // The handler surfaces host-key failures as SshError already.
            e @ SshError::HostKeyMismatch { .. } | e @ SshError::HostKeyUnknown { .. } => e,
            other => SshError::HandshakeFailed(other.to_string()),
        })?;

        self.authenticate(&mut handle, &identity.username, attempts)
            .await?;

        let transport_id = uuid::Uuid::new_v4().to_string();
        let control = spawn_control(handle, transport_id.clone());
        Ok(SshTransport::start(
            transport_id,
            identity.endpoint(),
            control,
            router,
            self.defaults.keep_alive_interval(),
            self.defaults.keep_alive_failures,
        ))
    }
}

/// russh callback handler: host-key verification and forwarded-tcpip
/// channel routing.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Arc<KnownHostsStore>,
    router: Arc<RemoteForwardRouter>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        policy: HostKeyPolicy,
        known_hosts: Arc<KnownHostsStore>,
        router: Arc<RemoteForwardRouter>,
    ) -> Self {
        Self {
            host,
            port,
            policy,
            known_hosts,
            router,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.policy == HostKeyPolicy::Accept {
            warn!(
                "accepting host key for {}:{} without verification (policy=accept)",
                self.host, self.port
            );
            return Ok(true);
        }

        match self
            .known_hosts
            .check(&self.host, self.port, server_public_key)
        {
            HostKeyCheck::Verified => {
                debug!("host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyCheck::Unknown { fingerprint } => match self.policy {
                HostKeyPolicy::Ask => {
                    info!(
                        "trusting new host {}:{} on first use ({})",
                        self.host, self.port, fingerprint
                    );
                    if let Err(e) =
                        self.known_hosts
                            .record(&self.host, self.port, server_public_key)
                    {
                        warn!("could not persist host key: {}", e);
                    }
                    Ok(true)
                }
                _ => Err(SshError::HostKeyUnknown {
                    host: format!("{}:{}", self.host, self.port),
                    fingerprint,
                }),
            },
            HostKeyCheck::Mismatch {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}: expected {}, got {}",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyMismatch {
                    host: format!("{}:{}", self.host, self.port),
                    expected: expected_fingerprint,
                    actual: actual_fingerprint,
                })
            }
        }
    }

    /// Someone connected to a remote listener we requested; hand the
    /// channel to whichever acceptor registered that binding.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "forwarded-tcpip {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        if !self
            .router
            .deliver(connected_address, connected_port as u16, channel)
            .await
        {
            warn!(
                "no acceptor registered for {}:{}, dropping forwarded connection",
                connected_address, connected_port
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::client::Handler;

    const KEY1: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIJdD7y3aLq454yWBdwLWbieU1ebz9/cu7/QEXn9OIeZJ";
    const KEY2: &str = "AAAAC3NzaC1lZDI1NTE5AAAAILIG2T/B0l0gaqj3puu510tu9N1OkQ4znY3LYuEm5zCF";

    fn handler_with(
        policy: HostKeyPolicy,
        path: std::path::PathBuf,
    ) -> (ClientHandler, Arc<KnownHostsStore>) {
        let store = Arc::new(KnownHostsStore::open(Some(path)));
        let handler = ClientHandler::new(
            "gw.example.com".into(),
            22,
            policy,
            store.clone(),
            Arc::new(RemoteForwardRouter::new()),
        );
        (handler, store)
    }

    #[tokio::test]
    async fn ask_policy_records_on_first_use_then_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let key = russh::keys::parse_public_key_base64(KEY1).unwrap();

        let (mut handler, store) = handler_with(HostKeyPolicy::Ask, path.clone());
        assert!(handler.check_server_key(&key).await.unwrap());
        assert_eq!(
            store.check("gw.example.com", 22, &key),
            crate::ssh::known_hosts::HostKeyCheck::Verified
        );

        // A second connection sees the recorded key.
        let (mut again, _) = handler_with(HostKeyPolicy::Ask, path.clone());
        assert!(again.check_server_key(&key).await.unwrap());

        // A changed key fails permanently, even under ask.
        let other = russh::keys::parse_public_key_base64(KEY2).unwrap();
        let (mut changed, _) = handler_with(HostKeyPolicy::Ask, path);
        let err = changed.check_server_key(&other).await.unwrap_err();
        assert!(matches!(err, SshError::HostKeyMismatch { .. }));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn strict_policy_rejects_unknown_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let key = russh::keys::parse_public_key_base64(KEY1).unwrap();

        let (mut handler, _) =
            handler_with(HostKeyPolicy::Strict, dir.path().join("known_hosts"));
        let err = handler.check_server_key(&key).await.unwrap_err();
        assert!(matches!(err, SshError::HostKeyUnknown { .. }));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn accept_policy_takes_anything_without_recording() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let key = russh::keys::parse_public_key_base64(KEY1).unwrap();

        let (mut handler, store) = handler_with(HostKeyPolicy::Accept, path);
        assert!(handler.check_server_key(&key).await.unwrap());
        assert!(matches!(
            store.check("gw.example.com", 22, &key),
            crate::ssh::known_hosts::HostKeyCheck::Unknown { .. }
        ));
    }
}
