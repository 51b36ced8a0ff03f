//! Session manager: the programmatic surface for the API layer
//!
//! Owns the transport pool, the stats registry, and one supervisor per
//! session. Sessions are created `Created` and started explicitly;
//! deleting a session stops it, releases its counters, and drops the
//! pooled transport when no other session shares the key.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::events::SessionEvent;
use super::supervisor::SessionSupervisor;
use super::types::{SessionError, SessionSnapshot};
use crate::config::CoreConfig;
use crate::forwarding::TunnelRule;
use crate::pty::PtySession;
use crate::ssh::auth::{DenyPrompts, PromptHandler};
use crate::ssh::pool::{PoolHandle, TransportPool};
use crate::ssh::transport::TransportConnector;
use crate::ssh::{HostIdentity, SshConnector};
use crate::stats::StatsRegistry;

/// Capacity of the shared event stream before slow subscribers lag.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One stored rule, as handed over by the rule-storage collaborator.
#[derive(Debug, Clone)]
pub struct StoredRule {
    pub identity: HostIdentity,
    pub rule: TunnelRule,
    pub auto_start: bool,
}

/// Where rules live between runs. Persistence itself is out of scope;
/// this is the narrow waist the storage layer plugs into.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list_rules(&self) -> Vec<StoredRule>;
}

/// A PTY session bound to a pooled transport. The pool reference is held
/// for the PTY's lifetime so idle eviction cannot take the transport out
/// from under a live shell.
pub struct ManagedPty {
    pty: PtySession,
    pool: Arc<TransportPool>,
    handle: Option<PoolHandle>,
}

impl ManagedPty {
    /// The underlying PTY: write, subscribe, resize.
    pub fn session(&self) -> &PtySession {
        &self.pty
    }

    /// Close the shell and return the transport to the pool.
    pub async fn close(mut self) {
        self.pty.close().await;
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle).await;
        }
    }
}

pub struct SessionManager {
    config: CoreConfig,
    pool: Arc<TransportPool>,
    stats: Arc<StatsRegistry>,
    sessions: DashMap<String, Arc<SessionSupervisor>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    /// Manager with the production SSH connector and prompts denied
    /// (server-side default).
    pub fn new(config: CoreConfig) -> Self {
        Self::with_prompt_handler(config, Arc::new(DenyPrompts))
    }

    /// Manager with the production connector and a caller-supplied prompt
    /// handler (the CLI installs its terminal prompter here).
    pub fn with_prompt_handler(config: CoreConfig, prompts: Arc<dyn PromptHandler>) -> Self {
        let connector = Arc::new(SshConnector::new(config.ssh.clone(), prompts));
        Self::with_connector(config, connector)
    }

    /// Manager over an arbitrary connector. Tests inject mocks here.
    pub fn with_connector(config: CoreConfig, connector: Arc<dyn TransportConnector>) -> Self {
        let pool = TransportPool::new(config.pool.clone(), connector);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            pool,
            stats: Arc::new(StatsRegistry::new()),
            sessions: DashMap::new(),
            events,
        }
    }

    /// Register a new session binding `identity` to `rule`. The session
    /// starts in `Created`; call [`start_session`](Self::start_session).
    pub fn create_session(
        &self,
        identity: HostIdentity,
        rule: TunnelRule,
    ) -> Result<String, SessionError> {
        rule.validate()?;
        let id = uuid::Uuid::new_v4().to_string();
        let stats = self.stats.register(&id);

        let supervisor = SessionSupervisor::new(
            id.clone(),
            identity,
            rule,
            self.config.ssh.clone(),
            self.pool.clone(),
            stats,
            self.events.clone(),
        );
        self.sessions.insert(id.clone(), supervisor);
        info!("session {} created", id);
        Ok(id)
    }

    pub fn start_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.supervisor(session_id)?.start()
    }

    pub async fn stop_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.supervisor(session_id)?.stop().await;
        Ok(())
    }

    /// Stop and remove a session. When no other session shares the pool
    /// key, the pooled transport is dropped too, returning the process to
    /// its pre-create state.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), SessionError> {
        let supervisor = self.supervisor(session_id)?;
        supervisor.stop().await;

        self.sessions.remove(session_id);
        self.stats.unregister(session_id);

        let key = supervisor.pool_key();
        let shared = self
            .sessions
            .iter()
            .any(|entry| entry.value().pool_key() == key);
        if !shared {
            self.pool.evict(&key).await;
        }
        info!("session {} deleted", session_id);
        Ok(())
    }

    pub fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, SessionError> {
        Ok(self.supervisor(session_id)?.snapshot())
    }

    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Subscribe to status transitions of every session. Slow subscribers
    /// lag and drop old events without stalling any supervisor.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Open an interactive shell over a pooled transport for `identity`.
    /// Shares the same transports as tunnel sessions under the same key.
    pub async fn open_pty(
        &self,
        identity: &HostIdentity,
        term: &str,
        cols: u32,
        rows: u32,
    ) -> Result<ManagedPty, SessionError> {
        let handle = self.pool.acquire(identity).await?;
        let pty = match handle.transport().open_shell(term, cols, rows).await {
            Ok(pty) => pty,
            Err(e) => {
                self.pool.release(handle).await;
                return Err(e.into());
            }
        };
        Ok(ManagedPty {
            pty,
            pool: self.pool.clone(),
            handle: Some(handle),
        })
    }

    pub fn stats_registry(&self) -> Arc<StatsRegistry> {
        self.stats.clone()
    }

    pub fn pool(&self) -> Arc<TransportPool> {
        self.pool.clone()
    }

    /// Create and start a session for every stored rule flagged
    /// auto-start. Per-rule failures are logged and skipped. Returns the
    /// started session ids.
    pub async fn auto_start(&self, store: &dyn RuleStore) -> Vec<String> {
        let mut started = Vec::new();
        for stored in store.list_rules().await {
            if !stored.auto_start {
                continue;
            }
            let description = stored.rule.describe();
            match self.create_session(stored.identity, stored.rule) {
                Ok(id) => match self.start_session(&id) {
                    Ok(()) => started.push(id),
                    Err(e) => warn!("auto-start of {} failed: {}", description, e),
                },
                Err(e) => warn!("auto-start of {} rejected: {}", description, e),
            }
        }
        info!("auto-started {} sessions", started.len());
        started
    }

    /// Stop every session and shut the pool down.
    pub async fn close(&self) {
        let supervisors: Vec<Arc<SessionSupervisor>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for supervisor in supervisors {
            supervisor.stop().await;
        }
        self.pool.shutdown().await;
        info!("session manager closed");
    }

    fn supervisor(&self, session_id: &str) -> Result<Arc<SessionSupervisor>, SessionError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::SessionStatus;
    use crate::ssh::Transport;
    use crate::testing::{ChannelBehavior, MockConnector};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config() -> CoreConfig {
        crate::testing::init_logging();
        let mut config = CoreConfig::default();
        config.ssh.retry_interval_secs = 0;
        config.ssh.max_retries = 3;
        config
    }

    fn identity() -> HostIdentity {
        HostIdentity::new("gw.example.com", 22, "alice").with_password("pw")
    }

    fn local_rule() -> TunnelRule {
        TunnelRule::local("127.0.0.1", 0, "example.internal", 80)
    }

    async fn wait_for_status(manager: &SessionManager, id: &str, status: SessionStatus) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if manager.snapshot(id).unwrap().status == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "session never reached {:?} (currently {:?})",
                status,
                manager.snapshot(id).unwrap().status
            )
        });
    }

    #[tokio::test]
    async fn session_walks_to_active_and_serves_traffic() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        let manager = SessionManager::with_connector(test_config(), connector.clone());

        let mut events = manager.subscribe();

        let port = reserve_port();
        let rule = TunnelRule::local("127.0.0.1", port, "example.internal", 80);
        let id = manager.create_session(identity(), rule).unwrap();
        assert_eq!(manager.snapshot(&id).unwrap().status, SessionStatus::Created);

        manager.start_session(&id).unwrap();
        wait_for_status(&manager, &id, SessionStatus::Active).await;

        // The documented walk, in order.
        let mut walk = Vec::new();
        while walk.len() < 3 {
            walk.push(events.recv().await.unwrap().new_status);
        }
        assert_eq!(
            walk,
            vec![
                SessionStatus::Connecting,
                SessionStatus::Connected,
                SessionStatus::Active
            ]
        );

        // Traffic flows through the echo transport.
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        let mut reply = vec![0u8; 18];
        client.read_exact(&mut reply).await.unwrap();
        drop(client);

        let snapshot = manager.snapshot(&id).unwrap();
        assert_eq!(snapshot.stats.total_connections, 1);
        assert!(snapshot.stats.bytes_sent > 0);
        assert!(snapshot.stats.bytes_received > 0);
        assert!(snapshot.connected_at.is_some());

        manager.stop_session(&id).await.unwrap();
        assert_eq!(manager.snapshot(&id).unwrap().status, SessionStatus::Stopped);
        // Stop is idempotent.
        manager.stop_session(&id).await.unwrap();

        manager.close().await;
    }

    #[tokio::test]
    async fn reconnects_after_transport_loss() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        let manager = SessionManager::with_connector(test_config(), connector.clone());

        let port = reserve_port();
        let rule = TunnelRule::local("127.0.0.1", port, "example.internal", 80);
        let id = manager.create_session(identity(), rule).unwrap();
        manager.start_session(&id).unwrap();
        wait_for_status(&manager, &id, SessionStatus::Active).await;
        assert_eq!(connector.handshake_count(), 1);

        // Inject transport death; the supervisor must come back up.
        connector.latest().kill();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let snap = manager.snapshot(&id).unwrap();
                if snap.status == SessionStatus::Active && snap.stats.reconnect_count == 1 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session never reconnected");
        assert_eq!(connector.handshake_count(), 2);

        // And the tunnel works again after the reconnect.
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        manager.close().await;
    }

    #[tokio::test]
    async fn permanent_error_stops_without_retry() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        connector.fail_auth();
        let manager = SessionManager::with_connector(test_config(), connector.clone());

        let id = manager.create_session(identity(), local_rule()).unwrap();
        manager.start_session(&id).unwrap();
        wait_for_status(&manager, &id, SessionStatus::Stopped).await;

        let snapshot = manager.snapshot(&id).unwrap();
        assert!(snapshot.last_error.unwrap().contains("authentication"));
        assert_eq!(connector.handshake_count(), 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn transient_errors_exhaust_the_retry_budget() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        connector.fail_next(100);
        let mut config = test_config();
        config.ssh.max_retries = 2;
        let manager = SessionManager::with_connector(config, connector.clone());

        let id = manager.create_session(identity(), local_rule()).unwrap();
        manager.start_session(&id).unwrap();
        wait_for_status(&manager, &id, SessionStatus::Stopped).await;

        let snapshot = manager.snapshot(&id).unwrap();
        assert!(snapshot.last_error.unwrap().contains("dial failed"));
        assert_eq!(connector.handshake_count(), 2);
        manager.close().await;
    }

    #[tokio::test]
    async fn two_sessions_share_one_pooled_transport() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        let manager = SessionManager::with_connector(test_config(), connector.clone());

        let a = manager
            .create_session(identity(), TunnelRule::local("127.0.0.1", 0, "svc-a", 80))
            .unwrap();
        let b = manager
            .create_session(identity(), TunnelRule::local("127.0.0.1", 0, "svc-b", 81))
            .unwrap();
        manager.start_session(&a).unwrap();
        manager.start_session(&b).unwrap();
        wait_for_status(&manager, &a, SessionStatus::Active).await;
        wait_for_status(&manager, &b, SessionStatus::Active).await;

        assert_eq!(connector.handshake_count(), 1);
        assert_eq!(manager.pool().len(), 1);
        assert_eq!(manager.pool().ref_count(&identity().pool_key()), Some(2));

        // Stopping one leaves the shared transport live for the other.
        manager.stop_session(&a).await.unwrap();
        assert_eq!(manager.pool().ref_count(&identity().pool_key()), Some(1));
        assert!(connector.latest().is_alive());

        manager.close().await;
    }

    #[tokio::test]
    async fn delete_returns_the_pool_to_its_prior_state() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        let manager = SessionManager::with_connector(test_config(), connector.clone());

        let id = manager.create_session(identity(), local_rule()).unwrap();
        manager.start_session(&id).unwrap();
        wait_for_status(&manager, &id, SessionStatus::Active).await;
        assert_eq!(manager.pool().len(), 1);

        manager.delete_session(&id).await.unwrap();
        assert!(matches!(
            manager.snapshot(&id),
            Err(SessionError::NotFound(_))
        ));
        assert_eq!(manager.pool().len(), 0);
        assert!(manager.stats_registry().get(&id).is_none());

        manager.close().await;
    }

    #[tokio::test]
    async fn invalid_rules_are_rejected_at_create() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        let manager = SessionManager::with_connector(test_config(), connector);

        let bad = TunnelRule::local("127.0.0.1", 0, "", 80);
        assert!(manager.create_session(identity(), bad).is_err());
        assert!(manager.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn start_while_running_is_an_invalid_state() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        let manager = SessionManager::with_connector(test_config(), connector);

        let id = manager.create_session(identity(), local_rule()).unwrap();
        manager.start_session(&id).unwrap();
        wait_for_status(&manager, &id, SessionStatus::Active).await;

        assert!(matches!(
            manager.start_session(&id),
            Err(SessionError::InvalidState { .. })
        ));
        manager.close().await;
    }

    #[tokio::test]
    async fn failed_pty_open_releases_the_pool_handle() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        let manager = SessionManager::with_connector(test_config(), connector.clone());

        // The mock transport has no shell; the acquire must be undone.
        let result = manager.open_pty(&identity(), "xterm-256color", 80, 24).await;
        assert!(result.is_err());
        assert_eq!(manager.pool().ref_count(&identity().pool_key()), Some(0));
        manager.close().await;
    }

    #[tokio::test]
    async fn auto_start_honors_the_flag_and_skips_failures() {
        struct FixedStore(Vec<StoredRule>);

        #[async_trait]
        impl RuleStore for FixedStore {
            async fn list_rules(&self) -> Vec<StoredRule> {
                self.0.clone()
            }
        }

        let connector = MockConnector::new(ChannelBehavior::Echo);
        let manager = SessionManager::with_connector(test_config(), connector);

        let store = FixedStore(vec![
            StoredRule {
                identity: identity(),
                rule: local_rule(),
                auto_start: true,
            },
            StoredRule {
                identity: identity(),
                rule: local_rule(),
                auto_start: false,
            },
            StoredRule {
                identity: identity(),
                // Invalid: rejected and skipped without aborting the rest.
                rule: TunnelRule::local("127.0.0.1", 0, "", 80),
                auto_start: true,
            },
        ]);

        let started = manager.auto_start(&store).await;
        assert_eq!(started.len(), 1);
        assert_eq!(manager.list_sessions().len(), 1);
        manager.close().await;
    }

    /// Grab a free port by binding and immediately dropping a listener.
    fn reserve_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }
}
