//! In-memory transport doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};

use crate::pty::PtySession;
use crate::ssh::transport::{RemoteAcceptor, Transport, TransportConnector, TunnelStream};
use crate::ssh::{HostIdentity, SshError};

/// Opt-in tracing for test runs (`RUST_LOG=debug cargo test -- --nocapture`).
pub(crate) fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// What a mock channel does with its far end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelBehavior {
    /// The far side echoes everything back.
    Echo,
    /// The far side stays open and silent (connections stay active).
    Hold,
    /// Channel opens fail.
    Fail,
}

/// A transport whose channels are in-memory pipes.
pub(crate) struct MockTransport {
    alive: AtomicBool,
    dead_tx: broadcast::Sender<()>,
    behavior: ChannelBehavior,
    /// Targets of every opened channel.
    pub(crate) opened: parking_lot::Mutex<Vec<(String, u16)>>,
    /// Far ends parked by Hold channels.
    held: parking_lot::Mutex<Vec<tokio::io::DuplexStream>>,
    /// Feed for streams "accepted by the peer" after listen_remote.
    pub(crate) remote_feed: parking_lot::Mutex<Option<mpsc::Sender<TunnelStream>>>,
}

impl MockTransport {
    pub(crate) fn new(behavior: ChannelBehavior) -> Arc<Self> {
        let (dead_tx, _) = broadcast::channel(4);
        Arc::new(Self {
            alive: AtomicBool::new(true),
            dead_tx,
            behavior,
            opened: parking_lot::Mutex::new(Vec::new()),
            held: parking_lot::Mutex::new(Vec::new()),
            remote_feed: parking_lot::Mutex::new(None),
        })
    }

    /// Simulate transport loss.
    pub(crate) fn kill(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            *self.remote_feed.lock() = None;
            let _ = self.dead_tx.send(());
        }
    }

    /// Wait for a remote listener to be registered and return its feed.
    pub(crate) async fn remote_feed(&self) -> mpsc::Sender<TunnelStream> {
        loop {
            if let Some(tx) = self.remote_feed.lock().clone() {
                return tx;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_direct_channel(&self, host: &str, port: u16) -> Result<TunnelStream, SshError> {
        if !self.is_alive() {
            return Err(SshError::TransportDead);
        }
        self.opened.lock().push((host.to_string(), port));

        match self.behavior {
            ChannelBehavior::Fail => Err(SshError::ChannelOpenFailed(format!(
                "mock refuses {}:{}",
                host, port
            ))),
            ChannelBehavior::Echo => {
                let (near, far) = tokio::io::duplex(64 * 1024);
                tokio::spawn(async move {
                    let (mut rd, mut wr) = tokio::io::split(far);
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match rd.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if wr.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = wr.shutdown().await;
                });
                Ok(Box::new(near))
            }
            ChannelBehavior::Hold => {
                let (near, far) = tokio::io::duplex(64 * 1024);
                self.held.lock().push(far);
                Ok(Box::new(near))
            }
        }
    }

    async fn listen_remote(
        &self,
        bind_addr: &str,
        bind_port: u16,
    ) -> Result<RemoteAcceptor, SshError> {
        if !self.is_alive() {
            return Err(SshError::TransportDead);
        }
        let bound = if bind_port == 0 { 49152 } else { bind_port };
        let (tx, rx) = mpsc::channel(16);
        *self.remote_feed.lock() = Some(tx);
        Ok(RemoteAcceptor::new(bind_addr.to_string(), bound, rx, None))
    }

    async fn open_shell(
        &self,
        _term: &str,
        _cols: u32,
        _rows: u32,
    ) -> Result<PtySession, SshError> {
        Err(SshError::Protocol("mock transport has no shell".into()))
    }

    async fn probe(&self) -> bool {
        self.is_alive()
    }

    async fn close(&self) {
        self.kill();
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn subscribe_dead(&self) -> broadcast::Receiver<()> {
        self.dead_tx.subscribe()
    }
}

/// Connector handing out [`MockTransport`]s; counts handshakes and can
/// fail or stall the first attempts.
pub(crate) struct MockConnector {
    behavior: ChannelBehavior,
    pub(crate) handshakes: AtomicU32,
    delay: Duration,
    fail_first: AtomicU32,
    fail_auth: AtomicBool,
    pub(crate) created: parking_lot::Mutex<Vec<Arc<MockTransport>>>,
}

impl MockConnector {
    pub(crate) fn new(behavior: ChannelBehavior) -> Arc<Self> {
        Self::with_delay(behavior, Duration::ZERO)
    }

    pub(crate) fn with_delay(behavior: ChannelBehavior, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            handshakes: AtomicU32::new(0),
            delay,
            fail_first: AtomicU32::new(0),
            fail_auth: AtomicBool::new(false),
            created: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Make the next `n` connects fail with a transient dial error.
    pub(crate) fn fail_next(&self, n: u32) {
        self.fail_first.store(n, Ordering::SeqCst);
    }

    /// Make every connect fail with a permanent authentication error.
    pub(crate) fn fail_auth(&self) {
        self.fail_auth.store(true, Ordering::SeqCst);
    }

    pub(crate) fn handshake_count(&self) -> u32 {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub(crate) fn latest(&self) -> Arc<MockTransport> {
        self.created.lock().last().cloned().expect("no transport created yet")
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self, identity: &HostIdentity) -> Result<Arc<dyn Transport>, SshError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.handshakes.fetch_add(1, Ordering::SeqCst);

        if self.fail_auth.load(Ordering::SeqCst) {
            return Err(SshError::AuthFailed("mock rejects credentials".into()));
        }

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(SshError::DialFailed(format!(
                "mock refuses {}",
                identity.endpoint()
            )));
        }

        let transport = MockTransport::new(self.behavior);
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}
