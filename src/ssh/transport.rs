//! The transport seam
//!
//! [`Transport`] is the capability surface the data plane consumes: open a
//! direct channel, listen on the peer, open a shell, probe, close. The
//! production implementation [`SshTransport`] wraps one authenticated SSH
//! connection, keeps it alive with a background prober, and broadcasts a
//! dead signal when liveness is lost. Dead is terminal.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use russh::client::Msg;
use russh::Channel;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::control::{ProbeOutcome, TransportControl};
use super::error::SshError;
use super::identity::HostIdentity;
use crate::pty::PtySession;

/// A bidirectional byte stream carried over the transport.
pub trait StreamLike: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamLike for T {}

/// Boxed channel stream: a russh channel in production, an in-memory
/// duplex in tests.
pub type TunnelStream = Box<dyn StreamLike>;

/// One live, authenticated connection capable of carrying many channels.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a direct-tcpip channel toward `host:port`.
    async fn open_direct_channel(&self, host: &str, port: u16) -> Result<TunnelStream, SshError>;

    /// Ask the peer to listen on `bind_addr:bind_port`; yielded streams are
    /// connections accepted by the peer. Port 0 binds an ephemeral port,
    /// reported through [`RemoteAcceptor::bound_port`].
    async fn listen_remote(
        &self,
        bind_addr: &str,
        bind_port: u16,
    ) -> Result<RemoteAcceptor, SshError>;

    /// Allocate a PTY and start a shell.
    async fn open_shell(&self, term: &str, cols: u32, rows: u32) -> Result<PtySession, SshError>;

    /// One keepalive round-trip; false when the peer did not answer.
    async fn probe(&self) -> bool;

    /// Tear the connection down. All outstanding channels observe EOF.
    async fn close(&self);

    fn is_alive(&self) -> bool;

    /// Fires once when the transport dies (probe failures, peer loss, or
    /// explicit close).
    fn subscribe_dead(&self) -> broadcast::Receiver<()>;
}

/// Creates transports for the pool. Production uses
/// [`crate::ssh::SshConnector`]; tests substitute counting mocks.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, identity: &HostIdentity) -> Result<Arc<dyn Transport>, SshError>;
}

/// Routes server-opened forwarded-tcpip channels to the acceptor that
/// requested the binding. One router per transport.
pub struct RemoteForwardRouter {
    routes: DashMap<(String, u16), mpsc::Sender<TunnelStream>>,
}

impl RemoteForwardRouter {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    fn register(&self, addr: &str, port: u16, tx: mpsc::Sender<TunnelStream>) {
        self.routes.insert((addr.to_string(), port), tx);
    }

    fn unregister(&self, addr: &str, port: u16) {
        self.routes.remove(&(addr.to_string(), port));
    }

    /// Dropping every sender ends the acceptors with end-of-stream.
    fn clear(&self) {
        self.routes.clear();
    }

    /// Hand an incoming channel to the matching acceptor. Falls back to a
    /// port-only match because some servers report the connected address
    /// differently from the requested binding.
    pub(crate) async fn deliver(&self, addr: &str, port: u16, channel: Channel<Msg>) -> bool {
        let tx = self
            .routes
            .get(&(addr.to_string(), port))
            .map(|e| e.value().clone())
            .or_else(|| {
                self.routes
                    .iter()
                    .find(|e| e.key().1 == port)
                    .map(|e| e.value().clone())
            });

        match tx {
            Some(tx) => tx
                .send(Box::new(channel.into_stream()) as TunnelStream)
                .await
                .is_ok(),
            None => false,
        }
    }
}

impl Default for RemoteForwardRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Yields connections accepted by the peer for one remote binding.
pub struct RemoteAcceptor {
    bind_addr: String,
    bound_port: u16,
    incoming: mpsc::Receiver<TunnelStream>,
    canceller: Option<(TransportControl, Arc<RemoteForwardRouter>)>,
}

impl RemoteAcceptor {
    /// Build an acceptor fed by `incoming`; used by mock transports too.
    pub(crate) fn new(
        bind_addr: String,
        bound_port: u16,
        incoming: mpsc::Receiver<TunnelStream>,
        canceller: Option<(TransportControl, Arc<RemoteForwardRouter>)>,
    ) -> Self {
        Self {
            bind_addr,
            bound_port,
            incoming,
            canceller,
        }
    }

    /// The port the peer actually bound.
    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    /// Next incoming stream; `None` once the listener is gone (peer closed
    /// it, or the transport died).
    pub async fn accept(&mut self) -> Option<TunnelStream> {
        self.incoming.recv().await
    }

    /// Cancel the remote listener.
    pub async fn close(mut self) {
        if let Some((control, router)) = self.canceller.take() {
            router.unregister(&self.bind_addr, self.bound_port);
            if let Err(e) = control
                .cancel_tcpip_forward(&self.bind_addr, self.bound_port as u32)
                .await
            {
                debug!(
                    "cancel remote listener {}:{}: {}",
                    self.bind_addr, self.bound_port, e
                );
            }
        }
    }
}

/// Production transport over russh.
pub struct SshTransport {
    id: String,
    endpoint: String,
    control: TransportControl,
    router: Arc<RemoteForwardRouter>,
    alive: AtomicBool,
    dead_tx: broadcast::Sender<()>,
    prober: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SshTransport {
    /// Wrap an authenticated connection and start the liveness prober.
    pub fn start(
        id: String,
        endpoint: String,
        control: TransportControl,
        router: Arc<RemoteForwardRouter>,
        keep_alive_interval: Duration,
        keep_alive_failures: u32,
    ) -> Arc<Self> {
        let (dead_tx, _) = broadcast::channel(4);
        let transport = Arc::new(Self {
            id,
            endpoint,
            control,
            router,
            alive: AtomicBool::new(true),
            dead_tx,
            prober: parking_lot::Mutex::new(None),
        });

        let prober = tokio::spawn(Self::probe_loop(
            Arc::downgrade(&transport),
            transport.control.clone(),
            keep_alive_interval,
            keep_alive_failures,
        ));
        *transport.prober.lock() = Some(prober);
        transport
    }

    async fn probe_loop(
        transport: std::sync::Weak<SshTransport>,
        control: TransportControl,
        interval: Duration,
        max_failures: u32,
    ) {
        let mut closed_rx = control.subscribe_closed();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh connection
        // is not probed during setup.
        ticker.tick().await;

        let failures = AtomicU32::new(0);
        loop {
            tokio::select! {
                // An Err here means the owner task vanished without
                // latching; either way the link is gone.
                _ = async {
                    while !*closed_rx.borrow() {
                        if closed_rx.changed().await.is_err() {
                            break;
                        }
                    }
                } => {
                    if let Some(t) = transport.upgrade() {
                        info!("transport {} connection closed", t.id);
                        t.mark_dead().await;
                    }
                    return;
                }
                _ = ticker.tick() => {
                    let Some(t) = transport.upgrade() else { return };
                    if !t.is_alive() {
                        return;
                    }
                    match control.probe().await {
                        ProbeOutcome::Answered => {
                            failures.store(0, Ordering::Relaxed);
                        }
                        ProbeOutcome::Unanswered => {
                            let n = failures.fetch_add(1, Ordering::Relaxed) + 1;
                            warn!("transport {} probe unanswered ({}/{})", t.id, n, max_failures);
                            if n >= max_failures {
                                t.mark_dead().await;
                                return;
                            }
                        }
                        ProbeOutcome::ConnectionLost => {
                            warn!("transport {} lost its connection", t.id);
                            t.mark_dead().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Transition to Dead: idempotent, terminal.
    async fn mark_dead(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            info!("transport {} ({}) is dead", self.id, self.endpoint);
            self.router.clear();
            let _ = self.dead_tx.send(());
            self.control.disconnect().await;
        }
    }

    fn ensure_alive(&self) -> Result<(), SshError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(SshError::TransportDead)
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_direct_channel(&self, host: &str, port: u16) -> Result<TunnelStream, SshError> {
        self.ensure_alive()?;
        let channel = self
            .control
            .open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await?;
        debug!("transport {} opened channel to {}:{}", self.id, host, port);
        Ok(Box::new(channel.into_stream()))
    }

    async fn listen_remote(
        &self,
        bind_addr: &str,
        bind_port: u16,
    ) -> Result<RemoteAcceptor, SshError> {
        self.ensure_alive()?;
        let bound = self
            .control
            .tcpip_forward(bind_addr, bind_port as u32)
            .await? as u16;

        let (tx, rx) = mpsc::channel(16);
        self.router.register(bind_addr, bound, tx);
        info!(
            "transport {} remote listener on {}:{} (requested {})",
            self.id, bind_addr, bound, bind_port
        );

        Ok(RemoteAcceptor::new(
            bind_addr.to_string(),
            bound,
            rx,
            Some((self.control.clone(), self.router.clone())),
        ))
    }

    async fn open_shell(&self, term: &str, cols: u32, rows: u32) -> Result<PtySession, SshError> {
        self.ensure_alive()?;
        let channel = self.control.open_session().await?;
        channel
            .request_pty(false, term, cols, rows, 0, 0, &[])
            .await
            .map_err(|e| SshError::ChannelOpenFailed(format!("pty request: {}", e)))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelOpenFailed(format!("shell request: {}", e)))?;
        Ok(PtySession::spawn(channel, term, cols, rows))
    }

    async fn probe(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        matches!(self.control.probe().await, ProbeOutcome::Answered)
    }

    async fn close(&self) {
        if let Some(prober) = self.prober.lock().take() {
            prober.abort();
        }
        self.mark_dead().await;
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn subscribe_dead(&self) -> broadcast::Receiver<()> {
        self.dead_tx.subscribe()
    }
}
