//! Tunnel manager: one rule's data plane on one transport
//!
//! Binds the rule's acceptor (a TCP listener, or a listener on the SSH
//! peer), admits connections under the rule's concurrency cap, opens a
//! channel per connection, and splices. `stop()` closes the acceptor so
//! nothing new is admitted, aborts the splicers, and waits for the active
//! count to drain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::rule::{TunnelLimits, TunnelRule};
use super::socks::{self, SocksReply, SocksVersion};
use super::splice::splice;
use super::TunnelError;
use crate::ssh::transport::{Transport, TunnelStream};
use crate::stats::SessionStats;

/// Tunnel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Bound on how long `stop()` waits for splicers to drain.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TunnelManager {
    rule: TunnelRule,
    transport: Arc<dyn Transport>,
    stats: Arc<SessionStats>,
    state: parking_lot::RwLock<TunnelState>,
    /// Fans out to the acceptor loop and every splicer.
    stop_tx: broadcast::Sender<()>,
    /// Fatal acceptor exits, surfaced to the supervisor via `fault()`.
    fault_tx: mpsc::Sender<TunnelError>,
    fault_rx: tokio::sync::Mutex<mpsc::Receiver<TunnelError>>,
    /// Actual local bind (Local/Dynamic rules).
    bound_addr: parking_lot::Mutex<Option<SocketAddr>>,
    /// Actual peer-side port (Remote rules).
    remote_port: parking_lot::Mutex<Option<u16>>,
}

impl TunnelManager {
    pub fn new(rule: TunnelRule, transport: Arc<dyn Transport>, stats: Arc<SessionStats>) -> Self {
        let (stop_tx, _) = broadcast::channel(4);
        let (fault_tx, fault_rx) = mpsc::channel(4);
        Self {
            rule,
            transport,
            stats,
            state: parking_lot::RwLock::new(TunnelState::Created),
            stop_tx,
            fault_tx,
            fault_rx: tokio::sync::Mutex::new(fault_rx),
            bound_addr: parking_lot::Mutex::new(None),
            remote_port: parking_lot::Mutex::new(None),
        }
    }

    pub fn state(&self) -> TunnelState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == TunnelState::Running
    }

    /// Where the local listener actually bound (after port-0 resolution).
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    /// Which port the peer actually bound for a Remote rule.
    pub fn remote_bound_port(&self) -> Option<u16> {
        *self.remote_port.lock()
    }

    pub fn rule(&self) -> &TunnelRule {
        &self.rule
    }

    /// Bind the rule's acceptor and start admitting connections.
    pub async fn start(&self) -> Result<(), TunnelError> {
        {
            let mut state = self.state.write();
            if *state != TunnelState::Created {
                return Err(TunnelError::AlreadyStarted);
            }
            *state = TunnelState::Starting;
        }
        self.rule.validate()?;

        let result = match self.rule.clone() {
            TunnelRule::Local {
                bind_port,
                remote_host,
                remote_port,
                limits,
                ..
            } => {
                self.start_local(bind_port, remote_host, remote_port, limits)
                    .await
            }
            TunnelRule::Dynamic {
                bind_port,
                socks_version,
                limits,
                ..
            } => {
                // validate() has already vetted the version.
                let version = SocksVersion::from_rule(socks_version)
                    .ok_or_else(|| TunnelError::InvalidRule("bad socks version".into()))?;
                self.start_dynamic(bind_port, version, limits).await
            }
            TunnelRule::Remote {
                remote_bind_addr,
                remote_bind_port,
                local_host,
                local_port,
                limits,
            } => {
                self.start_remote(
                    remote_bind_addr,
                    remote_bind_port,
                    local_host,
                    local_port,
                    limits,
                )
                .await
            }
        };

        match result {
            Ok(()) => {
                *self.state.write() = TunnelState::Running;
                info!("tunnel running: {}", self.rule.describe());
                Ok(())
            }
            Err(e) => {
                *self.state.write() = TunnelState::Stopped;
                Err(e)
            }
        }
    }

    async fn bind_listener(&self, bind_port: u16) -> Result<(TcpListener, SocketAddr), TunnelError> {
        // effective_bind_addr is Some for Local/Dynamic by construction.
        let bind_addr = self.rule.effective_bind_addr().unwrap_or_default();
        let addr = format!("{}:{}", bind_addr, bind_port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            let reason = match e.kind() {
                std::io::ErrorKind::AddrInUse => "address already in use".to_string(),
                std::io::ErrorKind::PermissionDenied => {
                    "permission denied (privileged port?)".to_string()
                }
                std::io::ErrorKind::AddrNotAvailable => "address not available".to_string(),
                _ => e.to_string(),
            };
            TunnelError::ListenFailed { addr: addr.clone(), reason }
        })?;

        let bound = listener
            .local_addr()
            .map_err(|e| TunnelError::ListenFailed {
                addr,
                reason: e.to_string(),
            })?;
        *self.bound_addr.lock() = Some(bound);
        Ok((listener, bound))
    }

    async fn start_local(
        &self,
        bind_port: u16,
        remote_host: String,
        remote_port: u16,
        limits: TunnelLimits,
    ) -> Result<(), TunnelError> {
        let (listener, bound) = self.bind_listener(bind_port).await?;
        info!(
            "local forward listening on {} -> {}:{}",
            bound, remote_host, remote_port
        );

        let transport = self.transport.clone();
        let stats = self.stats.clone();
        let stop_tx = self.stop_tx.clone();
        tokio::spawn(async move {
            let mut stop_rx = stop_tx.subscribe();
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                error!("accept failed on {}: {}", bound, e);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                continue;
                            }
                        };
                        if !admit(&stats, &limits) {
                            debug!("rejecting {} (connection cap reached)", peer);
                            continue;
                        }
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("set_nodelay: {}", e);
                        }

                        let transport = transport.clone();
                        let stats = stats.clone();
                        let host = remote_host.clone();
                        let stop_rx = stop_tx.subscribe();
                        let idle = limits.idle_timeout();
                        tokio::spawn(async move {
                            match transport.open_direct_channel(&host, remote_port).await {
                                Ok(channel) => {
                                    splice(stream, channel, stats.clone(), idle, stop_rx).await;
                                }
                                Err(e) => {
                                    debug!("channel to {}:{} failed: {}", host, remote_port, e);
                                    stats.connection_failed();
                                }
                            }
                            stats.connection_closed();
                        });
                    }
                }
            }
            debug!("local acceptor on {} exited", bound);
        });
        Ok(())
    }

    async fn start_dynamic(
        &self,
        bind_port: u16,
        version: SocksVersion,
        limits: TunnelLimits,
    ) -> Result<(), TunnelError> {
        let (listener, bound) = self.bind_listener(bind_port).await?;
        info!("socks proxy listening on {} ({:?})", bound, version);

        let transport = self.transport.clone();
        let stats = self.stats.clone();
        let stop_tx = self.stop_tx.clone();
        tokio::spawn(async move {
            let mut stop_rx = stop_tx.subscribe();
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                error!("accept failed on {}: {}", bound, e);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                continue;
                            }
                        };
                        if !admit(&stats, &limits) {
                            debug!("rejecting {} (connection cap reached)", peer);
                            continue;
                        }
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("set_nodelay: {}", e);
                        }

                        let transport = transport.clone();
                        let stats = stats.clone();
                        let stop_rx = stop_tx.subscribe();
                        let idle = limits.idle_timeout();
                        tokio::spawn(async move {
                            if let Err(e) = serve_socks(
                                stream, version, bound, transport, stats.clone(), idle, stop_rx,
                            )
                            .await
                            {
                                debug!("socks connection from {} failed: {}", peer, e);
                                stats.connection_failed();
                            }
                            stats.connection_closed();
                        });
                    }
                }
            }
            debug!("socks acceptor on {} exited", bound);
        });
        Ok(())
    }

    async fn start_remote(
        &self,
        remote_bind_addr: String,
        remote_bind_port: u16,
        local_host: String,
        local_port: u16,
        limits: TunnelLimits,
    ) -> Result<(), TunnelError> {
        let mut acceptor = self
            .transport
            .listen_remote(&remote_bind_addr, remote_bind_port)
            .await?;
        let bound_port = acceptor.bound_port();
        *self.remote_port.lock() = Some(bound_port);
        info!(
            "remote forward {}:{} -> {}:{}",
            remote_bind_addr, bound_port, local_host, local_port
        );

        let stats = self.stats.clone();
        let stop_tx = self.stop_tx.clone();
        let fault_tx = self.fault_tx.clone();
        tokio::spawn(async move {
            let mut stop_rx = stop_tx.subscribe();
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        acceptor.close().await;
                        break;
                    }
                    incoming = acceptor.accept() => {
                        let Some(stream) = incoming else {
                            // The peer's listener is gone; the supervisor
                            // decides whether to reconnect.
                            warn!("remote listener {}:{} lost", remote_bind_addr, bound_port);
                            let _ = fault_tx.send(TunnelError::RemoteListenerLost).await;
                            break;
                        };
                        if !admit(&stats, &limits) {
                            debug!("rejecting remote connection (cap reached)");
                            continue;
                        }

                        let stats = stats.clone();
                        let target = format!("{}:{}", local_host, local_port);
                        let stop_rx = stop_tx.subscribe();
                        let idle = limits.idle_timeout();
                        let connect_timeout = limits.connect_timeout();
                        tokio::spawn(async move {
                            match dial_local(&target, connect_timeout).await {
                                Ok(local) => {
                                    // The dialed socket is the client side
                                    // here: bytes toward the peer count as
                                    // sent.
                                    splice(local, stream, stats.clone(), idle, stop_rx).await;
                                }
                                Err(e) => {
                                    debug!("dial {} failed: {}", target, e);
                                    stats.connection_failed();
                                }
                            }
                            stats.connection_closed();
                        });
                    }
                }
            }
            debug!("remote acceptor exited");
        });
        Ok(())
    }

    /// A fatal error from the acceptor, if one ever happens. Pends forever
    /// otherwise, so it is safe to select against.
    pub async fn fault(&self) -> TunnelError {
        let mut rx = self.fault_rx.lock().await;
        match rx.recv().await {
            Some(e) => e,
            None => std::future::pending().await,
        }
    }

    /// Stop accepting, abort splicers, and wait for the drain. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            match *state {
                TunnelState::Stopped | TunnelState::Stopping => return,
                TunnelState::Created => {
                    *state = TunnelState::Stopped;
                    return;
                }
                _ => *state = TunnelState::Stopping,
            }
        }
        info!("stopping tunnel: {}", self.rule.describe());

        // Acceptors drop their listeners on receipt; splicers close both
        // sides and return.
        let _ = self.stop_tx.send(());

        let deadline = tokio::time::Instant::now() + STOP_DRAIN_TIMEOUT;
        while self.stats.active() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "timeout draining {} active connections",
                    self.stats.active()
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        *self.state.write() = TunnelState::Stopped;
        info!("tunnel stopped: {}", self.rule.describe());
    }
}

/// Admission under the per-rule cap. Brackets the connection in the stats
/// when admitted.
fn admit(stats: &SessionStats, limits: &TunnelLimits) -> bool {
    let cap = limits.max_concurrent_connections;
    if cap > 0 && stats.active() >= cap {
        stats.connection_rejected();
        return false;
    }
    stats.connection_opened();
    true
}

async fn dial_local(target: &str, connect_timeout: Duration) -> Result<TcpStream, TunnelError> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(target))
        .await
        .map_err(|_| TunnelError::Ssh(crate::ssh::SshError::Timeout(format!("dial {}", target))))?
        .map_err(|e| {
            TunnelError::Ssh(crate::ssh::SshError::DialFailed(format!(
                "{}: {}",
                target, e
            )))
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        warn!("set_nodelay: {}", e);
    }
    Ok(stream)
}

/// One SOCKS connection: negotiate, open the channel, reply, splice.
async fn serve_socks(
    mut stream: TcpStream,
    version: SocksVersion,
    bound: SocketAddr,
    transport: Arc<dyn Transport>,
    stats: Arc<SessionStats>,
    idle: Option<Duration>,
    stop_rx: broadcast::Receiver<()>,
) -> Result<(), TunnelError> {
    let request = socks::negotiate(&mut stream, version).await?;

    let channel: TunnelStream = match transport
        .open_direct_channel(&request.host, request.port)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            debug!(
                "socks target {}:{} unreachable: {}",
                request.host, request.port, e
            );
            let _ = socks::reply_error(&mut stream, version, SocksReply::HostUnreachable).await;
            return Err(e.into());
        }
    };

    socks::reply_success(&mut stream, version, bound)
        .await
        .map_err(|e| TunnelError::Ssh(crate::ssh::SshError::Io(e)))?;

    debug!("socks tunnel to {}:{} established", request.host, request.port);
    splice(stream, channel, stats, idle, stop_rx).await;
    Ok(())
}
