//! Single-owner task for the russh `Handle`
//!
//! Exactly one task owns the connection; everything else holds a cloneable
//! [`TransportControl`] and exchanges request/reply pairs with it over an
//! mpsc queue. This keeps the handle out of `Arc<Mutex<_>>`, so no lock is
//! ever held across an `.await` on the SSH connection.
//!
//! The owner task talks to the connection through the [`ConnectionDriver`]
//! seam. Production drives a real `russh::client::Handle`; tests drive a
//! scripted double, which is what makes the teardown and cleanup paths
//! below testable without a peer.
//!
//! Teardown contract: when the owner exits (shutdown request, or every
//! control dropped) it latches the closed signal and drops the request
//! queue. Requests still in flight lose their reply channel, which every
//! caller observes as `TransportDead`; no reply is ever silently lost.

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Outcome of a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The peer answered the keepalive.
    Answered,
    /// No answer inside the window. May be congestion; the prober counts
    /// these before declaring death.
    Unanswered,
    /// The keepalive could not be exchanged at all. A protocol error on
    /// this path means the connection is unusable, so there is no soft
    /// retry for it.
    ConnectionLost,
}

/// How long the owner waits for a keepalive reply before giving the
/// request up as unanswered. Bounds the owner loop, not just the caller.
const KEEPALIVE_REPLY_WINDOW: std::time::Duration = std::time::Duration::from_secs(5);

/// Request queue depth. Kept small: a backlog here means the connection
/// is already not keeping up, and backpressuring callers is the honest
/// signal.
const REQUEST_QUEUE: usize = 32;

type ChannelResult = Result<Channel<Msg>, russh::Error>;

/// The operations the owner task needs from the underlying connection.
///
/// `russh::client::Handle` is the production driver; tests substitute a
/// scripted one to exercise queueing, teardown, and cleanup.
#[async_trait]
pub(crate) trait ConnectionDriver: Send {
    async fn open_session(&mut self) -> ChannelResult;
    async fn open_direct(&mut self, target: (&str, u32), origin: (&str, u32)) -> ChannelResult;
    /// Returns the port the peer actually bound.
    async fn start_forward(&mut self, address: &str, port: u32) -> Result<u32, russh::Error>;
    async fn stop_forward(&mut self, address: &str, port: u32) -> Result<(), russh::Error>;
    async fn keepalive(&mut self) -> Result<(), russh::Error>;
    async fn close(&mut self);
}

#[async_trait]
impl ConnectionDriver for Handle<ClientHandler> {
    async fn open_session(&mut self) -> ChannelResult {
        self.channel_open_session().await
    }

    async fn open_direct(&mut self, target: (&str, u32), origin: (&str, u32)) -> ChannelResult {
        self.channel_open_direct_tcpip(target.0, target.1, origin.0, origin.1)
            .await
    }

    async fn start_forward(&mut self, address: &str, port: u32) -> Result<u32, russh::Error> {
        self.tcpip_forward(address, port).await
    }

    async fn stop_forward(&mut self, address: &str, port: u32) -> Result<(), russh::Error> {
        self.cancel_tcpip_forward(address, port).await
    }

    async fn keepalive(&mut self) -> Result<(), russh::Error> {
        self.send_keepalive(true).await
    }

    async fn close(&mut self) {
        let _ = self
            .disconnect(russh::Disconnect::ByApplication, "transport closed", "en")
            .await;
    }
}

enum Request {
    OpenSession {
        reply: oneshot::Sender<ChannelResult>,
    },
    OpenDirect {
        target: (String, u32),
        origin: (String, u32),
        reply: oneshot::Sender<ChannelResult>,
    },
    StartForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<Result<u32, russh::Error>>,
    },
    StopForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<Result<(), russh::Error>>,
    },
    Probe {
        reply: oneshot::Sender<ProbeOutcome>,
    },
    Shutdown,
}

/// Cloneable request endpoint for one SSH connection.
///
/// Any holder has full control of the connection: it can open channels,
/// request forwards, or shut it down. Controls never cross a process
/// boundary; the trust boundary is the crate API.
#[derive(Clone)]
pub struct TransportControl {
    requests: mpsc::Sender<Request>,
    /// Latched true when the owner task exits. A watch (not a broadcast)
    /// so subscribers arriving after the closure still observe it.
    closed: watch::Receiver<bool>,
}

impl TransportControl {
    /// Receiver over the closed latch; completes `wait_for(|c| *c)` once
    /// the owner task has exited, no matter when the caller subscribed.
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    /// Whether the owner task is still there to take requests.
    pub fn is_connected(&self) -> bool {
        // The latch covers an orderly exit; the queue check covers the
        // task dying without one.
        !*self.closed.borrow() && !self.requests.is_closed()
    }

    /// Queue one request and wait for its reply. A dropped reply channel
    /// means the owner tore down with the request in flight.
    async fn roundtrip<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(request(reply_tx))
            .await
            .map_err(|_| SshError::TransportDead)?;
        reply_rx.await.map_err(|_| SshError::TransportDead)
    }

    /// Open a session channel (shell / PTY).
    pub async fn open_session(&self) -> Result<Channel<Msg>, SshError> {
        self.roundtrip(|reply| Request::OpenSession { reply })
            .await?
            .map_err(|e| SshError::ChannelOpenFailed(e.to_string()))
    }

    /// Open a direct-tcpip channel toward `host:port`.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let target = (host.to_string(), port);
        let origin = (originator_host.to_string(), originator_port);
        self.roundtrip(|reply| Request::OpenDirect {
            target,
            origin,
            reply,
        })
        .await?
        .map_err(|e| SshError::ChannelOpenFailed(e.to_string()))
    }

    /// Ask the peer to listen on `address:port`. Returns the bound port,
    /// which differs from the request when port 0 was asked for.
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let address = address.to_string();
        self.roundtrip(|reply| Request::StartForward {
            address,
            port,
            reply,
        })
        .await?
        .map_err(|e| SshError::Protocol(e.to_string()))
    }

    /// Cancel a previously requested remote listener.
    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let address = address.to_string();
        self.roundtrip(|reply| Request::StopForward {
            address,
            port,
            reply,
        })
        .await?
        .map_err(|e| SshError::Protocol(e.to_string()))
    }

    /// One keepalive exchange, reported as a [`ProbeOutcome`]. A vanished
    /// owner reads as a lost connection.
    pub async fn probe(&self) -> ProbeOutcome {
        self.roundtrip(|reply| Request::Probe { reply })
            .await
            .unwrap_or(ProbeOutcome::ConnectionLost)
    }

    /// Ask the owner to tear the connection down.
    pub async fn disconnect(&self) {
        let _ = self.requests.send(Request::Shutdown).await;
    }
}

/// Move `handle` into its owner task and return the control endpoint.
pub fn spawn_control(handle: Handle<ClientHandler>, transport_id: String) -> TransportControl {
    spawn_driver(handle, transport_id)
}

/// Generic entry point so tests can drive a scripted connection.
pub(crate) fn spawn_driver<D>(driver: D, transport_id: String) -> TransportControl
where
    D: ConnectionDriver + 'static,
{
    let (requests, queue) = mpsc::channel(REQUEST_QUEUE);
    let (closed_tx, closed_rx) = watch::channel(false);
    tokio::spawn(owner_loop(driver, queue, closed_tx, transport_id));
    TransportControl {
        requests,
        closed: closed_rx,
    }
}

async fn owner_loop<D: ConnectionDriver>(
    mut driver: D,
    mut queue: mpsc::Receiver<Request>,
    closed: watch::Sender<bool>,
    transport_id: String,
) {
    debug!("owner task started for transport {}", transport_id);

    // Exits on an explicit Shutdown or once every control is gone.
    while let Some(request) = queue.recv().await {
        match request {
            Request::OpenSession { reply } => {
                // A reply nobody waits for drops the channel; the peer
                // closes it on its side.
                let _ = reply.send(driver.open_session().await);
            }

            Request::OpenDirect {
                target,
                origin,
                reply,
            } => {
                let result = driver
                    .open_direct((&target.0, target.1), (&origin.0, origin.1))
                    .await;
                let _ = reply.send(result);
            }

            Request::StartForward {
                address,
                port,
                reply,
            } => match driver.start_forward(&address, port).await {
                Ok(bound) => {
                    if reply.send(Ok(bound)).is_err() {
                        // The requester vanished mid-flight, but the peer
                        // is already listening. Unlike a dropped channel,
                        // a listener has no owner to close it, so take
                        // the binding back down here.
                        warn!(
                            "unclaimed remote listener {}:{}, cancelling",
                            address, bound
                        );
                        let _ = driver.stop_forward(&address, bound).await;
                    }
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },

            Request::StopForward {
                address,
                port,
                reply,
            } => {
                let _ = reply.send(driver.stop_forward(&address, port).await);
            }

            Request::Probe { reply } => {
                let outcome =
                    match tokio::time::timeout(KEEPALIVE_REPLY_WINDOW, driver.keepalive()).await {
                        Ok(Ok(())) => ProbeOutcome::Answered,
                        Ok(Err(e)) => {
                            warn!("keepalive failed on transport {}: {}", transport_id, e);
                            ProbeOutcome::ConnectionLost
                        }
                        Err(_) => {
                            warn!(
                                "keepalive unanswered after {:?} on transport {}",
                                KEEPALIVE_REPLY_WINDOW, transport_id
                            );
                            ProbeOutcome::Unanswered
                        }
                    };
                let _ = reply.send(outcome);
            }

            Request::Shutdown => {
                info!("shutdown requested for transport {}", transport_id);
                break;
            }
        }
    }

    // Latch first so is_connected and the prober observe the closure,
    // then drop the queue: every queued request loses its reply channel
    // and its caller gets TransportDead from the roundtrip.
    let _ = closed.send(true);
    drop(queue);
    driver.close().await;
    debug!("owner task terminated for transport {}", transport_id);
}
