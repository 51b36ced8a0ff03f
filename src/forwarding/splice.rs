//! The splicer
//!
//! Two concurrent copy loops between a client-side stream and an SSH
//! channel stream. Each direction owns a reusable 32 KiB buffer, folds its
//! byte count into the session stats per buffer, and half-closes the
//! opposite side on EOF so one-way shutdowns keep the other direction
//! flowing. A shared activity clock enforces the idle timeout across both
//! directions together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::debug;

use crate::stats::SessionStats;

/// Per-direction copy buffer. Splicer memory stays proportional to active
/// connections, never to bytes transferred.
const COPY_BUF_SIZE: usize = 32 * 1024;

/// How one direction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Eof,
    Error,
    IdleExpired,
    Stopped,
}

/// Summary of one spliced connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceOutcome {
    /// Bytes moved client -> channel.
    pub bytes_sent: u64,
    /// Bytes moved channel -> client.
    pub bytes_received: u64,
    /// The connection was closed by the idle timeout.
    pub idle_expired: bool,
}

/// Wall-clock of the last byte moved in either direction.
struct ActivityClock {
    started: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        })
    }

    fn touch(&self) {
        self.last_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

/// Splice `client` and `channel` until both directions finish.
///
/// `stats` receives byte counts while data moves; the caller brackets
/// `active_connections` around this call. `stop` aborts both directions,
/// as used by tunnel shutdown. Errors in one direction close the other and
/// are logged at debug; they never propagate.
pub async fn splice<C, R>(
    client: C,
    channel: R,
    stats: Arc<SessionStats>,
    idle_timeout: Option<Duration>,
    stop: broadcast::Receiver<()>,
) -> SpliceOutcome
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    R: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (client_rd, client_wr) = tokio::io::split(client);
    let (channel_rd, channel_wr) = tokio::io::split(channel);

    let clock = ActivityClock::new();
    // A hard failure in one direction must unblock the other; EOF must not.
    let (abort_tx, _) = broadcast::channel::<()>(2);

    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let stop_inbound = stop.resubscribe();
    let outbound = pump(
        client_rd,
        channel_wr,
        Direction::ClientToChannel,
        &stats,
        &sent,
        clock.clone(),
        idle_timeout,
        stop,
        abort_tx.clone(),
    );
    let inbound = pump(
        channel_rd,
        client_wr,
        Direction::ChannelToClient,
        &stats,
        &received,
        clock.clone(),
        idle_timeout,
        stop_inbound,
        abort_tx.clone(),
    );

    let (out_end, in_end) = tokio::join!(outbound, inbound);

    let outcome = SpliceOutcome {
        bytes_sent: sent.load(Ordering::Relaxed),
        bytes_received: received.load(Ordering::Relaxed),
        idle_expired: out_end == PumpEnd::IdleExpired || in_end == PumpEnd::IdleExpired,
    };
    debug!(
        "splice done: sent={} received={} ({:?}/{:?})",
        outcome.bytes_sent, outcome.bytes_received, out_end, in_end
    );
    outcome
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToChannel,
    ChannelToClient,
}

#[allow(clippy::too_many_arguments)]
async fn pump<R, W>(
    mut rd: R,
    mut wr: W,
    direction: Direction,
    stats: &SessionStats,
    moved: &AtomicU64,
    clock: Arc<ActivityClock>,
    idle_timeout: Option<Duration>,
    mut stop: broadcast::Receiver<()>,
    abort_tx: broadcast::Sender<()>,
) -> PumpEnd
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let mut abort_rx = abort_tx.subscribe();
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    let end = loop {
        // Window until the shared clock would expire, re-checked after
        // every wakeup so activity on the other direction keeps us alive.
        let window = idle_timeout.map(|limit| limit.saturating_sub(clock.idle_for()));

        let read = async {
            match window {
                Some(remaining) if remaining.is_zero() => None,
                Some(remaining) => tokio::time::timeout(remaining, rd.read(&mut buf))
                    .await
                    .ok(),
                None => Some(rd.read(&mut buf).await),
            }
        };

        tokio::select! {
            _ = stop.recv() => break PumpEnd::Stopped,
            _ = abort_rx.recv() => break PumpEnd::Stopped,
            result = read => match result {
                None => {
                    if idle_timeout.map(|limit| clock.idle_for() >= limit).unwrap_or(false) {
                        debug!("{:?}: idle timeout expired", direction);
                        break PumpEnd::IdleExpired;
                    }
                }
                Some(Ok(0)) => break PumpEnd::Eof,
                Some(Ok(n)) => {
                    clock.touch();
                    if let Err(e) = wr.write_all(&buf[..n]).await {
                        debug!("{:?}: write failed: {}", direction, e);
                        break PumpEnd::Error;
                    }
                    moved.fetch_add(n as u64, Ordering::Relaxed);
                    match direction {
                        Direction::ClientToChannel => stats.add_bytes_sent(n as u64),
                        Direction::ChannelToClient => stats.add_bytes_received(n as u64),
                    }
                }
                Some(Err(e)) => {
                    debug!("{:?}: read failed: {}", direction, e);
                    break PumpEnd::Error;
                }
            },
        }
    };

    // EOF half-closes the write side only; errors and idle expiry take the
    // whole connection down.
    let _ = wr.shutdown().await;
    if !matches!(end, PumpEnd::Eof) {
        let _ = abort_tx.send(());
    }
    end
}
