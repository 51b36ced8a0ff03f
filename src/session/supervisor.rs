//! Per-session supervision
//!
//! One task per started session walks the lifecycle: acquire a transport
//! from the pool, start the tunnel, then watch for a stop request,
//! transport death, or a tunnel fault. Transient failures re-enter
//! `Connecting` after the retry interval; permanent failures and an
//! exhausted retry budget end in `Stopped` with the error preserved.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::SessionEvent;
use super::types::{SessionError, SessionRecord, SessionSnapshot, SessionStatus};
use crate::config::SshDefaults;
use crate::forwarding::{TunnelError, TunnelManager, TunnelRule};
use crate::ssh::pool::TransportPool;
use crate::ssh::{HostIdentity, SshError};
use crate::stats::SessionStats;

/// How one connect-and-run round ended.
enum StepEnd {
    /// Stop was requested; the session is winding down.
    Stopped,
    /// The round failed. `was_active` separates transport loss after
    /// reaching Active from failures on the way up.
    Failed {
        error: TunnelError,
        was_active: bool,
    },
}

pub(crate) struct SessionSupervisor {
    pub id: String,
    identity: HostIdentity,
    rule: TunnelRule,
    defaults: SshDefaults,
    pool: Arc<TransportPool>,
    stats: Arc<SessionStats>,
    pub created_at: DateTime<Utc>,
    record: parking_lot::Mutex<SessionRecord>,
    events: broadcast::Sender<SessionEvent>,
    stop_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SessionSupervisor {
    pub fn new(
        id: String,
        identity: HostIdentity,
        rule: TunnelRule,
        defaults: SshDefaults,
        pool: Arc<TransportPool>,
        stats: Arc<SessionStats>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            identity,
            rule,
            defaults,
            pool,
            stats,
            created_at: Utc::now(),
            record: parking_lot::Mutex::new(SessionRecord::new()),
            events,
            stop_tx,
            task: parking_lot::Mutex::new(None),
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.record.lock().status
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let record = self.record.lock().clone();
        SessionSnapshot {
            id: self.id.clone(),
            target: self.identity.endpoint(),
            description: self.rule.describe(),
            status: record.status,
            created_at: self.created_at,
            connected_at: record.connected_at,
            disconnected_at: record.disconnected_at,
            last_error: record.last_error,
            stats: self.stats.snapshot(),
        }
    }

    pub fn pool_key(&self) -> crate::ssh::PoolKey {
        self.identity.pool_key()
    }

    /// Spawn the supervision task. Legal from Created and Stopped.
    pub fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        {
            let record = self.record.lock();
            if !record.status.can_start() {
                return Err(SessionError::InvalidState {
                    id: self.id.clone(),
                    operation: "start",
                    status: record.status,
                });
            }
        }
        self.stop_tx.send_replace(false);

        let supervisor = self.clone();
        let handle = tokio::spawn(async move { supervisor.run().await });
        *self.task.lock() = Some(handle);
        info!("session {} start requested", self.id);
        Ok(())
    }

    /// Request a stop and wait for the supervision task to finish.
    /// Idempotent: stopping a stopped session is a no-op.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        } else if !self.status().is_terminal() {
            // Never started (or already torn down): just mark it.
            self.transition(SessionStatus::Stopped, None);
        }
    }

    async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut consecutive_failures: u32 = 0;

        loop {
            if *stop_rx.borrow() {
                self.transition(SessionStatus::Stopped, None);
                return;
            }

            self.transition(SessionStatus::Connecting, None);
            match self.connect_once(&mut stop_rx).await {
                StepEnd::Stopped => {
                    self.transition(SessionStatus::Stopped, None);
                    return;
                }
                StepEnd::Failed { error, was_active } => {
                    let message = error.to_string();
                    warn!("session {} failed: {}", self.id, message);
                    self.transition(SessionStatus::Error, Some(message.clone()));

                    if error.is_permanent() {
                        info!("session {} giving up on permanent error", self.id);
                        self.transition(SessionStatus::Stopped, None);
                        return;
                    }

                    consecutive_failures = if was_active {
                        1
                    } else {
                        consecutive_failures + 1
                    };
                    let budget = self.defaults.max_retries;
                    if budget > 0 && consecutive_failures >= budget {
                        warn!(
                            "session {} exhausted retry budget ({})",
                            self.id, budget
                        );
                        self.transition(SessionStatus::Stopped, None);
                        return;
                    }

                    if was_active {
                        self.stats.record_reconnect();
                    }

                    let interval = self.defaults.retry_interval();
                    debug!("session {} retrying in {:?}", self.id, interval);
                    tokio::select! {
                        _ = stop_rx.wait_for(|stop| *stop) => {
                            self.transition(SessionStatus::Stopped, None);
                            return;
                        }
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        }
    }

    /// One round: acquire, start the tunnel, run until something ends it.
    async fn connect_once(&self, stop_rx: &mut watch::Receiver<bool>) -> StepEnd {
        let handle = match self.pool.acquire(&self.identity).await {
            Ok(handle) => handle,
            Err(e) => {
                return StepEnd::Failed {
                    error: e.into(),
                    was_active: false,
                }
            }
        };

        let transport = handle.transport();
        // Subscribe before anything can kill the transport, then re-check:
        // a death in between would otherwise go unnoticed.
        let mut dead_rx = transport.subscribe_dead();
        if !transport.is_alive() {
            self.pool.release(handle).await;
            return StepEnd::Failed {
                error: SshError::TransportDead.into(),
                was_active: false,
            };
        }

        self.record.lock().connected_at = Some(Utc::now());
        self.transition(SessionStatus::Connected, None);

        let tunnel = TunnelManager::new(self.rule.clone(), transport.clone(), self.stats.clone());
        if let Err(e) = tunnel.start().await {
            self.pool.release(handle).await;
            return StepEnd::Failed {
                error: e,
                was_active: false,
            };
        }
        self.transition(SessionStatus::Active, None);

        let end = tokio::select! {
            _ = stop_rx.wait_for(|stop| *stop) => StepEnd::Stopped,
            _ = dead_rx.recv() => {
                info!("session {} lost its transport", self.id);
                StepEnd::Failed { error: SshError::TransportDead.into(), was_active: true }
            }
            fault = tunnel.fault() => {
                StepEnd::Failed { error: fault, was_active: true }
            }
        };

        if matches!(end, StepEnd::Stopped) {
            self.transition(SessionStatus::Stopping, None);
        }
        tunnel.stop().await;
        self.pool.release(handle).await;
        end
    }

    /// Change status, stamp timestamps, and publish the event.
    fn transition(&self, new_status: SessionStatus, error: Option<String>) {
        let old_status = {
            let mut record = self.record.lock();
            let old = record.status;
            if old == new_status {
                return;
            }
            record.status = new_status;
            match new_status {
                SessionStatus::Error | SessionStatus::Stopped => {
                    record.disconnected_at = Some(Utc::now());
                }
                SessionStatus::Connecting => {
                    record.disconnected_at = None;
                }
                _ => {}
            }
            if let Some(ref message) = error {
                record.last_error = Some(message.clone());
            }
            old
        };

        debug!(
            "session {} {:?} -> {:?}{}",
            self.id,
            old_status,
            new_status,
            error.as_deref().map(|e| format!(" ({})", e)).unwrap_or_default()
        );
        let _ = self.events.send(SessionEvent {
            session_id: self.id.clone(),
            old_status,
            new_status,
            error,
        });
    }
}
