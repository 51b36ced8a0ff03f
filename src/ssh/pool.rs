//! Transport pool
//!
//! At most one live transport per (username, host, port) key. Callers
//! acquire counted handles; creation is serialized per key so racing
//! acquires for the same key perform a single handshake while distinct
//! keys progress independently. A janitor sweeps idle and dead entries.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::SshError;
use super::identity::{HostIdentity, PoolKey};
use super::transport::{Transport, TransportConnector};
use crate::config::PoolConfig;

/// One pooled transport with its bookkeeping.
pub struct TransportEntry {
    pub key: PoolKey,
    transport: Arc<dyn Transport>,
    pub created_at: DateTime<Utc>,
    /// Unix seconds of the last acquire or release.
    last_used: AtomicU64,
    ref_count: AtomicU32,
}

impl std::fmt::Debug for TransportEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEntry")
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .field("last_used", &self.last_used)
            .field("ref_count", &self.ref_count)
            .finish()
    }
}

impl TransportEntry {
    fn new(key: PoolKey, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            key,
            transport,
            created_at: Utc::now(),
            last_used: AtomicU64::new(Utc::now().timestamp() as u64),
            ref_count: AtomicU32::new(0),
        })
    }

    fn add_ref(&self) -> u32 {
        self.touch();
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn release_ref(&self) -> u32 {
        self.touch();
        let prev = self.ref_count.load(Ordering::SeqCst);
        if prev == 0 {
            warn!("pool entry {} released below zero", self.key);
            return 0;
        }
        self.ref_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.last_used
            .store(Utc::now().timestamp() as u64, Ordering::SeqCst);
    }

    fn idle_secs(&self, now: i64) -> u64 {
        (now as u64).saturating_sub(self.last_used.load(Ordering::SeqCst))
    }
}

/// A counted handout from the pool. Return it with
/// [`TransportPool::release`] when done.
#[derive(Debug)]
pub struct PoolHandle {
    entry: Arc<TransportEntry>,
    released: bool,
}

impl PoolHandle {
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.entry.transport.clone()
    }

    pub fn key(&self) -> &PoolKey {
        &self.entry.key
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        if !self.released {
            // Keep the refcount honest even when a caller forgets; the
            // transport itself is only closed by release() or the janitor.
            warn!("pool handle for {} dropped without release", self.entry.key);
            self.entry.release_ref();
        }
    }
}

/// Keyed registry of transports with refcounted reuse.
pub struct TransportPool {
    entries: DashMap<PoolKey, Arc<TransportEntry>>,
    /// Per-key creation locks; two racing acquires for the same key
    /// produce one connection attempt.
    creating: DashMap<PoolKey, Arc<Mutex<()>>>,
    connector: Arc<dyn TransportConnector>,
    config: PoolConfig,
    closed: AtomicBool,
    janitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TransportPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn TransportConnector>) -> Arc<Self> {
        let pool = Arc::new(Self {
            entries: DashMap::new(),
            creating: DashMap::new(),
            connector,
            config,
            closed: AtomicBool::new(false),
            janitor: parking_lot::Mutex::new(None),
        });

        let sweep_interval = pool.config.max_idle() / 2;
        let weak = Arc::downgrade(&pool);
        let janitor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval.max(std::time::Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { return };
                if pool.closed.load(Ordering::SeqCst) {
                    return;
                }
                pool.sweep().await;
            }
        });
        *pool.janitor.lock() = Some(janitor);
        pool
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Refcount for a key, if present. Mainly for diagnostics and tests.
    pub fn ref_count(&self, key: &PoolKey) -> Option<u32> {
        self.entries.get(key).map(|e| e.ref_count())
    }

    /// Hand out a transport for `identity`, creating one if no live entry
    /// exists under its key. The credentials of whichever identity causes
    /// creation are the ones used.
    pub async fn acquire(&self, identity: &HostIdentity) -> Result<PoolHandle, SshError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SshError::TransportDead);
        }
        let key = identity.pool_key();

        if let Some(handle) = self.try_reuse(&key) {
            return Ok(handle);
        }

        // Serialize creation for this key only.
        let lock = self
            .creating
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.create_under_lock(&key, identity).await
        };

        // The slot only matters while acquires are racing; retire it once
        // no one else holds the lock (map + ours = 2 strong refs), on the
        // error paths too. A later acquire re-inserts a fresh one. The
        // predicate runs under the shard lock, so no new holder can clone
        // the slot mid-check.
        self.creating
            .remove_if(&key, |_, slot| Arc::strong_count(slot) <= 2);

        result
    }

    /// The creation critical section: runs with the per-key lock held.
    async fn create_under_lock(
        &self,
        key: &PoolKey,
        identity: &HostIdentity,
    ) -> Result<PoolHandle, SshError> {
        // A racing acquire may have created the entry while we waited.
        if let Some(handle) = self.try_reuse(key) {
            return Ok(handle);
        }

        if self.config.max_size > 0 && self.entries.len() >= self.config.max_size {
            warn!("pool at capacity ({}), refusing {}", self.config.max_size, key);
            return Err(SshError::PoolExhausted {
                max: self.config.max_size,
            });
        }

        debug!("creating transport for {}", key);
        let transport = tokio::time::timeout(
            self.config.create_timeout(),
            self.connector.connect(identity),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("creating transport for {}", key)))??;

        let entry = TransportEntry::new(key.clone(), transport);
        entry.add_ref();
        self.entries.insert(key.clone(), entry.clone());
        info!("pooled new transport for {}", key);

        Ok(PoolHandle {
            entry,
            released: false,
        })
    }

    fn try_reuse(&self, key: &PoolKey) -> Option<PoolHandle> {
        let entry = self.entries.get(key)?.value().clone();
        if !entry.transport.is_alive() {
            // Dead entries are replaced, not handed out.
            drop(entry);
            self.remove_if_dead(key);
            return None;
        }
        entry.add_ref();
        debug!("reusing transport for {} (refs={})", key, entry.ref_count());
        Some(PoolHandle {
            entry,
            released: false,
        })
    }

    fn remove_if_dead(&self, key: &PoolKey) {
        if let Some((_, entry)) = self
            .entries
            .remove_if(key, |_, entry| !entry.transport.is_alive())
        {
            info!("removed dead transport for {}", entry.key);
        }
    }

    /// Return a handout. The transport stays pooled for reuse; idle
    /// eviction is the janitor's job.
    pub async fn release(&self, mut handle: PoolHandle) {
        handle.released = true;
        let remaining = handle.entry.release_ref();
        debug!("released {} (refs={})", handle.entry.key, remaining);

        // If the entry was evicted while this holder was out, the detached
        // transport is ours to close once the last holder returns.
        let detached = match self.entries.get(&handle.entry.key) {
            Some(current) => !Arc::ptr_eq(current.value(), &handle.entry),
            None => true,
        };
        if detached && remaining == 0 {
            debug!("closing detached transport for {}", handle.entry.key);
            handle.entry.transport.close().await;
        }
    }

    /// Force-remove a key. Outstanding handles keep the detached transport
    /// until their owners release.
    pub async fn evict(&self, key: &PoolKey) {
        if let Some((_, entry)) = self.entries.remove(key) {
            info!("evicted transport for {} (refs={})", key, entry.ref_count());
            if entry.ref_count() == 0 {
                entry.transport.close().await;
            }
        }
    }

    /// One janitor pass: drop idle unreferenced entries and dead entries.
    async fn sweep(&self) {
        let now = Utc::now().timestamp();
        let max_idle = self.config.max_idle().as_secs();

        let mut to_close = Vec::new();
        self.entries.retain(|key, entry| {
            if !entry.transport.is_alive() {
                debug!("sweeping dead transport for {}", key);
                return false;
            }
            if entry.ref_count() == 0 && entry.idle_secs(now) > max_idle {
                debug!("sweeping idle transport for {}", key);
                to_close.push(entry.clone());
                return false;
            }
            true
        });

        for entry in to_close {
            entry.transport.close().await;
        }
    }

    /// Close every transport and refuse further acquires.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(janitor) = self.janitor.lock().take() {
            janitor.abort();
        }
        let keys: Vec<PoolKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                entry.transport.close().await;
            }
        }
        self.creating.clear();
        info!("transport pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ChannelBehavior, MockConnector};
    use std::time::Duration;

    fn identity(user: &str) -> HostIdentity {
        HostIdentity::new("gw.example.com", 22, user).with_password("pw")
    }

    #[tokio::test]
    async fn same_key_shares_one_transport() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        let pool = TransportPool::new(PoolConfig::default(), connector.clone());

        let a = pool.acquire(&identity("alice")).await.unwrap();
        let b = pool.acquire(&identity("alice")).await.unwrap();

        assert_eq!(connector.handshake_count(), 1);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.ref_count(&identity("alice").pool_key()), Some(2));
        assert!(Arc::ptr_eq(&a.transport(), &b.transport()));

        pool.release(a).await;
        assert_eq!(pool.ref_count(&identity("alice").pool_key()), Some(1));
        pool.release(b).await;
        // Still pooled for reuse after the last release.
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn racing_acquires_perform_one_handshake() {
        let connector = MockConnector::with_delay(ChannelBehavior::Echo, Duration::from_millis(50));
        let pool = TransportPool::new(PoolConfig::default(), connector.clone());

        let p1 = pool.clone();
        let p2 = pool.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { p1.acquire(&identity("alice")).await }),
            tokio::spawn(async move { p2.acquire(&identity("alice")).await }),
        );
        let a = a.unwrap().unwrap();
        let b = b.unwrap().unwrap();

        assert_eq!(connector.handshake_count(), 1);
        assert_eq!(pool.ref_count(a.key()), Some(2));
        // The per-key creation slot does not outlive the race.
        assert!(pool.creating.is_empty());
        pool.release(a).await;
        pool.release(b).await;
    }

    #[tokio::test]
    async fn creation_slots_are_retired_after_use() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        let pool = TransportPool::new(PoolConfig::default(), connector.clone());

        let a = pool.acquire(&identity("alice")).await.unwrap();
        assert!(pool.creating.is_empty());

        // Failed creations retire their slot too.
        connector.fail_next(1);
        assert!(pool.acquire(&identity("bob")).await.is_err());
        assert!(pool.creating.is_empty());

        pool.release(a).await;
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_transports() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        let pool = TransportPool::new(PoolConfig::default(), connector.clone());

        let a = pool.acquire(&identity("alice")).await.unwrap();
        let b = pool.acquire(&identity("bob")).await.unwrap();
        assert_eq!(connector.handshake_count(), 2);
        assert_eq!(pool.len(), 2);
        pool.release(a).await;
        pool.release(b).await;
    }

    #[tokio::test]
    async fn capacity_rejects_new_keys_but_not_existing() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        let config = PoolConfig {
            max_size: 1,
            ..Default::default()
        };
        let pool = TransportPool::new(config, connector.clone());

        let a = pool.acquire(&identity("alice")).await.unwrap();
        let err = pool.acquire(&identity("bob")).await.unwrap_err();
        assert!(matches!(err, SshError::PoolExhausted { max: 1 }));

        // Acquiring the existing key still succeeds at capacity.
        let a2 = pool.acquire(&identity("alice")).await.unwrap();
        assert_eq!(connector.handshake_count(), 1);
        pool.release(a).await;
        pool.release(a2).await;
    }

    #[tokio::test]
    async fn dead_entry_is_replaced_on_acquire() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        let pool = TransportPool::new(PoolConfig::default(), connector.clone());

        let a = pool.acquire(&identity("alice")).await.unwrap();
        let first = connector.latest();
        pool.release(a).await;

        first.kill();
        let b = pool.acquire(&identity("alice")).await.unwrap();
        assert_eq!(connector.handshake_count(), 2);
        assert!(b.transport().is_alive());
        pool.release(b).await;
    }

    #[tokio::test]
    async fn transient_connect_failure_surfaces_to_caller() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        connector.fail_next(1);
        let pool = TransportPool::new(PoolConfig::default(), connector.clone());

        let err = pool.acquire(&identity("alice")).await.unwrap_err();
        assert!(matches!(err, SshError::DialFailed(_)));
        assert_eq!(pool.len(), 0);

        // The next attempt succeeds and pools normally.
        let a = pool.acquire(&identity("alice")).await.unwrap();
        assert_eq!(pool.len(), 1);
        pool.release(a).await;
    }

    #[tokio::test]
    async fn evict_detaches_until_last_release() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        let pool = TransportPool::new(PoolConfig::default(), connector.clone());

        let a = pool.acquire(&identity("alice")).await.unwrap();
        let transport = connector.latest();
        pool.evict(&identity("alice").pool_key()).await;

        // Holder still has a working transport after eviction.
        assert!(transport.is_alive());
        assert_eq!(pool.len(), 0);

        pool.release(a).await;
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn sweep_removes_dead_entries_regardless_of_refcount() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        let pool = TransportPool::new(PoolConfig::default(), connector.clone());

        let a = pool.acquire(&identity("alice")).await.unwrap();
        let transport = connector.latest();
        assert_eq!(pool.len(), 1);

        transport.kill();
        pool.sweep().await;
        assert_eq!(pool.len(), 0);

        // The holder observes TransportDead on its next operation.
        let err = a.transport().open_direct_channel("db", 5432).await;
        assert!(matches!(err, Err(SshError::TransportDead)));
        pool.release(a).await;
    }

    #[tokio::test]
    async fn shutdown_closes_everything_and_refuses_acquires() {
        let connector = MockConnector::new(ChannelBehavior::Echo);
        let pool = TransportPool::new(PoolConfig::default(), connector.clone());

        let a = pool.acquire(&identity("alice")).await.unwrap();
        let transport = connector.latest();
        pool.release(a).await;

        pool.shutdown().await;
        assert!(!transport.is_alive());
        assert!(pool.acquire(&identity("alice")).await.is_err());
    }
}
