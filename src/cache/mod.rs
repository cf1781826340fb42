//! Distributed cache implementation.
//!
//! A [`Cache`] is the handle applications use on one node. It routes every
//! operation through the cache's [`CacheContext`], which owns the local
//! entries, the lock registry and the affinity of the cache.

pub mod admission;
pub mod context;
pub mod coordinator;
pub mod dht;
pub mod exchange;
pub mod gate;
pub mod keylock;
pub mod near;

pub use admission::{AsyncAdmission, AsyncOp};
pub use context::CacheContext;
pub use gate::ExchangeGate;
pub use keylock::KeyLocks;
pub use near::NearCache;

use crate::affinity::AffinityCache;
use crate::config::CacheConfig;
use crate::entry::EntrySnapshot;
use crate::error::{Error, Result, TxError};
use crate::future::ReleaseFuture;
use crate::metrics::{CacheMetrics, GaugeGuard};
use crate::network::{LockRequest, Message, UnlockRequest};
use crate::partition::PartitionState;
use crate::tx::Transaction;
use crate::types::{
    CacheKey, CacheStats, CacheValue, PartitionId, TopologyVersion, TxConcurrency, TxIsolation,
};
use context::{expect_ack, expect_get, expect_locked};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Handle to a cache on one node.
///
/// Clones share the same lock owner: an explicit lock taken through one
/// clone can be released through another. Handles obtained separately from
/// the node are distinct owners.
#[derive(Clone)]
pub struct Cache {
    ctx: Arc<CacheContext>,
    owner_id: u64,
}

impl Cache {
    pub(crate) fn new(ctx: Arc<CacheContext>) -> Self {
        let owner_id = ctx.next_owner_id();
        Self { ctx, owner_id }
    }

    /// Cache name.
    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    /// Cache configuration.
    pub fn config(&self) -> &CacheConfig {
        self.ctx.config()
    }

    /// Affinity of the cache.
    pub fn affinity(&self) -> &AffinityCache {
        self.ctx.affinity()
    }

    /// Metrics of the cache on this node.
    pub fn metrics(&self) -> &CacheMetrics {
        self.ctx.metrics()
    }

    pub(crate) fn context(&self) -> &Arc<CacheContext> {
        &self.ctx
    }

    // ==================== Read Operations ====================

    /// Get the value of `key`.
    ///
    /// Served locally when this node owns the key, from the near cache when
    /// one holds it, and from the primary otherwise.
    pub async fn get(&self, key: impl Into<CacheKey>) -> Result<Option<CacheValue>> {
        let key = key.into();
        self.ctx.wait_ready().await?;
        let started = Instant::now();
        let value = self.ctx.get(&key).await?;
        self.ctx
            .metrics()
            .record_get(value.is_some(), started.elapsed());
        Ok(value)
    }

    /// Get several keys. Missing keys are absent from the result.
    pub async fn get_all(
        &self,
        keys: impl IntoIterator<Item = CacheKey>,
    ) -> Result<BTreeMap<CacheKey, CacheValue>> {
        let mut found = BTreeMap::new();
        for key in keys {
            if let Some(value) = self.get(key.clone()).await? {
                found.insert(key, value);
            }
        }
        Ok(found)
    }

    /// Snapshot of the local entry for `key`, without any remote call.
    pub fn local_entry(&self, key: &[u8]) -> Option<EntrySnapshot> {
        let key = CacheKey::copy_from_slice(key);
        self.ctx.entries().with_existing(&key, |e| e.snapshot())
    }

    /// Near copy of `key`, if this node holds one.
    pub fn near_peek(&self, key: &[u8]) -> Option<CacheValue> {
        let key = CacheKey::copy_from_slice(key);
        self.ctx.near().and_then(|n| n.get(&key)).map(|(v, _)| v)
    }

    // ==================== Write Operations ====================

    /// Put a value.
    ///
    /// On a transactional cache the write runs as an implicit optimistic
    /// transaction; on an atomic cache it is a single versioned update.
    pub async fn put(&self, key: impl Into<CacheKey>, value: impl Into<CacheValue>) -> Result<()> {
        self.update(key.into(), Some(value.into()), None).await
    }

    /// Put a value that expires after `ttl`.
    pub async fn put_with_ttl(
        &self,
        key: impl Into<CacheKey>,
        value: impl Into<CacheValue>,
        ttl: Duration,
    ) -> Result<()> {
        self.update(key.into(), Some(value.into()), Some(ttl)).await
    }

    /// Remove a key.
    pub async fn remove(&self, key: impl Into<CacheKey>) -> Result<()> {
        self.update(key.into(), None, None).await
    }

    /// Put several values.
    ///
    /// All-or-nothing on a transactional cache; on an atomic cache each key
    /// is updated independently and the first failure is returned.
    pub async fn put_all(&self, entries: impl IntoIterator<Item = (CacheKey, CacheValue)>) -> Result<()> {
        let entries: Vec<_> = entries.into_iter().collect();
        if self.ctx.config().is_transactional() {
            let tx = self.implicit_tx().await?;
            tx.put_all(entries).await?;
            return tx.commit().await;
        }
        for (key, value) in entries {
            self.put(key, value).await?;
        }
        Ok(())
    }

    /// Remove several keys.
    pub async fn remove_all(&self, keys: impl IntoIterator<Item = CacheKey>) -> Result<()> {
        let keys: Vec<_> = keys.into_iter().collect();
        if self.ctx.config().is_transactional() {
            let tx = self.implicit_tx().await?;
            tx.remove_all(keys).await?;
            return tx.commit().await;
        }
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }

    async fn update(&self, key: CacheKey, value: Option<CacheValue>, ttl: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        if self.ctx.config().is_transactional() {
            let tx = self.implicit_tx().await?;
            match (value, ttl) {
                (Some(value), Some(ttl)) => tx.put_with_ttl(key, value, ttl).await?,
                (Some(value), None) => tx.put(key, value).await?,
                (None, _) => tx.remove(key).await?,
            }
            tx.commit().await?;
        } else {
            self.ctx.wait_ready().await?;
            self.ctx.atomic_update(&key, value, ttl).await?;
        }
        self.ctx
            .metrics()
            .put_latency
            .observe_duration(started.elapsed());
        Ok(())
    }

    async fn implicit_tx(&self) -> Result<Transaction> {
        Transaction::start(
            self.ctx.clone(),
            self.owner_id,
            TxConcurrency::Optimistic,
            TxIsolation::ReadCommitted,
            self.ctx.config().tx.default_timeout,
            None,
            true,
        )
        .await
    }

    // ==================== Async Operations ====================

    /// Start a get in the background.
    ///
    /// Waits for an admission slot first, so at most
    /// `max_concurrent_async_ops` operations run at once.
    pub async fn get_async(&self, key: impl Into<CacheKey>) -> Result<AsyncOp<Option<CacheValue>>> {
        let key = key.into();
        let cache = self.clone();
        self.spawn_async(async move { cache.get(key).await }).await
    }

    /// Start a put in the background.
    pub async fn put_async(
        &self,
        key: impl Into<CacheKey>,
        value: impl Into<CacheValue>,
    ) -> Result<AsyncOp<()>> {
        let (key, value) = (key.into(), value.into());
        let cache = self.clone();
        self.spawn_async(async move { cache.put(key, value).await })
            .await
    }

    /// Start a remove in the background.
    pub async fn remove_async(&self, key: impl Into<CacheKey>) -> Result<AsyncOp<()>> {
        let key = key.into();
        let cache = self.clone();
        self.spawn_async(async move { cache.remove(key).await }).await
    }

    async fn spawn_async<T, F>(&self, op: F) -> Result<AsyncOp<T>>
    where
        T: Send + 'static,
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        self.ctx.ensure_running()?;
        let permit = self.ctx.admission.acquire().await?;
        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let _in_flight = GaugeGuard::new(&ctx.metrics().async_in_flight);
            op.await
        });
        Ok(AsyncOp::new(handle))
    }

    // ==================== Explicit Locks ====================

    /// Lock `key` for this handle, waiting up to `timeout`.
    ///
    /// Returns `false` if the lock could not be acquired in time. Locks are
    /// reentrant per handle; each successful call needs one [`Cache::unlock`].
    pub async fn lock(&self, key: impl Into<CacheKey>, timeout: Duration) -> Result<bool> {
        let key = key.into();
        self.ctx.wait_ready().await?;
        let partition = self.ctx.partition(&key);
        let xid = self.ctx.versions().next(self.ctx.topology_version());
        let ctx = &self.ctx;
        let key_ref = &key;
        let owner_id = self.owner_id;
        let result = ctx
            .remap(partition, move || async move {
                let (assignment, primary) = ctx.primary_of(partition)?;
                let request = LockRequest {
                    xid,
                    key: key_ref.clone(),
                    partition,
                    topology_version: assignment.topology_version(),
                    owner_id,
                    tx: false,
                    group: false,
                    timeout_ms: Some(timeout.as_millis() as u64),
                };
                expect_get(ctx.request(primary, Message::NearLock(request)).await?)
            })
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(Error::Tx(TxError::LockTimeout { .. })) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Release one acquisition of an explicit lock held by this handle.
    pub async fn unlock(&self, key: impl Into<CacheKey>) -> Result<()> {
        let key = key.into();
        self.ctx.ensure_running()?;
        let partition = self.ctx.partition(&key);
        let ctx = &self.ctx;
        let key_ref = &key;
        let owner_id = self.owner_id;
        ctx.remap(partition, move || async move {
            let (_, primary) = ctx.primary_of(partition)?;
            let request = UnlockRequest {
                key: key_ref.clone(),
                partition,
                owner_id,
            };
            expect_ack(ctx.request(primary, Message::Unlock(request)).await?)
        })
        .await
    }

    /// Whether any transaction or handle holds a lock on `key`.
    pub async fn is_locked(&self, key: impl Into<CacheKey>) -> Result<bool> {
        let key = key.into();
        self.ctx.ensure_running()?;
        let partition = self.ctx.partition(&key);
        let ctx = &self.ctx;
        let key_ref = &key;
        ctx.remap(partition, move || async move {
            let (_, primary) = ctx.primary_of(partition)?;
            let msg = Message::IsLocked {
                key: key_ref.clone(),
                partition,
            };
            expect_locked(ctx.request(primary, msg).await?)
        })
        .await
    }

    // ==================== Transactions ====================

    /// Start a transaction with the configured defaults.
    pub async fn tx_start_default(&self) -> Result<Transaction> {
        let tx = &self.ctx.config().tx;
        self.tx_start_with(tx.default_concurrency, tx.default_isolation, tx.default_timeout)
            .await
    }

    /// Start a transaction with the configured timeout.
    pub async fn tx_start(&self, concurrency: TxConcurrency, isolation: TxIsolation) -> Result<Transaction> {
        self.tx_start_with(concurrency, isolation, self.ctx.config().tx.default_timeout)
            .await
    }

    /// Start a transaction with an explicit lock timeout. A zero timeout
    /// waits for locks indefinitely.
    pub async fn tx_start_with(
        &self,
        concurrency: TxConcurrency,
        isolation: TxIsolation,
        timeout: Duration,
    ) -> Result<Transaction> {
        Transaction::start(self.ctx.clone(), self.owner_id, concurrency, isolation, timeout, None, false).await
    }

    /// Start a transaction holding a group lock on `partition`. Only keys of
    /// that partition may be used in it.
    pub async fn tx_start_partition(
        &self,
        partition: PartitionId,
        concurrency: TxConcurrency,
        isolation: TxIsolation,
    ) -> Result<Transaction> {
        Transaction::start(
            self.ctx.clone(),
            self.owner_id,
            concurrency,
            isolation,
            self.ctx.config().tx.default_timeout,
            Some(partition),
            false,
        )
        .await
    }

    // ==================== Multi-update ====================

    /// Hold off topology changes until [`Cache::end_multi_update`].
    ///
    /// Fails with [`Error::MultiUpdateActive`] if one is already active.
    pub async fn begin_multi_update(&self) -> Result<TopologyVersion> {
        self.ctx.wait_ready().await?;
        let topology_version = self.ctx.topology_version();
        self.ctx.gate.begin_multi_update(topology_version).await?;
        info!(cache = %self.name(), topology_version, "Multi-update started");
        Ok(topology_version)
    }

    /// End the active multi-update. Returns false if none was active.
    pub fn end_multi_update(&self) -> bool {
        let ended = self.ctx.gate.end_multi_update();
        if ended {
            info!(cache = %self.name(), "Multi-update ended");
        }
        ended
    }

    // ==================== Topology ====================

    /// State of a partition on this node.
    pub fn partition_state(&self, partition: PartitionId) -> Option<PartitionState> {
        self.ctx.partitions().state(partition)
    }

    /// Partitions that lost all their owners.
    pub fn lost_partitions(&self) -> Vec<PartitionId> {
        self.ctx.lost_partitions()
    }

    /// Completes once no lock in `partitions` requested on a topology
    /// version lower than `topology_version` is held on this node. Locks
    /// taken after the call are tracked too.
    pub fn partition_release_future(
        &self,
        partitions: impl IntoIterator<Item = PartitionId>,
        topology_version: TopologyVersion,
    ) -> ReleaseFuture {
        self.ctx.mvcc().finish_locks(partitions, topology_version)
    }

    /// Key-scoped variant of [`Cache::partition_release_future`].
    pub fn key_release_future<K: Into<CacheKey>>(
        &self,
        keys: impl IntoIterator<Item = K>,
        topology_version: TopologyVersion,
    ) -> ReleaseFuture {
        self.ctx
            .mvcc()
            .finish_keys(keys.into_iter().map(Into::into), topology_version)
    }

    /// Completes when the last exchange's preload finished.
    pub fn preload_future(&self) -> ReleaseFuture {
        self.ctx.preload_future()
    }

    /// Local statistics.
    pub fn stats(&self) -> CacheStats {
        let metrics = self.ctx.metrics();
        let stats = CacheStats {
            entry_count: self.ctx.entries().value_count() as u64,
            near_entry_count: self.ctx.near().map(|n| n.len() as u64).unwrap_or(0),
            swapped_count: self.ctx.entries().swap_size() as u64,
            locked_count: self.ctx.entries().locked_count() as u64,
            hits: metrics.get_hits.get(),
            misses: metrics.get_misses.get(),
        };
        debug!(cache = %self.name(), ?stats, "Stats collected");
        stats
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.ctx.name())
            .field("node_id", &self.ctx.local_id())
            .field("owner_id", &self.owner_id)
            .finish()
    }
}
