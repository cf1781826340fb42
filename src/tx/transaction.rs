//! A transaction started on the local node.

use crate::cache::context::{expect_finish, expect_get, CacheContext};
use crate::error::{Error, Result, TopologyError, TxError};
use crate::network::{FinishRequest, GetResponse, LockRequest, Message, TxWrite};
use crate::types::{
    CacheKey, CacheValue, NodeId, PartitionId, TxConcurrency, TxIsolation, TxState,
};
use crate::version::CacheVersion;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Key locked by a group-lock transaction on `partition`.
pub fn group_lock_key(partition: PartitionId) -> CacheKey {
    Bytes::from(format!("__group_lock__:{partition}"))
}

#[derive(Debug, Clone, Copy)]
struct LockedKey {
    partition: PartitionId,
    primary: NodeId,
}

#[derive(Debug)]
struct TxBody {
    state: TxState,
    rollback_only: bool,
    read_versions: HashMap<CacheKey, CacheVersion>,
    read_values: HashMap<CacheKey, Option<CacheValue>>,
    writes: BTreeMap<CacheKey, TxWrite>,
    locked: BTreeMap<CacheKey, LockedKey>,
}

/// A cache transaction.
///
/// PESSIMISTIC transactions lock a key at its primary on first write (and on
/// first read under REPEATABLE_READ or SERIALIZABLE); later accesses to the
/// same key send nothing. OPTIMISTIC transactions buffer everything and lock
/// at commit in key order, validating the versions they read.
///
/// A group-lock transaction locks one key per partition instead and may only
/// touch keys of that partition.
///
/// Dropping an unfinished transaction releases its locks in the background.
pub struct Transaction {
    ctx: Arc<CacheContext>,
    xid: CacheVersion,
    concurrency: TxConcurrency,
    isolation: TxIsolation,
    timeout: Option<Duration>,
    owner_id: u64,
    group: Option<PartitionId>,
    implicit: bool,
    started: Instant,
    body: Mutex<TxBody>,
}

impl Transaction {
    pub(crate) async fn start(
        ctx: Arc<CacheContext>,
        owner_id: u64,
        concurrency: TxConcurrency,
        isolation: TxIsolation,
        timeout: Duration,
        group: Option<PartitionId>,
        implicit: bool,
    ) -> Result<Self> {
        if !ctx.config().is_transactional() {
            return Err(TxError::NotTransactional(ctx.name().to_string()).into());
        }
        ctx.wait_ready().await?;
        if let Some(partition) = group {
            if partition >= ctx.affinity().partitions() {
                return Err(TopologyError::NoOwners(partition).into());
            }
        }

        let xid = ctx.versions().next(ctx.topology_version());
        ctx.txs().register(xid, concurrency, isolation);
        let tx = Self {
            ctx,
            xid,
            concurrency,
            isolation,
            timeout: (!timeout.is_zero()).then_some(timeout),
            owner_id,
            group,
            implicit,
            started: Instant::now(),
            body: Mutex::new(TxBody {
                state: TxState::Active,
                rollback_only: false,
                read_versions: HashMap::new(),
                read_values: HashMap::new(),
                writes: BTreeMap::new(),
                locked: BTreeMap::new(),
            }),
        };

        if let Some(partition) = group {
            tx.lock_key(group_lock_key(partition), partition, true)
                .await?;
        }
        debug!(
            cache = %tx.ctx.name(),
            xid = %xid,
            ?concurrency,
            ?isolation,
            group = ?group,
            implicit,
            "Transaction started"
        );
        Ok(tx)
    }

    /// Transaction id.
    pub fn xid(&self) -> CacheVersion {
        self.xid
    }

    /// Locking strategy.
    pub fn concurrency(&self) -> TxConcurrency {
        self.concurrency
    }

    /// Isolation level.
    pub fn isolation(&self) -> TxIsolation {
        self.isolation
    }

    /// Current state.
    pub fn state(&self) -> TxState {
        self.body.lock().state
    }

    /// Partition locked by a group-lock transaction.
    pub fn group_partition(&self) -> Option<PartitionId> {
        self.group
    }

    /// Make commit fail and roll back instead.
    pub fn set_rollback_only(&self) {
        let mut body = self.body.lock();
        body.rollback_only = true;
        if body.state == TxState::Active {
            body.state = TxState::MarkedRollback;
        }
        self.ctx.txs().set_state(self.xid, body.state);
    }

    /// Whether the transaction was marked rollback-only.
    pub fn is_rollback_only(&self) -> bool {
        self.body.lock().rollback_only
    }

    fn set_state(&self, state: TxState) {
        self.body.lock().state = state;
        self.ctx.txs().set_state(self.xid, state);
    }

    fn check_active(&self, operation: &str) -> Result<()> {
        let body = self.body.lock();
        if body.rollback_only {
            return Err(TxError::RollbackOnly(self.xid).into());
        }
        if body.state != TxState::Active {
            return Err(TxError::InvalidState {
                operation: operation.to_string(),
                state: body.state.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn partition_for(&self, key: &CacheKey) -> Result<PartitionId> {
        let partition = self.ctx.partition(key);
        match self.group {
            Some(expected) if expected != partition => Err(TxError::GroupLockMismatch {
                expected,
                actual: partition,
            }
            .into()),
            _ => Ok(partition),
        }
    }

    fn locks_per_key(&self) -> bool {
        self.group.is_none()
    }

    /// Read `key` within the transaction.
    pub async fn get(&self, key: impl Into<CacheKey>) -> Result<Option<CacheValue>> {
        let key = key.into();
        self.check_active("get")?;
        let partition = self.partition_for(&key)?;
        {
            let body = self.body.lock();
            if let Some(write) = body.writes.get(&key) {
                return Ok(write.value.clone());
            }
            if self.isolation.is_repeatable() {
                if let Some(value) = body.read_values.get(&key) {
                    return Ok(value.clone());
                }
            }
        }

        let lock = self.concurrency == TxConcurrency::Pessimistic
            && self.isolation.is_repeatable()
            && self.locks_per_key();
        let locked = if lock {
            self.lock_key(key.clone(), partition, false).await?
        } else {
            None
        };
        let GetResponse { value, version } = match locked {
            Some(response) => response,
            None => self.ctx.primary_read(&key, partition).await?,
        };

        if self.isolation.is_repeatable() {
            let mut body = self.body.lock();
            body.read_versions.entry(key.clone()).or_insert(version);
            body.read_values.insert(key, value.clone());
        }
        Ok(value)
    }

    /// Read several keys.
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

    /// Write `key` within the transaction.
    pub async fn put(&self, key: impl Into<CacheKey>, value: impl Into<CacheValue>) -> Result<()> {
        let ttl = self.ctx.config().default_ttl;
        self.write(key.into(), Some(value.into()), ttl, "put").await
    }

    /// Write `key` with an expiry.
    pub async fn put_with_ttl(
        &self,
        key: impl Into<CacheKey>,
        value: impl Into<CacheValue>,
        ttl: Duration,
    ) -> Result<()> {
        self.write(key.into(), Some(value.into()), Some(ttl), "put")
            .await
    }

    /// Write several keys.
    pub async fn put_all(&self, entries: impl IntoIterator<Item = (CacheKey, CacheValue)>) -> Result<()> {
        for (key, value) in entries {
            self.put(key, value).await?;
        }
        Ok(())
    }

    /// Remove `key` within the transaction.
    pub async fn remove(&self, key: impl Into<CacheKey>) -> Result<()> {
        self.write(key.into(), None, None, "remove").await
    }

    /// Remove several keys.
    pub async fn remove_all(&self, keys: impl IntoIterator<Item = CacheKey>) -> Result<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }

    async fn write(
        &self,
        key: CacheKey,
        value: Option<CacheValue>,
        ttl: Option<Duration>,
        operation: &str,
    ) -> Result<()> {
        self.check_active(operation)?;
        let partition = self.partition_for(&key)?;
        if self.concurrency == TxConcurrency::Pessimistic && self.locks_per_key() {
            self.lock_key(key.clone(), partition, false).await?;
        }
        let write = TxWrite {
            key: key.clone(),
            partition,
            ttl_ms: ttl.filter(|_| value.is_some()).map(|d| d.as_millis() as u64),
            value,
        };
        self.body.lock().writes.insert(key, write);
        Ok(())
    }

    /// Lock `key` at its primary unless this transaction already holds it.
    /// Any failure rolls the whole transaction back.
    async fn lock_key(
        &self,
        key: CacheKey,
        partition: PartitionId,
        group: bool,
    ) -> Result<Option<GetResponse>> {
        if self.body.lock().locked.contains_key(&key) {
            return Ok(None);
        }
        let ctx = &self.ctx;
        let key_ref = &key;
        let timeout_ms = self.timeout.map(|d| d.as_millis() as u64);
        let result = ctx
            .remap(partition, move || async move {
                let (assignment, primary) = ctx.primary_of(partition)?;
                let request = LockRequest {
                    xid: self.xid,
                    key: key_ref.clone(),
                    partition,
                    topology_version: assignment.topology_version(),
                    owner_id: self.owner_id,
                    tx: true,
                    group,
                    timeout_ms,
                };
                let response = expect_get(ctx.request(primary, Message::NearLock(request)).await?)?;
                Ok((primary, response))
            })
            .await;

        match result {
            Ok((primary, response)) => {
                self.ctx.versions().on_received(&response.version);
                self.body
                    .lock()
                    .locked
                    .insert(key, LockedKey { partition, primary });
                Ok(Some(response))
            }
            Err(e) => {
                let granted_elsewhere = !matches!(e, Error::Tx(TxError::LockTimeout { .. }));
                if granted_elsewhere {
                    // The primary may have granted the lock before the failure.
                    if let Ok((_, primary)) = self.ctx.primary_of(partition) {
                        self.body
                            .lock()
                            .locked
                            .insert(key, LockedKey { partition, primary });
                    }
                }
                warn!(
                    cache = %self.ctx.name(),
                    xid = %self.xid,
                    error = %e,
                    "Lock acquisition failed, rolling back"
                );
                self.rollback_inner().await;
                Err(e)
            }
        }
    }

    /// Commit the transaction.
    pub async fn commit(&self) -> Result<()> {
        let (rollback_only, state) = {
            let body = self.body.lock();
            (body.rollback_only, body.state)
        };
        if rollback_only {
            self.rollback_inner().await;
            return Err(TxError::RollbackOnly(self.xid).into());
        }
        if state != TxState::Active {
            return Err(TxError::InvalidState {
                operation: "commit".to_string(),
                state: state.to_string(),
            }
            .into());
        }

        self.set_state(TxState::Preparing);
        if self.concurrency == TxConcurrency::Optimistic && self.locks_per_key() {
            self.prepare_optimistic().await?;
        }
        self.set_state(TxState::Prepared);
        self.set_state(TxState::Committing);

        let writes: Vec<TxWrite> = self.body.lock().writes.values().cloned().collect();
        if let Err(e) = self.write_through(&writes).await {
            warn!(cache = %self.ctx.name(), xid = %self.xid, error = %e, "Store write failed, rolling back");
            self.rollback_inner().await;
            return Err(TxError::RolledBack {
                xid: self.xid,
                reason: e.to_string(),
            }
            .into());
        }

        let locked = std::mem::take(&mut self.body.lock().locked);
        match finish(&self.ctx, self.xid, true, &locked, writes).await {
            Ok(versions) => {
                if let Some(near) = self.ctx.near() {
                    for (key, version) in &versions {
                        near.invalidate(key, *version);
                    }
                }
                self.set_state(TxState::Committed);
                self.ctx.metrics().record_tx(true, self.started.elapsed());
                self.ctx.txs().deregister(self.xid);
                debug!(
                    cache = %self.ctx.name(),
                    xid = %self.xid,
                    keys = versions.len(),
                    implicit = self.implicit,
                    "Transaction committed"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(TxState::Invalidated);
                self.ctx.txs().deregister(self.xid);
                warn!(cache = %self.ctx.name(), xid = %self.xid, error = %e, "Commit outcome unknown");
                Err(TxError::Heuristic {
                    xid: self.xid,
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }

    /// Lock every written key, and every read key under repeatable
    /// isolation, in key order; then check nothing read has changed.
    async fn prepare_optimistic(&self) -> Result<()> {
        let keys: BTreeSet<CacheKey> = {
            let body = self.body.lock();
            let reads = body
                .read_versions
                .keys()
                .filter(|_| self.isolation.is_repeatable());
            body.writes.keys().chain(reads).cloned().collect()
        };

        for key in keys {
            let partition = self.ctx.partition(&key);
            let Some(response) = self.lock_key(key.clone(), partition, false).await? else {
                continue;
            };
            if !self.isolation.is_repeatable() {
                continue;
            }
            let expected = self.body.lock().read_versions.get(&key).copied();
            if let Some(expected) = expected {
                if expected != response.version {
                    debug!(
                        cache = %self.ctx.name(),
                        xid = %self.xid,
                        %expected,
                        found = %response.version,
                        "Optimistic validation failed"
                    );
                    self.rollback_inner().await;
                    return Err(TxError::OptimisticConflict {
                        key: String::from_utf8_lossy(&key).into_owned(),
                        expected,
                        found: response.version,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    async fn write_through(&self, writes: &[TxWrite]) -> Result<()> {
        let Some(store) = self.ctx.write_store() else {
            return Ok(());
        };
        if writes.is_empty() {
            return Ok(());
        }
        let puts: Vec<(CacheKey, CacheValue)> = writes
            .iter()
            .filter_map(|w| w.value.clone().map(|v| (w.key.clone(), v)))
            .collect();
        let removes: Vec<CacheKey> = writes
            .iter()
            .filter(|w| w.value.is_none())
            .map(|w| w.key.clone())
            .collect();

        let result = async {
            if !puts.is_empty() {
                store.put_all(Some(self.xid), puts).await?;
            }
            if !removes.is_empty() {
                store.remove_all(Some(self.xid), removes).await?;
            }
            store.tx_end(self.xid, true).await
        }
        .await;

        if result.is_err() {
            if let Err(e) = store.tx_end(self.xid, false).await {
                debug!(xid = %self.xid, error = %e, "Store session rollback failed");
            }
        }
        result.map_err(Error::from)
    }

    /// Roll the transaction back, releasing its locks.
    pub async fn rollback(&self) -> Result<()> {
        let state = self.state();
        if state == TxState::RolledBack {
            return Ok(());
        }
        if state.is_final() {
            return Err(TxError::InvalidState {
                operation: "rollback".to_string(),
                state: state.to_string(),
            }
            .into());
        }
        self.rollback_inner().await;
        Ok(())
    }

    async fn rollback_inner(&self) {
        if self.state() == TxState::RolledBack {
            return;
        }
        self.set_state(TxState::RollingBack);
        let locked = {
            let mut body = self.body.lock();
            body.writes.clear();
            std::mem::take(&mut body.locked)
        };
        if let Err(e) = finish(&self.ctx, self.xid, false, &locked, Vec::new()).await {
            warn!(cache = %self.ctx.name(), xid = %self.xid, error = %e, "Lock release on rollback failed");
        }
        self.set_state(TxState::RolledBack);
        self.ctx.txs().deregister(self.xid);
        self.ctx.metrics().record_tx(false, self.started.elapsed());
        debug!(cache = %self.ctx.name(), xid = %self.xid, "Transaction rolled back");
    }
}

/// Send a finish to every primary involved. Writes whose key was never
/// locked here (group-lock transactions) go to the primary of their
/// partition.
async fn finish(
    ctx: &CacheContext,
    xid: CacheVersion,
    commit: bool,
    locked: &BTreeMap<CacheKey, LockedKey>,
    writes: Vec<TxWrite>,
) -> Result<Vec<(CacheKey, CacheVersion)>> {
    let topology_version = ctx.topology_version();
    let mut requests: BTreeMap<NodeId, FinishRequest> = BTreeMap::new();
    let empty = || FinishRequest {
        xid,
        commit,
        topology_version,
        writes: Vec::new(),
        locked: Vec::new(),
    };

    for (key, lk) in locked {
        requests
            .entry(lk.primary)
            .or_insert_with(empty)
            .locked
            .push((key.clone(), lk.partition));
    }
    for write in writes {
        let primary = match locked.get(&write.key) {
            Some(lk) => lk.primary,
            None => ctx.primary_of(write.partition)?.1,
        };
        requests
            .entry(primary)
            .or_insert_with(empty)
            .writes
            .push(write);
    }

    let mut versions = Vec::new();
    let mut first_err = None;
    for (primary, request) in requests {
        let outcome = match ctx.request(primary, Message::TxFinish(request)).await {
            Ok(msg) => expect_finish(msg),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(response) => {
                for (_, version) in &response.versions {
                    ctx.versions().on_received(version);
                }
                versions.extend(response.versions);
            }
            Err(e) => {
                warn!(cache = %ctx.name(), %xid, primary, commit, error = %e, "Finish failed at primary");
                first_err.get_or_insert(e);
            }
        }
    }
    first_err.map_or(Ok(versions), Err)
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let body = self.body.get_mut();
        if body.state.is_final() {
            return;
        }
        let locked = std::mem::take(&mut body.locked);
        self.ctx.txs().deregister(self.xid);
        if locked.is_empty() {
            return;
        }
        let ctx = self.ctx.clone();
        let xid = self.xid;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = finish(&ctx, xid, false, &locked, Vec::new()).await {
                        warn!(cache = %ctx.name(), %xid, error = %e, "Releasing locks of dropped transaction failed");
                    }
                });
            }
            Err(_) => warn!(%xid, locks = locked.len(), "Transaction dropped outside a runtime, locks kept"),
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = self.body.lock();
        f.debug_struct("Transaction")
            .field("xid", &self.xid)
            .field("concurrency", &self.concurrency)
            .field("isolation", &self.isolation)
            .field("state", &body.state)
            .field("writes", &body.writes.len())
            .field("locked", &body.locked.len())
            .finish()
    }
}
