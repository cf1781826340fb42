//! Per-cache state on one node and the plumbing shared by its handlers.

use super::admission::AsyncAdmission;
use super::gate::ExchangeGate;
use super::keylock::KeyLocks;
use super::near::NearCache;
use crate::affinity::{create_affinity, AffinityAssignment, AffinityCache};
use crate::cluster::{ClusterNode, TopologySnapshot};
use crate::config::CacheConfig;
use crate::entry::{EntryMap, Evicted};
use crate::error::{Error, NetworkError, Result, TopologyError};
use crate::future::ReleaseFuture;
use crate::metrics::CacheMetrics;
use crate::mvcc::MvccManager;
use crate::network::{Envelope, FinishResponse, GetResponse, Message, Transport};
use crate::partition::PartitionTopology;
use crate::store::{CacheStore, WriteBehindStore};
use crate::swap::{MemorySwapSpace, SwapSpace};
use crate::tx::TxManager;
use crate::types::{CacheKey, CacheMode, CacheValue, MemoryMode, NodeId, PartitionId, TopologyVersion};
use crate::version::{CacheVersion, VersionGenerator};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Boxed future returned by message dispatch.
pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How long a remapped operation waits for a newer assignment.
const REMAP_WAIT: Duration = Duration::from_millis(200);

/// Pause between remaps when no newer assignment is expected.
const REMAP_BACKOFF: Duration = Duration::from_millis(10);

/// Everything one cache needs on one node.
pub struct CacheContext {
    pub(crate) name: String,
    pub(crate) config: CacheConfig,
    pub(crate) local: ClusterNode,
    pub(crate) versions: Arc<VersionGenerator>,
    pub(crate) affinity: AffinityCache,
    pub(crate) partitions: PartitionTopology,
    pub(crate) entries: EntryMap,
    pub(crate) near: Option<NearCache>,
    pub(crate) mvcc: MvccManager,
    pub(crate) store: Option<Arc<dyn CacheStore>>,
    pub(crate) write_behind: Option<Arc<WriteBehindStore>>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) metrics: Arc<CacheMetrics>,
    pub(crate) admission: AsyncAdmission,
    pub(crate) gate: ExchangeGate,
    pub(crate) write_locks: KeyLocks,
    pub(crate) txs: TxManager,
    pub(crate) topology: RwLock<TopologySnapshot>,
    pub(crate) cancel: CancellationToken,
    pub(crate) preload: Mutex<ReleaseFuture>,
    next_owner: AtomicU64,
}

impl CacheContext {
    /// Build the context of `config` for the local node.
    ///
    /// `store` backs read-through and write-through; it is wrapped in a
    /// [`WriteBehindStore`] when write-behind is configured. `swap` receives
    /// evicted entries when swapping is on, defaulting to memory.
    pub fn new(
        config: CacheConfig,
        local: ClusterNode,
        versions: Arc<VersionGenerator>,
        transport: Arc<dyn Transport>,
        store: Option<Arc<dyn CacheStore>>,
        swap: Option<Arc<dyn SwapSpace>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let backups = config.effective_backups();
        let affinity = AffinityCache::new(config.name.clone(), create_affinity(&config.affinity), backups);

        let swap_enabled =
            config.eviction.swap_enabled || config.memory_mode == MemoryMode::OffheapTiered;
        let swap = swap_enabled.then(|| {
            swap.unwrap_or_else(|| Arc::new(MemorySwapSpace::new()) as Arc<dyn SwapSpace>)
        });
        let entries = EntryMap::new(&config.eviction, swap);

        let (store, write_behind) = match (store, &config.store.write_behind) {
            (Some(inner), Some(wb)) => {
                let wrapped = WriteBehindStore::start(inner, wb.clone());
                (Some(wrapped.clone() as Arc<dyn CacheStore>), Some(wrapped))
            }
            (store, _) => (store, None),
        };

        let near = config
            .distribution_mode
            .near_enabled()
            .then(|| NearCache::new(&config.near));

        info!(
            cache = %config.name,
            node_id = local.id,
            mode = ?config.cache_mode,
            atomicity = ?config.atomicity_mode,
            distribution = ?config.distribution_mode,
            backups,
            "Cache started"
        );

        Ok(Arc::new(Self {
            name: config.name.clone(),
            partitions: PartitionTopology::new(local.id),
            mvcc: MvccManager::new(),
            metrics: Arc::new(CacheMetrics::new()),
            admission: AsyncAdmission::new(config.max_concurrent_async_ops, local.id),
            gate: ExchangeGate::new(config.name.clone()),
            write_locks: KeyLocks::new(),
            txs: TxManager::new(config.tx.completed_versions_window),
            topology: RwLock::new(TopologySnapshot::new(0, Vec::new())),
            cancel: CancellationToken::new(),
            preload: Mutex::new(ReleaseFuture::completed()),
            next_owner: AtomicU64::new(1),
            affinity,
            entries,
            near,
            store,
            write_behind,
            transport,
            versions,
            local,
            config,
        }))
    }

    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Local node id.
    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    /// Affinity of this cache.
    pub fn affinity(&self) -> &AffinityCache {
        &self.affinity
    }

    /// Local entries.
    pub fn entries(&self) -> &EntryMap {
        &self.entries
    }

    /// Near cache, if enabled.
    pub fn near(&self) -> Option<&NearCache> {
        self.near.as_ref()
    }

    /// Lock registry.
    pub fn mvcc(&self) -> &MvccManager {
        &self.mvcc
    }

    /// Partition states.
    pub fn partitions(&self) -> &PartitionTopology {
        &self.partitions
    }

    /// Metrics.
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Transaction registry.
    pub fn txs(&self) -> &TxManager {
        &self.txs
    }

    /// Version generator of the node.
    pub fn versions(&self) -> &VersionGenerator {
        &self.versions
    }

    /// Write-behind wrapper, if configured.
    pub fn write_behind(&self) -> Option<&Arc<WriteBehindStore>> {
        self.write_behind.as_ref()
    }

    /// Last topology this cache exchanged on.
    pub fn topology(&self) -> TopologySnapshot {
        self.topology.read().clone()
    }

    /// Preload of the last exchange.
    pub fn preload_future(&self) -> ReleaseFuture {
        self.preload.lock().clone()
    }

    pub(crate) fn next_owner_id(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether the node has started stopping.
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::NodeStopping(self.local.id));
        }
        Ok(())
    }

    /// Wait until no exchange is blocking new operations.
    pub(crate) async fn wait_ready(&self) -> Result<()> {
        self.ensure_running()?;
        tokio::select! {
            res = self.gate.wait_open() => res?,
            _ = self.cancel.cancelled() => return Err(Error::NodeStopping(self.local.id)),
        }
        self.ensure_running()
    }

    pub(crate) fn topology_version(&self) -> TopologyVersion {
        self.affinity.ready_version()
    }

    pub(crate) fn partition(&self, key: &[u8]) -> PartitionId {
        self.affinity.partition(key)
    }

    pub(crate) fn latest(&self) -> Result<Arc<AffinityAssignment>> {
        self.affinity.latest()
    }

    /// Latest assignment and the primary of `partition` in it.
    pub(crate) fn primary_of(&self, partition: PartitionId) -> Result<(Arc<AffinityAssignment>, NodeId)> {
        let assignment = self.latest()?;
        let primary = assignment
            .primary(partition)
            .ok_or(TopologyError::NoOwners(partition))?;
        Ok((assignment, primary))
    }

    /// Latest assignment, failing unless the local node is primary for `partition`.
    pub(crate) fn check_primary(&self, partition: PartitionId) -> Result<Arc<AffinityAssignment>> {
        let assignment = self.latest()?;
        if !assignment.is_primary(self.local.id, partition) {
            return Err(TopologyError::NotPrimary {
                partition,
                node: self.local.id,
                topology_version: assignment.topology_version(),
            }
            .into());
        }
        Ok(assignment)
    }

    /// Store written on updates, when write-through or write-behind is on.
    pub(crate) fn write_store(&self) -> Option<&Arc<dyn CacheStore>> {
        let writes = self.config.store.write_through || self.write_behind.is_some();
        self.store.as_ref().filter(|_| writes)
    }

    pub(crate) async fn store_update(
        &self,
        tx: Option<CacheVersion>,
        key: &CacheKey,
        value: Option<CacheValue>,
    ) -> Result<()> {
        let Some(store) = self.write_store() else {
            return Ok(());
        };
        match value {
            Some(value) => store.put(tx, key.clone(), value).await?,
            None => store.remove(tx, key.clone()).await?,
        }
        Ok(())
    }

    /// Whether every data node owns every partition.
    pub fn is_replicated(&self) -> bool {
        self.config.cache_mode == CacheMode::Replicated
    }

    /// Send a request and wait for the answer. Requests to the local node
    /// are dispatched directly and never touch the transport.
    pub(crate) async fn request(&self, to: NodeId, msg: Message) -> Result<Message> {
        self.ensure_running()?;
        if to == self.local.id {
            return self.handle_message(to, msg).await;
        }
        let envelope = Envelope::new(self.name.clone(), msg);
        tokio::select! {
            res = self.transport.send(self.local.id, to, envelope) => res,
            _ = self.cancel.cancelled() => Err(Error::NodeStopping(self.local.id)),
        }
    }

    /// Send one message per target. With `wait` the call returns after
    /// every target answered and reports the first failure; otherwise the
    /// sends run in the background and failures are only logged. Local
    /// targets are skipped.
    pub(crate) async fn send_all(&self, targets: Vec<(NodeId, Message)>, wait: bool) -> Result<()> {
        let from = self.local.id;
        let mut set = JoinSet::new();
        for (to, msg) in targets {
            if to == from {
                continue;
            }
            let transport = self.transport.clone();
            let envelope = Envelope::new(self.name.clone(), msg);
            if wait {
                set.spawn(async move { transport.send(from, to, envelope).await });
            } else {
                tokio::spawn(async move {
                    if let Err(e) = transport.send(from, to, envelope).await {
                        debug!(from, to, error = %e, "Background send failed");
                    }
                });
            }
        }

        let mut first_err = None;
        loop {
            let joined = tokio::select! {
                joined = set.join_next() => joined,
                _ = self.cancel.cancelled() => return Err(Error::NodeStopping(from)),
            };
            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    first_err.get_or_insert(Error::Internal(e.to_string()));
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Run `op` until it stops failing with a routing error, waiting for a
    /// newer assignment between attempts.
    pub(crate) async fn remap<T, F, Fut>(&self, partition: PartitionId, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    if attempts > self.config.max_remap_attempts {
                        warn!(cache = %self.name, partition, attempts, error = %e, "Remap attempts exhausted");
                        return Err(TopologyError::RemapExhausted { partition, attempts }.into());
                    }
                    debug!(cache = %self.name, partition, attempts, error = %e, "Remapping operation");
                    self.await_topology(&e).await?;
                }
                res => return res,
            }
        }
    }

    async fn await_topology(&self, err: &Error) -> Result<()> {
        let target = match err {
            Error::Topology(TopologyError::NotPrimary { topology_version, .. }) => *topology_version,
            Error::Topology(TopologyError::StaleTopology { requested, .. }) => *requested,
            _ => 0,
        };
        let wait = async {
            if target > self.affinity.ready_version() {
                let _ = self.affinity.ready(target).await;
            } else {
                tokio::time::sleep(REMAP_BACKOFF).await;
            }
        };
        tokio::select! {
            _ = tokio::time::timeout(REMAP_WAIT, wait) => Ok(()),
            _ = self.cancel.cancelled() => Err(Error::NodeStopping(self.local.id)),
        }
    }

    /// Tell near readers of `key` to drop copies older than `version`.
    pub(crate) async fn invalidate_readers(
        &self,
        key: &CacheKey,
        readers: impl IntoIterator<Item = NodeId>,
        version: CacheVersion,
        except: NodeId,
        wait: bool,
    ) {
        let targets: Vec<(NodeId, Message)> = readers
            .into_iter()
            .filter(|r| *r != except && *r != self.local.id)
            .map(|r| {
                (
                    r,
                    Message::Invalidate {
                        key: key.clone(),
                        version,
                    },
                )
            })
            .collect();
        if targets.is_empty() {
            return;
        }
        self.metrics.invalidations_sent.inc_by(targets.len() as u64);
        if let Err(e) = self.send_all(targets, wait).await {
            debug!(cache = %self.name, error = %e, "Near invalidation failed");
        }
    }

    /// Evict over-limit entries and notify near readers of the evicted ones.
    pub(crate) fn evict_if_needed(&self) {
        let evicted = self.entries.evict_if_needed();
        if evicted.is_empty() {
            return;
        }
        let mut targets = Vec::new();
        for Evicted {
            key,
            version,
            readers,
            swapped,
            ..
        } in evicted
        {
            self.metrics.evictions.inc();
            if swapped {
                self.metrics.swapped_out.inc();
            }
            for reader in readers {
                targets.push((
                    reader,
                    Message::Invalidate {
                        key: key.clone(),
                        version,
                    },
                ));
            }
        }
        if !targets.is_empty() {
            self.metrics.invalidations_sent.inc_by(targets.len() as u64);
            let transport = self.transport.clone();
            let from = self.local.id;
            let cache = self.name.clone();
            tokio::spawn(async move {
                for (to, msg) in targets {
                    if let Err(e) = transport.send(from, to, Envelope::new(cache.clone(), msg)).await {
                        debug!(from, to, error = %e, "Eviction invalidation failed");
                    }
                }
            });
        }
    }

    /// Stop serving: cancel waiters, refuse new work and flush write-behind.
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        self.admission.close();
        self.mvcc.cancel_waiters(self.local.id);
        self.gate.stop(self.local.id);
        if let Some(wb) = &self.write_behind {
            if let Err(e) = wb.stop().await {
                warn!(cache = %self.name, error = %e, "Write-behind flush on stop failed");
            }
        }
        info!(cache = %self.name, node_id = self.local.id, "Cache stopped");
    }
}

impl std::fmt::Debug for CacheContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheContext")
            .field("name", &self.name)
            .field("node_id", &self.local.id)
            .field("topology_version", &self.topology_version())
            .field("entries", &self.entries.len())
            .field("locks", &self.mvcc.lock_count())
            .finish()
    }
}

fn unexpected(expected: &'static str, actual: Message) -> Error {
    NetworkError::UnexpectedResponse {
        expected,
        actual: actual.kind().to_string(),
    }
    .into()
}

pub(crate) fn expect_get(msg: Message) -> Result<GetResponse> {
    match msg {
        Message::GetResponse(resp) | Message::LockResponse(resp) => Ok(resp),
        other => Err(unexpected("GetResponse", other)),
    }
}

pub(crate) fn expect_finish(msg: Message) -> Result<FinishResponse> {
    match msg {
        Message::FinishResponse(resp) => Ok(resp),
        other => Err(unexpected("FinishResponse", other)),
    }
}

pub(crate) fn expect_version(msg: Message) -> Result<CacheVersion> {
    match msg {
        Message::AtomicUpdateResponse { version } => Ok(version),
        other => Err(unexpected("AtomicUpdateResponse", other)),
    }
}

pub(crate) fn expect_locked(msg: Message) -> Result<bool> {
    match msg {
        Message::Locked(locked) => Ok(locked),
        other => Err(unexpected("Locked", other)),
    }
}

pub(crate) fn expect_ack(msg: Message) -> Result<()> {
    match msg {
        Message::Ack => Ok(()),
        other => Err(unexpected("Ack", other)),
    }
}

pub(crate) fn ttl_ms(ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|d| d.as_millis() as u64)
}
