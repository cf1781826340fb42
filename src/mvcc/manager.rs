//! Node-wide registry of held locks and the release futures built on it.
//!
//! Every lock granted or queued on this node is registered together with
//! its partition and the topology version it was requested on. A finish
//! future for `(scope, topology_version)` tracks every registered lock in
//! the scope with a lower topology version, including locks registered after
//! the future was created, and completes when the last of them is removed.

use crate::future::{ReleaseFuture, ReleaseHandle};
use crate::types::{CacheKey, NodeId, PartitionId, TopologyVersion};
use crate::version::CacheVersion;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::trace;

type LockId = (CacheVersion, CacheKey);

#[derive(Debug, Clone)]
struct LockInfo {
    partition: PartitionId,
    topology_version: TopologyVersion,
    origin: NodeId,
}

#[derive(Debug)]
enum Scope {
    Partitions(HashSet<PartitionId>),
    Keys(HashSet<CacheKey>),
}

impl Scope {
    fn covers(&self, key: &CacheKey, info: &LockInfo) -> bool {
        match self {
            Scope::Partitions(parts) => parts.contains(&info.partition),
            Scope::Keys(keys) => keys.contains(key),
        }
    }
}

#[derive(Debug)]
struct FinishWaiter {
    scope: Scope,
    topology_version: TopologyVersion,
    pending: HashSet<LockId>,
    handle: ReleaseHandle,
}

#[derive(Debug, Default)]
struct Inner {
    locks: HashMap<LockId, LockInfo>,
    waiters: Vec<FinishWaiter>,
}

/// Tracks locks held on this node for one cache.
#[derive(Debug, Default)]
pub struct MvccManager {
    inner: Mutex<Inner>,
}

impl MvccManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lock candidate for `key`.
    pub fn add_lock(
        &self,
        version: CacheVersion,
        key: &CacheKey,
        partition: PartitionId,
        topology_version: TopologyVersion,
        origin: NodeId,
    ) {
        let mut inner = self.inner.lock();
        let id = (version, key.clone());
        if inner.locks.contains_key(&id) {
            return;
        }
        let info = LockInfo {
            partition,
            topology_version,
            origin,
        };
        for waiter in inner.waiters.iter_mut() {
            if info.topology_version < waiter.topology_version && waiter.scope.covers(key, &info) {
                waiter.pending.insert(id.clone());
            }
        }
        trace!(%version, partition, topology_version, "Lock registered");
        inner.locks.insert(id, info);
    }

    /// Unregister a lock candidate, completing finish futures it was holding.
    pub fn remove_lock(&self, version: CacheVersion, key: &CacheKey) {
        let mut inner = self.inner.lock();
        let id = (version, key.clone());
        if inner.locks.remove(&id).is_none() {
            return;
        }
        inner.waiters.retain_mut(|waiter| {
            waiter.pending.remove(&id);
            if waiter.pending.is_empty() {
                waiter.handle.complete();
                false
            } else {
                true
            }
        });
    }

    /// Future completing once no lock in `partitions` requested before
    /// `topology_version` is held.
    pub fn finish_locks(
        &self,
        partitions: impl IntoIterator<Item = PartitionId>,
        topology_version: TopologyVersion,
    ) -> ReleaseFuture {
        self.finish(
            Scope::Partitions(partitions.into_iter().collect()),
            topology_version,
        )
    }

    /// Future completing once no lock on `keys` requested before
    /// `topology_version` is held.
    pub fn finish_keys(
        &self,
        keys: impl IntoIterator<Item = CacheKey>,
        topology_version: TopologyVersion,
    ) -> ReleaseFuture {
        self.finish(Scope::Keys(keys.into_iter().collect()), topology_version)
    }

    fn finish(&self, scope: Scope, topology_version: TopologyVersion) -> ReleaseFuture {
        let mut inner = self.inner.lock();
        let pending: HashSet<LockId> = inner
            .locks
            .iter()
            .filter(|(id, info)| info.topology_version < topology_version && scope.covers(&id.1, info))
            .map(|(id, _)| id.clone())
            .collect();

        if pending.is_empty() {
            return ReleaseFuture::completed();
        }

        let (handle, future) = ReleaseFuture::pending();
        inner.waiters.push(FinishWaiter {
            scope,
            topology_version,
            pending,
            handle,
        });
        future
    }

    /// Locks requested by `origin`.
    pub fn locks_from(&self, origin: NodeId) -> Vec<(CacheVersion, CacheKey)> {
        self.inner
            .lock()
            .locks
            .iter()
            .filter(|(_, info)| info.origin == origin)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of registered locks.
    pub fn lock_count(&self) -> usize {
        self.inner.lock().locks.len()
    }

    /// Fail every pending finish future because `node` is stopping.
    pub fn cancel_waiters(&self, node: NodeId) {
        let waiters = std::mem::take(&mut self.inner.lock().waiters);
        for waiter in waiters {
            waiter.handle.fail_stopping(node);
        }
    }
}
