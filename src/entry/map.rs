//! Concurrent key to entry map with eviction and swap.

use super::cache_entry::{CacheEntry, EntrySnapshot};
use super::eviction::{create_policy, EvictionPolicy};
use crate::config::EvictionConfig;
use crate::swap::SwapSpace;
use crate::types::{CacheKey, NodeId, PartitionId};
use crate::version::CacheVersion;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{trace, warn};

/// Shared handle to an entry.
pub type EntryRef = Arc<Mutex<CacheEntry>>;

/// An entry that left memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted {
    pub key: CacheKey,
    pub partition: PartitionId,
    pub version: CacheVersion,
    /// Near readers that must drop their copy.
    pub readers: BTreeSet<NodeId>,
    /// Whether the entry went to the swap tier.
    pub swapped: bool,
}

/// Entries of one cache on one node.
///
/// An entry is never locked while a map shard is held, and the map is never
/// touched while an entry is locked. Removal marks the entry so that a
/// concurrent holder of the old reference retries against the map.
pub struct EntryMap {
    entries: DashMap<CacheKey, EntryRef>,
    policy: Option<Box<dyn EvictionPolicy>>,
    max_entries: usize,
    swap: Option<Arc<dyn SwapSpace>>,
}

impl EntryMap {
    /// Create an empty map. Evicted entries go to `swap` when given.
    pub fn new(eviction: &EvictionConfig, swap: Option<Arc<dyn SwapSpace>>) -> Self {
        Self {
            entries: DashMap::new(),
            policy: create_policy(eviction.policy),
            max_entries: eviction.max_entries,
            swap,
        }
    }

    /// Existing entry for `key`, read back from swap if needed.
    pub fn get(&self, key: &CacheKey) -> Option<EntryRef> {
        let found = self.entries.get(key).map(|e| e.value().clone());
        let found = match found {
            Some(entry) => Some(entry),
            None => self.unswap(key),
        };
        if found.is_some() {
            self.touch(key);
        }
        found
    }

    /// Existing in-memory entry without touching the eviction order.
    pub fn peek(&self, key: &CacheKey) -> Option<EntryRef> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Entry for `key`, created if absent.
    pub fn entry(&self, key: &CacheKey, partition: PartitionId) -> EntryRef {
        if let Some(entry) = self.get(key) {
            return entry;
        }
        let mut created = false;
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(CacheEntry::new(key.clone(), partition)))
            })
            .value()
            .clone();
        if created {
            if let Some(policy) = &self.policy {
                policy.on_insert(key);
            }
        }
        entry
    }

    /// Run `f` on the live entry for `key`, creating it if absent.
    pub fn with_entry<R>(
        &self,
        key: &CacheKey,
        partition: PartitionId,
        f: impl FnOnce(&mut CacheEntry) -> R,
    ) -> R {
        let mut f = Some(f);
        loop {
            let entry = self.entry(key, partition);
            let mut guard = entry.lock();
            if guard.is_removed() {
                continue;
            }
            if let Some(f) = f.take() {
                return f(&mut guard);
            }
        }
    }

    /// Run `f` on the live entry for `key` if it exists.
    pub fn with_existing<R>(
        &self,
        key: &CacheKey,
        f: impl FnOnce(&mut CacheEntry) -> R,
    ) -> Option<R> {
        let mut f = Some(f);
        loop {
            let entry = self.get(key)?;
            let mut guard = entry.lock();
            if guard.is_removed() {
                continue;
            }
            return f.take().map(|f| f(&mut guard));
        }
    }

    fn touch(&self, key: &CacheKey) {
        if let Some(policy) = &self.policy {
            policy.on_access(key);
        }
    }

    fn unswap(&self, key: &CacheKey) -> Option<EntryRef> {
        let swap = self.swap.as_ref()?;
        let bytes = swap.unswap(key)?;
        let snapshot: EntrySnapshot = match bincode::deserialize(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Dropping unreadable swapped entry");
                return None;
            }
        };
        trace!(partition = snapshot.partition, "Entry unswapped");
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(CacheEntry::from_snapshot(snapshot))))
            .value()
            .clone();
        if let Some(policy) = &self.policy {
            policy.on_insert(key);
        }
        Some(entry)
    }

    /// Remove `key` if its entry holds no value, lock or reader.
    pub fn remove_if_empty(&self, key: &CacheKey) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, entry| {
                let mut guard = entry.lock();
                if guard.is_removable() {
                    guard.mark_removed();
                    true
                } else {
                    false
                }
            })
            .is_some();
        if removed {
            if let Some(policy) = &self.policy {
                policy.on_remove(key);
            }
        }
        removed
    }

    /// Evict `key` from memory unless it has lock candidates.
    pub fn evict(&self, key: &CacheKey) -> Option<Evicted> {
        let mut snapshot = None;
        let mut readers = BTreeSet::new();
        self.entries.remove_if(key, |_, entry| {
            let mut guard = entry.lock();
            if !guard.candidates().is_empty() {
                return false;
            }
            guard.mark_removed();
            readers = guard.take_readers();
            snapshot = Some(guard.snapshot());
            true
        })?;

        if let Some(policy) = &self.policy {
            policy.on_remove(key);
        }
        let snapshot = snapshot?;
        let swapped = snapshot.value.is_some() && self.swap_out(&snapshot);
        Some(Evicted {
            key: snapshot.key,
            partition: snapshot.partition,
            version: snapshot.version,
            readers,
            swapped,
        })
    }

    fn swap_out(&self, snapshot: &EntrySnapshot) -> bool {
        let Some(swap) = &self.swap else {
            return false;
        };
        match bincode::serialize(snapshot) {
            Ok(bytes) => {
                swap.store(snapshot.key.clone(), Bytes::from(bytes));
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to serialize entry for swap");
                false
            }
        }
    }

    /// Evict entries until the map is within its bound.
    pub fn evict_if_needed(&self) -> Vec<Evicted> {
        let Some(policy) = &self.policy else {
            return Vec::new();
        };
        let mut evicted = Vec::new();
        let excess = self.entries.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return evicted;
        }

        // Locked entries are skipped, so look further down the order.
        let candidates = policy.victims(excess + self.locked_count());
        for key in candidates {
            if evicted.len() >= excess {
                break;
            }
            if let Some(e) = self.evict(&key) {
                evicted.push(e);
            }
        }
        evicted
    }

    /// Drop the in-memory and swapped state of `key`.
    pub fn purge(&self, key: &CacheKey) {
        if let Some((_, entry)) = self.entries.remove(key) {
            entry.lock().mark_removed();
            if let Some(policy) = &self.policy {
                policy.on_remove(key);
            }
        }
        if let Some(swap) = &self.swap {
            swap.remove(key);
        }
    }

    /// Entries with a value in the given partitions.
    pub fn partition_entries(&self, partitions: &HashSet<PartitionId>) -> Vec<EntrySnapshot> {
        self.refs()
            .into_iter()
            .filter_map(|entry| {
                let guard = entry.lock();
                (partitions.contains(&guard.partition()) && guard.value().is_some())
                    .then(|| guard.snapshot())
            })
            .collect()
    }

    /// Remove unlocked entries of a partition no longer owned here.
    pub fn clear_partition(&self, partition: PartitionId) -> usize {
        let keys: Vec<CacheKey> = self
            .refs()
            .into_iter()
            .filter_map(|entry| {
                let guard = entry.lock();
                (guard.partition() == partition && guard.candidates().is_empty())
                    .then(|| guard.key().clone())
            })
            .collect();
        let count = keys.len();
        for key in keys {
            self.purge(&key);
        }
        count
    }

    /// Unregister `node` as a near reader of every entry. Returns the keys
    /// it was reading.
    pub fn remove_reader_everywhere(&self, node: NodeId) -> Vec<CacheKey> {
        self.refs()
            .into_iter()
            .filter_map(|entry| {
                let mut guard = entry.lock();
                guard.remove_reader(node).then(|| guard.key().clone())
            })
            .collect()
    }

    fn refs(&self) -> Vec<EntryRef> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Keys held in memory.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of in-memory entries with a live value.
    pub fn value_count(&self) -> usize {
        self.refs()
            .into_iter()
            .filter(|e| e.lock().value().is_some())
            .count()
    }

    /// Number of in-memory entries whose lock is owned.
    pub fn locked_count(&self) -> usize {
        self.refs().into_iter().filter(|e| e.lock().is_locked()).count()
    }

    /// Number of in-memory entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entry is in memory.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of swapped entries.
    pub fn swap_size(&self) -> usize {
        self.swap.as_ref().map(|s| s.size()).unwrap_or(0)
    }
}

impl std::fmt::Debug for EntryMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryMap")
            .field("entries", &self.entries.len())
            .field("max_entries", &self.max_entries)
            .field("policy", &self.policy)
            .field("swap", &self.swap_size())
            .finish()
    }
}
