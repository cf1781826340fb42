//! A single cache entry and its lock queue.

use crate::mvcc::{CandidateQueue, LockOutcome, MvccCandidate, Released};
use crate::types::{CacheKey, CacheValue, NodeId, PartitionId};
use crate::version::CacheVersion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Value, version, expiry, lock candidates and near readers of one key.
///
/// Mutated only under the entry's mutex (see [`super::EntryRef`]). Lock
/// waiters park on [`CacheEntry::lock_notify`], which is signalled whenever
/// the owner changes.
#[derive(Debug)]
pub struct CacheEntry {
    key: CacheKey,
    partition: PartitionId,
    value: Option<CacheValue>,
    version: CacheVersion,
    expire_at: Option<Instant>,
    candidates: CandidateQueue,
    readers: BTreeSet<NodeId>,
    lock_notify: Arc<Notify>,
    removed: bool,
}

impl CacheEntry {
    /// Create an empty entry.
    pub fn new(key: CacheKey, partition: PartitionId) -> Self {
        Self {
            key,
            partition,
            value: None,
            version: CacheVersion::zero(),
            expire_at: None,
            candidates: CandidateQueue::new(),
            readers: BTreeSet::new(),
            lock_notify: Arc::new(Notify::new()),
            removed: false,
        }
    }

    /// Rebuild an entry from its serialized form.
    pub fn from_snapshot(snapshot: EntrySnapshot) -> Self {
        let mut entry = Self::new(snapshot.key, snapshot.partition);
        entry.value = snapshot.value;
        entry.version = snapshot.version;
        entry.expire_at = snapshot
            .ttl_remaining_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        entry
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Version of the last applied write.
    pub fn version(&self) -> CacheVersion {
        self.version
    }

    /// Current value; `None` if absent or expired.
    pub fn value(&self) -> Option<&CacheValue> {
        if self.is_expired() {
            return None;
        }
        self.value.as_ref()
    }

    /// Whether the entry has a TTL that passed.
    pub fn is_expired(&self) -> bool {
        self.expire_at.is_some_and(|at| at <= Instant::now())
    }

    /// Time left before expiry.
    pub fn ttl_remaining(&self) -> Option<Duration> {
        self.expire_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Apply a write unconditionally. `None` removes the value.
    pub fn apply(&mut self, value: Option<CacheValue>, version: CacheVersion, ttl: Option<Duration>) {
        self.expire_at = match (&value, ttl) {
            (Some(_), Some(ttl)) => Some(Instant::now() + ttl),
            _ => None,
        };
        self.value = value;
        self.version = version;
    }

    /// Apply a write only if `version` is newer than the entry's.
    ///
    /// An identical version is a duplicate delivery and is ignored.
    pub fn apply_if_newer(
        &mut self,
        value: Option<CacheValue>,
        version: CacheVersion,
        ttl: Option<Duration>,
    ) -> bool {
        if version <= self.version {
            return false;
        }
        self.apply(value, version, ttl);
        true
    }

    /// Drop the value of an expired entry.
    pub fn purge_expired(&mut self) -> bool {
        if self.is_expired() {
            self.value = None;
            self.expire_at = None;
            true
        } else {
            false
        }
    }

    /// Add a lock candidate.
    pub fn add_candidate(&mut self, candidate: MvccCandidate) -> LockOutcome {
        let outcome = self.candidates.add(candidate);
        if outcome == LockOutcome::Acquired {
            self.lock_notify.notify_waiters();
        }
        outcome
    }

    /// Release one acquisition of the candidate with `version`.
    pub fn release_candidate(&mut self, version: CacheVersion) -> Option<Released> {
        let released = self.candidates.release(version);
        self.after_release(&released);
        released
    }

    /// Release one explicit-lock acquisition of `owner_id` on `node_id`.
    pub fn release_owner(&mut self, node_id: NodeId, owner_id: u64) -> Option<Released> {
        let released = self.candidates.release_owner(node_id, owner_id);
        self.after_release(&released);
        released
    }

    /// Remove the candidate with `version` with all its reentries.
    pub fn remove_candidate(&mut self, version: CacheVersion) -> Option<Released> {
        let released = self.candidates.remove(version);
        self.after_release(&released);
        released
    }

    fn after_release(&self, released: &Option<Released>) {
        if released.as_ref().is_some_and(|r| r.removed) {
            self.lock_notify.notify_waiters();
        }
    }

    /// The lock candidates.
    pub fn candidates(&self) -> &CandidateQueue {
        &self.candidates
    }

    /// Whether some candidate owns the lock.
    pub fn is_locked(&self) -> bool {
        self.candidates.is_locked()
    }

    /// Notified when the lock owner changes.
    pub fn lock_notify(&self) -> Arc<Notify> {
        self.lock_notify.clone()
    }

    /// Near nodes holding a copy of this entry.
    pub fn readers(&self) -> &BTreeSet<NodeId> {
        &self.readers
    }

    /// Register a near reader.
    pub fn add_reader(&mut self, node: NodeId) {
        self.readers.insert(node);
    }

    /// Unregister a near reader.
    pub fn remove_reader(&mut self, node: NodeId) -> bool {
        self.readers.remove(&node)
    }

    /// Take every reader, leaving the set empty.
    pub fn take_readers(&mut self) -> BTreeSet<NodeId> {
        std::mem::take(&mut self.readers)
    }

    /// Whether the entry carries no state worth keeping in the map.
    pub fn is_removable(&self) -> bool {
        self.value().is_none() && self.candidates.is_empty() && self.readers.is_empty()
    }

    /// Flag the entry as detached from its map. Holders of a stale
    /// reference must look the key up again.
    pub fn mark_removed(&mut self) {
        self.removed = true;
    }

    /// Whether the entry was detached from its map.
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Serializable copy of the data part of the entry.
    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            key: self.key.clone(),
            partition: self.partition,
            value: self.value().cloned(),
            version: self.version,
            ttl_remaining_ms: self.ttl_remaining().map(|d| d.as_millis() as u64),
        }
    }
}

/// Entry data as moved between nodes or into swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub key: CacheKey,
    pub partition: PartitionId,
    pub value: Option<CacheValue>,
    pub version: CacheVersion,
    pub ttl_remaining_ms: Option<u64>,
}
