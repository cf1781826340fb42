//! Bounded window of completed transaction versions.

use crate::version::CacheVersion;
use std::collections::{BTreeSet, VecDeque};

/// Versions of recently finished transactions, oldest evicted first.
#[derive(Debug)]
pub struct CompletedVersions {
    capacity: usize,
    order: VecDeque<CacheVersion>,
    set: BTreeSet<CacheVersion>,
}

impl CompletedVersions {
    /// Create a window holding up to `capacity` versions.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            set: BTreeSet::new(),
        }
    }

    /// Record a finished transaction. Returns false if already recorded.
    pub fn add(&mut self, version: CacheVersion) -> bool {
        if !self.set.insert(version) {
            return false;
        }
        self.order.push_back(version);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    /// Whether the transaction is known to be finished.
    pub fn contains(&self, version: &CacheVersion) -> bool {
        self.set.contains(version)
    }

    /// Whether `version` predates the window, so its outcome can no longer
    /// be told apart from a transaction that never ran here.
    pub fn is_missing(&self, version: &CacheVersion) -> bool {
        self.order.len() >= self.capacity
            && !self.set.contains(version)
            && self.set.first().is_some_and(|min| version < min)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
