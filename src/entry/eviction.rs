//! Eviction policies.
//!
//! A policy only orders keys; the entry map decides which of the proposed
//! victims may actually go (locked entries stay).

use crate::config::EvictionPolicyKind;
use crate::types::CacheKey;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Orders keys for eviction.
pub trait EvictionPolicy: Send + Sync + std::fmt::Debug {
    /// A key was added to memory.
    fn on_insert(&self, key: &CacheKey);

    /// A key was read or written.
    fn on_access(&self, key: &CacheKey);

    /// A key left memory.
    fn on_remove(&self, key: &CacheKey);

    /// Up to `limit` keys, best eviction candidate first.
    fn victims(&self, limit: usize) -> Vec<CacheKey>;
}

/// Create the policy for `kind`, or `None` when eviction is disabled.
pub fn create_policy(kind: EvictionPolicyKind) -> Option<Box<dyn EvictionPolicy>> {
    match kind {
        EvictionPolicyKind::None => None,
        EvictionPolicyKind::Fifo => Some(Box::new(FifoPolicy::default())),
        EvictionPolicyKind::Lru => Some(Box::new(LruPolicy::default())),
    }
}

#[derive(Debug, Default)]
struct Sequence {
    next: u64,
    by_seq: BTreeMap<u64, CacheKey>,
    by_key: HashMap<CacheKey, u64>,
}

impl Sequence {
    fn push(&mut self, key: &CacheKey) {
        self.remove(key);
        self.next += 1;
        self.by_seq.insert(self.next, key.clone());
        self.by_key.insert(key.clone(), self.next);
    }

    fn push_if_absent(&mut self, key: &CacheKey) {
        if !self.by_key.contains_key(key) {
            self.push(key);
        }
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(seq) = self.by_key.remove(key) {
            self.by_seq.remove(&seq);
        }
    }

    fn oldest(&self, limit: usize) -> Vec<CacheKey> {
        self.by_seq.values().take(limit).cloned().collect()
    }
}

/// Evicts in insertion order.
#[derive(Debug, Default)]
pub struct FifoPolicy {
    order: Mutex<Sequence>,
}

impl EvictionPolicy for FifoPolicy {
    fn on_insert(&self, key: &CacheKey) {
        self.order.lock().push_if_absent(key);
    }

    fn on_access(&self, key: &CacheKey) {
        self.order.lock().push_if_absent(key);
    }

    fn on_remove(&self, key: &CacheKey) {
        self.order.lock().remove(key);
    }

    fn victims(&self, limit: usize) -> Vec<CacheKey> {
        self.order.lock().oldest(limit)
    }
}

/// Evicts the least recently used key.
#[derive(Debug, Default)]
pub struct LruPolicy {
    order: Mutex<Sequence>,
}

impl EvictionPolicy for LruPolicy {
    fn on_insert(&self, key: &CacheKey) {
        self.order.lock().push(key);
    }

    fn on_access(&self, key: &CacheKey) {
        self.order.lock().push(key);
    }

    fn on_remove(&self, key: &CacheKey) {
        self.order.lock().remove(key);
    }

    fn victims(&self, limit: usize) -> Vec<CacheKey> {
        self.order.lock().oldest(limit)
    }
}
