//! Per-key write serialization on a primary.
//!
//! Atomic writes stamp a version, write through to the store and apply to
//! the entry. All three steps run under the key's lock so that the store
//! sees writes in version order.

use crate::types::CacheKey;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutexes keyed by cache key, created on demand.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other writer holds `key`.
    pub async fn lock(&self, key: &CacheKey) -> KeyGuard<'_> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys with a lock held or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held key lock; the map slot is dropped with the last user.
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: CacheKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own reference left means nobody is waiting.
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl std::fmt::Debug for KeyGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn k(s: &'static str) -> CacheKey {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn test_same_key_waits() {
        let locks = Arc::new(KeyLocks::new());
        let held = locks.lock(&k("a")).await;

        let l = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = l.lock(&k("a")).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.lock(&k("a")).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock(&k("b"))).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
