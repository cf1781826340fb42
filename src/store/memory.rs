//! In-memory store with failure injection.

use super::{CacheStore, StoreResult};
use crate::error::StoreError;
use crate::types::{CacheKey, CacheValue};
use crate::version::CacheVersion;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
enum SessionWrite {
    Put(CacheKey, CacheValue),
    Remove(CacheKey),
}

/// Store keeping everything in a concurrent map.
///
/// Transactional writes are buffered per session and applied on commit.
/// When failing is switched on, every load and write returns an error. A
/// write delay makes every put and remove sleep before it lands.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<CacheKey, CacheValue>,
    sessions: Mutex<HashMap<CacheVersion, Vec<SessionWrite>>>,
    failing: AtomicBool,
    write_delay_ms: AtomicU64,
    loads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every subsequent put and remove by `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn delay_write(&self) {
        let ms = self.write_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Seed a value directly.
    pub fn insert(&self, key: impl Into<CacheKey>, value: impl Into<CacheValue>) {
        self.data.insert(key.into(), value.into());
    }

    /// Peek at a stored value.
    pub fn get(&self, key: &[u8]) -> Option<CacheValue> {
        self.data.get(key).map(|v| v.clone())
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of load calls served.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Number of values written or removed.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn check(&self, op: &str) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            let reason = format!("injected {op} failure");
            return Err(if op == "load" {
                StoreError::Load(reason)
            } else {
                StoreError::Write(reason)
            });
        }
        Ok(())
    }

    fn apply(&self, write: SessionWrite) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        match write {
            SessionWrite::Put(key, value) => {
                self.data.insert(key, value);
            }
            SessionWrite::Remove(key) => {
                self.data.remove(&key);
            }
        }
    }

    fn write(&self, tx: Option<CacheVersion>, write: SessionWrite) {
        match tx {
            Some(xid) => self.sessions.lock().entry(xid).or_default().push(write),
            None => self.apply(write),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn load(&self, key: &CacheKey) -> StoreResult<Option<CacheValue>> {
        self.check("load")?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.data.get(key).map(|v| v.clone()))
    }

    async fn put(&self, tx: Option<CacheVersion>, key: CacheKey, value: CacheValue) -> StoreResult<()> {
        self.check("put")?;
        self.delay_write().await;
        self.write(tx, SessionWrite::Put(key, value));
        Ok(())
    }

    async fn remove(&self, tx: Option<CacheVersion>, key: CacheKey) -> StoreResult<()> {
        self.check("remove")?;
        self.delay_write().await;
        self.write(tx, SessionWrite::Remove(key));
        Ok(())
    }

    async fn tx_end(&self, tx: CacheVersion, commit: bool) -> StoreResult<()> {
        let writes = self.sessions.lock().remove(&tx).unwrap_or_default();
        if !commit {
            return Ok(());
        }
        self.check("commit")?;
        for write in writes {
            self.apply(write);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn test_direct_writes() {
        let store = MemoryStore::new();
        store.put(None, b("k"), b("v")).await.unwrap();
        assert_eq!(store.load(&b("k")).await.unwrap(), Some(b("v")));
        store.remove(None, b("k")).await.unwrap();
        assert!(store.load(&b("k")).await.unwrap().is_none());
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_session_applied_on_commit_only() {
        let store = MemoryStore::new();
        let tx1 = CacheVersion::new(1, 1, 1, 0);
        let tx2 = CacheVersion::new(1, 2, 1, 0);

        store.put(Some(tx1), b("a"), b("1")).await.unwrap();
        store.put(Some(tx2), b("b"), b("2")).await.unwrap();
        assert!(store.is_empty());

        store.tx_end(tx1, true).await.unwrap();
        store.tx_end(tx2, false).await.unwrap();
        assert_eq!(store.get(b"a"), Some(b("1")));
        assert!(store.get(b"b").is_none());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStore::new();
        store.insert(b("k"), b("v"));
        store.set_failing(true);
        assert!(matches!(store.load(&b("k")).await, Err(StoreError::Load(_))));
        assert!(store.put(None, b("k"), b("x")).await.is_err());
        assert!(store.tx_end(CacheVersion::zero(), false).await.is_ok());

        store.set_failing(false);
        assert_eq!(store.load(&b("k")).await.unwrap(), Some(b("v")));
    }

    #[tokio::test]
    async fn test_write_delay() {
        let store = MemoryStore::new();
        store.set_write_delay(Duration::from_millis(50));
        let started = std::time::Instant::now();
        store.put(None, b("k"), b("v")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));

        store.set_write_delay(Duration::ZERO);
        let started = std::time::Instant::now();
        store.remove(None, b("k")).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_load_all_default() {
        let store = MemoryStore::new();
        store.insert(b("a"), b("1"));
        let found = store.load_all(&[b("a"), b("b")]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.get(&b("a")), Some(&b("1")));
    }
}
