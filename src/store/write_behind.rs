//! Write-behind store: buffers writes and flushes them in batches.
//!
//! ```text
//!   put/remove ──► buffer (latest write per key) ──► flusher task ──► inner store
//!                       │  size >= flush_size ─────────► wake
//!                       └─ every flush_frequency ──────► wake
//! ```
//!
//! Loads consult the buffer first, then the batch being flushed, so
//! unflushed writes stay visible until the inner store has them. A failed
//! flush puts the batch back unless a newer write for the key arrived.

use super::{CacheStore, StoreResult};
use crate::config::WriteBehindConfig;
use crate::types::{CacheKey, CacheValue};
use crate::version::CacheVersion;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingWrite {
    Put(CacheValue),
    Remove,
}

/// Store wrapper flushing buffered writes asynchronously.
pub struct WriteBehindStore {
    inner: Arc<dyn CacheStore>,
    config: WriteBehindConfig,
    buffer: Mutex<BTreeMap<CacheKey, PendingWrite>>,
    flushing: Mutex<BTreeMap<CacheKey, PendingWrite>>,
    sessions: Mutex<HashMap<CacheVersion, Vec<(CacheKey, PendingWrite)>>>,
    flush_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    cancel: CancellationToken,
    flushed: AtomicU64,
}

impl WriteBehindStore {
    /// Wrap `inner` and spawn the flusher task.
    pub fn start(inner: Arc<dyn CacheStore>, config: WriteBehindConfig) -> Arc<Self> {
        let store = Arc::new(Self {
            inner,
            config,
            buffer: Mutex::new(BTreeMap::new()),
            flushing: Mutex::new(BTreeMap::new()),
            sessions: Mutex::new(HashMap::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            flushed: AtomicU64::new(0),
        });
        tokio::spawn(Self::run_flusher(Arc::downgrade(&store), store.cancel.clone()));
        store
    }

    async fn run_flusher(store: Weak<Self>, cancel: CancellationToken) {
        loop {
            let (frequency, wake) = match store.upgrade() {
                Some(s) => (s.config.flush_frequency, s),
                None => return,
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(frequency) => {}
                _ = wake.wake.notified() => {}
            }
            if let Err(e) = wake.flush().await {
                warn!(error = %e, pending = wake.pending(), "Write-behind flush failed");
            }
        }
    }

    /// Number of buffered keys.
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Total number of keys written to the inner store.
    pub fn flushed_count(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    /// Write every buffered key to the inner store.
    pub async fn flush(&self) -> StoreResult<usize> {
        let _guard = self.flush_lock.lock().await;
        let batch = {
            let mut buffer = self.buffer.lock();
            let batch = std::mem::take(&mut *buffer);
            // Swapped under the buffer lock so a load never misses both.
            self.flushing.lock().clone_from(&batch);
            batch
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let mut puts = Vec::new();
        let mut removes = Vec::new();
        for (key, write) in &batch {
            match write {
                PendingWrite::Put(value) => puts.push((key.clone(), value.clone())),
                PendingWrite::Remove => removes.push(key.clone()),
            }
        }

        let result: StoreResult<()> = async {
            if !puts.is_empty() {
                self.inner.put_all(None, puts).await?;
            }
            if !removes.is_empty() {
                self.inner.remove_all(None, removes).await?;
            }
            Ok(())
        }
        .await;

        {
            let mut buffer = self.buffer.lock();
            self.flushing.lock().clear();
            if result.is_err() {
                for (key, write) in &batch {
                    buffer.entry(key.clone()).or_insert_with(|| write.clone());
                }
            }
        }

        result?;
        let count = batch.len();
        self.flushed.fetch_add(count as u64, Ordering::Relaxed);
        debug!(count, "Write-behind batch flushed");
        Ok(count)
    }

    /// Stop the flusher and flush what is left.
    pub async fn stop(&self) -> StoreResult<usize> {
        self.cancel.cancel();
        self.flush().await
    }

    fn enqueue(&self, key: CacheKey, write: PendingWrite) {
        let len = {
            let mut buffer = self.buffer.lock();
            buffer.insert(key, write);
            buffer.len()
        };
        if len >= self.config.flush_size {
            self.wake.notify_one();
        }
    }

    fn write(&self, tx: Option<CacheVersion>, key: CacheKey, write: PendingWrite) {
        match tx {
            Some(xid) => self.sessions.lock().entry(xid).or_default().push((key, write)),
            None => self.enqueue(key, write),
        }
    }
}

#[async_trait]
impl CacheStore for WriteBehindStore {
    async fn load(&self, key: &CacheKey) -> StoreResult<Option<CacheValue>> {
        let buffered = {
            let buffer = self.buffer.lock();
            buffer
                .get(key)
                .cloned()
                .or_else(|| self.flushing.lock().get(key).cloned())
        };
        match buffered {
            Some(PendingWrite::Put(value)) => Ok(Some(value)),
            Some(PendingWrite::Remove) => Ok(None),
            None => self.inner.load(key).await,
        }
    }

    async fn put(&self, tx: Option<CacheVersion>, key: CacheKey, value: CacheValue) -> StoreResult<()> {
        self.write(tx, key, PendingWrite::Put(value));
        Ok(())
    }

    async fn remove(&self, tx: Option<CacheVersion>, key: CacheKey) -> StoreResult<()> {
        self.write(tx, key, PendingWrite::Remove);
        Ok(())
    }

    async fn tx_end(&self, tx: CacheVersion, commit: bool) -> StoreResult<()> {
        let writes = self.sessions.lock().remove(&tx).unwrap_or_default();
        if commit {
            for (key, write) in writes {
                self.enqueue(key, write);
            }
        }
        Ok(())
    }
}

impl Drop for WriteBehindStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for WriteBehindStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBehindStore")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .field("flushed", &self.flushed_count())
            .finish()
    }
}
