//! Persistent store integration.
//!
//! The store is an external collaborator reached through [`CacheStore`].
//! Transactional writes carry the transaction version so a store can group
//! them into one session ended by [`CacheStore::tx_end`].

pub mod memory;
pub mod write_behind;

pub use memory::MemoryStore;
pub use write_behind::WriteBehindStore;

use crate::error::StoreError;
use crate::types::{CacheKey, CacheValue};
use crate::version::CacheVersion;
use async_trait::async_trait;
use std::collections::HashMap;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Backing store for read-through and write-through.
#[async_trait]
pub trait CacheStore: Send + Sync + std::fmt::Debug {
    /// Load one value.
    async fn load(&self, key: &CacheKey) -> StoreResult<Option<CacheValue>>;

    /// Load several values; missing keys are absent from the result.
    async fn load_all(&self, keys: &[CacheKey]) -> StoreResult<HashMap<CacheKey, CacheValue>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.load(key).await? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    /// Write one value, inside the session of `tx` if given.
    async fn put(&self, tx: Option<CacheVersion>, key: CacheKey, value: CacheValue) -> StoreResult<()>;

    /// Write several values.
    async fn put_all(
        &self,
        tx: Option<CacheVersion>,
        entries: Vec<(CacheKey, CacheValue)>,
    ) -> StoreResult<()> {
        for (key, value) in entries {
            self.put(tx, key, value).await?;
        }
        Ok(())
    }

    /// Remove one value, inside the session of `tx` if given.
    async fn remove(&self, tx: Option<CacheVersion>, key: CacheKey) -> StoreResult<()>;

    /// Remove several values.
    async fn remove_all(&self, tx: Option<CacheVersion>, keys: Vec<CacheKey>) -> StoreResult<()> {
        for key in keys {
            self.remove(tx, key).await?;
        }
        Ok(())
    }

    /// End the session of `tx`, applying its writes if `commit`.
    async fn tx_end(&self, _tx: CacheVersion, _commit: bool) -> StoreResult<()> {
        Ok(())
    }
}
