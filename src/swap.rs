//! Overflow tier for entries evicted from memory.

use crate::types::CacheKey;
use bytes::Bytes;
use dashmap::DashMap;

/// Storage for entry bytes that no longer fit in memory.
pub trait SwapSpace: Send + Sync + std::fmt::Debug {
    /// Store the serialized entry for `key`, replacing any previous bytes.
    fn store(&self, key: CacheKey, bytes: Bytes);

    /// Remove and return the bytes for `key`.
    fn unswap(&self, key: &CacheKey) -> Option<Bytes>;

    /// Drop the bytes for `key`.
    fn remove(&self, key: &CacheKey) -> bool;

    /// Number of swapped entries.
    fn size(&self) -> usize;
}

/// In-memory swap space.
#[derive(Debug, Default)]
pub struct MemorySwapSpace {
    entries: DashMap<CacheKey, Bytes>,
}

impl MemorySwapSpace {
    /// Create an empty swap space.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SwapSpace for MemorySwapSpace {
    fn store(&self, key: CacheKey, bytes: Bytes) {
        self.entries.insert(key, bytes);
    }

    fn unswap(&self, key: &CacheKey) -> Option<Bytes> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    fn remove(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    fn size(&self) -> usize {
        self.entries.len()
    }
}
