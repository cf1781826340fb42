//! Near cache: soft local copies of entries owned by other nodes.
//!
//! Copies are kept in a bounded moka cache. An invalidation leaves a
//! tombstone carrying its version so that a response which raced with it
//! cannot reinstall an older value.

use crate::config::NearConfig;
use crate::types::{CacheKey, CacheValue};
use crate::version::CacheVersion;
use moka::sync::Cache;
use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct NearEntry {
    /// `None` marks a tombstone left by an invalidation.
    value: Option<CacheValue>,
    version: CacheVersion,
}

/// Bounded near copies of remote entries.
pub struct NearCache {
    entries: Cache<CacheKey, NearEntry>,
    // Serializes compare-and-set updates; reads go straight to moka.
    update: Mutex<()>,
}

impl NearCache {
    /// Create a near cache from its configuration.
    pub fn new(config: &NearConfig) -> Self {
        let mut builder = Cache::builder().max_capacity(config.max_entries);
        if let Some(ttl) = config.ttl {
            builder = builder.time_to_live(ttl);
        }
        Self {
            entries: builder.build(),
            update: Mutex::new(()),
        }
    }

    /// Cached value and version.
    pub fn get(&self, key: &CacheKey) -> Option<(CacheValue, CacheVersion)> {
        let entry = self.entries.get(key)?;
        entry.value.map(|v| (v, entry.version))
    }

    /// Cache a value read from its primary.
    ///
    /// Rejected when a newer copy is held or an invalidation newer than
    /// `version` was seen.
    pub fn insert(&self, key: CacheKey, value: CacheValue, version: CacheVersion) -> bool {
        let _guard = self.update.lock();
        let accept = match self.entries.get(&key) {
            None => true,
            Some(NearEntry { value: None, version: seen }) => seen <= version,
            Some(NearEntry { value: Some(_), version: held }) => held < version,
        };
        if accept {
            self.entries.insert(
                key,
                NearEntry {
                    value: Some(value),
                    version,
                },
            );
        }
        accept
    }

    /// Drop the copy of `key` unless it is newer than `version`.
    ///
    /// Returns whether a value was dropped.
    pub fn invalidate(&self, key: &CacheKey, version: CacheVersion) -> bool {
        let _guard = self.update.lock();
        let current = self.entries.get(key);
        if current.as_ref().is_some_and(|c| c.version > version) {
            return false;
        }
        let dropped = current.is_some_and(|c| c.value.is_some());
        self.entries.insert(
            key.clone(),
            NearEntry {
                value: None,
                version,
            },
        );
        dropped
    }

    /// Drop every copy.
    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    /// Number of cached values, tombstones excluded.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|(_, e)| e.value.is_some()).count()
    }

    /// Whether no value is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for NearCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NearCache")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}
