//! Per-node entry store.
//!
//! Entries hold the authoritative value and version of a key on its owners
//! (and the lock queue on its primary). The map bounds memory through an
//! [`EvictionPolicy`] and spills evicted entries to a [`crate::swap::SwapSpace`].

pub mod cache_entry;
pub mod eviction;
pub mod map;

pub use cache_entry::{CacheEntry, EntrySnapshot};
pub use eviction::{create_policy, EvictionPolicy, FifoPolicy, LruPolicy};
pub use map::{EntryMap, EntryRef, Evicted};
