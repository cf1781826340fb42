//! Core types used throughout the cache grid.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Partition index in `[0, partitions)`.
pub type PartitionId = u32;

/// Monotonic topology version, incremented on every join or leave.
pub type TopologyVersion = u64;

/// Raw cache key bytes.
pub type CacheKey = Bytes;

/// Raw cache value bytes.
pub type CacheValue = Bytes;

/// How data is spread across data nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CacheMode {
    /// Each partition is owned by a primary plus configured backups.
    #[default]
    Partitioned,
    /// Every data node owns every partition.
    Replicated,
}

/// Consistency model of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AtomicityMode {
    /// Single-key updates without transactions.
    #[default]
    Atomic,
    /// Multi-key transactions with MVCC locking.
    Transactional,
}

/// Role a node plays for a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DistributionMode {
    /// Data node without a near cache.
    #[default]
    PartitionedOnly,
    /// Data node that also keeps near copies of remote entries.
    NearPartitioned,
    /// Non-data node that always goes to the owners.
    ClientOnly,
    /// Non-data node with a near cache.
    NearOnly,
}

impl DistributionMode {
    /// Whether nodes in this mode take part in affinity assignment.
    pub fn is_affinity_node(self) -> bool {
        matches!(
            self,
            DistributionMode::PartitionedOnly | DistributionMode::NearPartitioned
        )
    }

    /// Whether nodes in this mode keep a near cache.
    pub fn near_enabled(self) -> bool {
        matches!(
            self,
            DistributionMode::NearPartitioned | DistributionMode::NearOnly
        )
    }
}

/// Who assigns versions to atomic writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WriteOrderMode {
    /// The primary stamps and serializes writes, then replicates.
    #[default]
    Primary,
    /// The originating node stamps the write; owners keep the highest version.
    Clock,
}

/// When a write is acknowledged relative to backup replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WriteSyncMode {
    /// Wait for primary and all backups.
    #[default]
    FullSync,
    /// Wait for the primary only.
    PrimarySync,
    /// Do not wait for replication.
    FullAsync,
}

/// How a node obtains data for partitions it starts owning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PreloadMode {
    /// Preload completes before the node finishes joining.
    #[default]
    Sync,
    /// Preload runs in the background after the join.
    Async,
    /// No preloading; data arrives only through new writes.
    None,
}

/// Where entry values live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MemoryMode {
    /// On-heap entries, evicted entries overflow to swap if enabled.
    #[default]
    OnheapTiered,
    /// On-heap entries always overflowing to the offheap tier.
    OffheapTiered,
    /// Values kept in the offheap tier only.
    OffheapValues,
}

/// Transaction locking strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxConcurrency {
    /// Locks acquired at commit time.
    Optimistic,
    /// Locks acquired on access.
    Pessimistic,
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxIsolation {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl TxIsolation {
    /// Whether reads are repeatable within the transaction.
    pub fn is_repeatable(self) -> bool {
        !matches!(self, TxIsolation::ReadCommitted)
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxState {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    MarkedRollback,
    RollingBack,
    RolledBack,
    /// Outcome unknown after a partial commit failure.
    Invalidated,
}

impl TxState {
    /// Whether the transaction has finished.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            TxState::Committed | TxState::RolledBack | TxState::Invalidated
        )
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Local cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries with a value held in memory.
    pub entry_count: u64,
    /// Entries held in the near cache.
    pub near_entry_count: u64,
    /// Entries moved to the swap tier.
    pub swapped_count: u64,
    /// Entries with at least one lock candidate.
    pub locked_count: u64,
    /// Local read hits.
    pub hits: u64,
    /// Local read misses.
    pub misses: u64,
}
