//! Configuration types for the cache grid.

use crate::error::{ConfigError, Result};
use crate::types::{
    AtomicityMode, CacheMode, DistributionMode, MemoryMode, NodeId, PreloadMode, TxConcurrency,
    TxIsolation, WriteOrderMode, WriteSyncMode,
};
use std::collections::HashSet;
use std::time::Duration;

/// Name of the cache created when none is given.
pub const DEFAULT_CACHE_NAME: &str = "default";

/// Default number of partitions.
pub const DEFAULT_PARTITIONS: u32 = 1024;

/// Which affinity function a cache uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityKind {
    /// Virtual-node hash ring with `replicas` vnodes per node.
    ConsistentHash { replicas: usize },
    /// Rendezvous (highest random weight) hashing.
    Rendezvous,
    /// Balanced partition counts per node.
    Fair,
}

impl AffinityKind {
    /// Stable name used when comparing configurations across nodes.
    pub fn name(&self) -> &'static str {
        match self {
            AffinityKind::ConsistentHash { .. } => "consistent-hash",
            AffinityKind::Rendezvous => "rendezvous",
            AffinityKind::Fair => "fair",
        }
    }
}

/// Affinity configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityConfig {
    /// Function to use.
    pub kind: AffinityKind,

    /// Number of partitions.
    pub partitions: u32,

    /// Keep backups off the primary's host.
    pub exclude_neighbors: bool,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            kind: AffinityKind::Rendezvous,
            partitions: DEFAULT_PARTITIONS,
            exclude_neighbors: false,
        }
    }
}

impl AffinityConfig {
    /// Set the function.
    pub fn with_kind(mut self, kind: AffinityKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the partition count.
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    /// Enable or disable neighbour exclusion.
    pub fn with_exclude_neighbors(mut self, exclude: bool) -> Self {
        self.exclude_neighbors = exclude;
        self
    }
}

/// Transaction configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxConfig {
    /// Concurrency used by `tx_start_default`.
    pub default_concurrency: TxConcurrency,

    /// Isolation used by `tx_start_default`.
    pub default_isolation: TxIsolation,

    /// Lock wait deadline for transactions.
    pub default_timeout: Duration,

    /// Number of completed transaction versions remembered per node.
    pub completed_versions_window: usize,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            default_concurrency: TxConcurrency::Pessimistic,
            default_isolation: TxIsolation::RepeatableRead,
            default_timeout: Duration::from_secs(10),
            completed_versions_window: 1024,
        }
    }
}

/// Eviction policy for in-memory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicyKind {
    /// Never evict.
    #[default]
    None,
    /// Evict in insertion order.
    Fifo,
    /// Evict the least recently used entry.
    Lru,
}

/// Eviction configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EvictionConfig {
    /// Policy to apply.
    pub policy: EvictionPolicyKind,

    /// Maximum number of in-memory entries before eviction kicks in.
    pub max_entries: usize,

    /// Move evicted entries to the swap tier instead of dropping them.
    pub swap_enabled: bool,
}

impl EvictionConfig {
    /// Evict with `policy` above `max_entries`.
    pub fn new(policy: EvictionPolicyKind, max_entries: usize) -> Self {
        Self {
            policy,
            max_entries,
            swap_enabled: false,
        }
    }

    /// Enable or disable the swap tier.
    pub fn with_swap(mut self, enabled: bool) -> Self {
        self.swap_enabled = enabled;
        self
    }
}

/// Near cache configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NearConfig {
    /// Maximum near entries.
    pub max_entries: u64,

    /// Time after which near entries are dropped.
    pub ttl: Option<Duration>,
}

impl Default for NearConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: None,
        }
    }
}

/// Write-behind configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBehindConfig {
    /// Flush when this many keys are buffered.
    pub flush_size: usize,

    /// Flush at least this often.
    pub flush_frequency: Duration,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            flush_size: 1024,
            flush_frequency: Duration::from_secs(5),
        }
    }
}

/// Persistent store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreConfig {
    /// Load missing values from the store.
    pub read_through: bool,

    /// Write committed values to the store.
    pub write_through: bool,

    /// Buffer store writes and flush them asynchronously.
    pub write_behind: Option<WriteBehindConfig>,
}

impl StoreConfig {
    /// Read-through and write-through.
    pub fn write_through() -> Self {
        Self {
            read_through: true,
            write_through: true,
            write_behind: None,
        }
    }

    /// Read-through with write-behind.
    pub fn write_behind(config: WriteBehindConfig) -> Self {
        Self {
            read_through: true,
            write_through: true,
            write_behind: Some(config),
        }
    }
}

/// Configuration of one cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Cache name, unique per node.
    pub name: String,

    /// Partitioned or replicated.
    pub cache_mode: CacheMode,

    /// Atomic or transactional.
    pub atomicity_mode: AtomicityMode,

    /// Role of the local node for this cache.
    pub distribution_mode: DistributionMode,

    /// Who stamps atomic writes.
    pub write_order_mode: WriteOrderMode,

    /// When writes are acknowledged relative to backups.
    pub write_sync_mode: WriteSyncMode,

    /// How new owners obtain data.
    pub preload_mode: PreloadMode,

    /// Where values live.
    pub memory_mode: MemoryMode,

    /// Offheap tier limit in bytes; required by the offheap memory modes.
    pub offheap_max_memory: Option<u64>,

    /// Number of backups per partition (ignored in replicated mode).
    pub backups: usize,

    /// Affinity configuration.
    pub affinity: AffinityConfig,

    /// Transaction configuration.
    pub tx: TxConfig,

    /// Eviction configuration.
    pub eviction: EvictionConfig,

    /// Near cache configuration.
    pub near: NearConfig,

    /// Persistent store configuration.
    pub store: StoreConfig,

    /// TTL applied to writes without an explicit TTL.
    pub default_ttl: Option<Duration>,

    /// Maximum concurrently running async operations; 0 means unlimited.
    pub max_concurrent_async_ops: usize,

    /// How many times an operation is remapped after a topology change.
    pub max_remap_attempts: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CACHE_NAME.to_string(),
            cache_mode: CacheMode::Partitioned,
            atomicity_mode: AtomicityMode::Atomic,
            distribution_mode: DistributionMode::PartitionedOnly,
            write_order_mode: WriteOrderMode::Primary,
            write_sync_mode: WriteSyncMode::FullSync,
            preload_mode: PreloadMode::Sync,
            memory_mode: MemoryMode::OnheapTiered,
            offheap_max_memory: None,
            backups: 0,
            affinity: AffinityConfig::default(),
            tx: TxConfig::default(),
            eviction: EvictionConfig::default(),
            near: NearConfig::default(),
            store: StoreConfig::default(),
            default_ttl: None,
            max_concurrent_async_ops: 500,
            max_remap_attempts: 8,
        }
    }
}

impl CacheConfig {
    /// Create a configuration for the named cache.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the cache mode.
    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    /// Set the atomicity mode.
    pub fn with_atomicity_mode(mut self, mode: AtomicityMode) -> Self {
        self.atomicity_mode = mode;
        self
    }

    /// Set the distribution mode.
    pub fn with_distribution_mode(mut self, mode: DistributionMode) -> Self {
        self.distribution_mode = mode;
        self
    }

    /// Set the write order mode.
    pub fn with_write_order_mode(mut self, mode: WriteOrderMode) -> Self {
        self.write_order_mode = mode;
        self
    }

    /// Set the write sync mode.
    pub fn with_write_sync_mode(mut self, mode: WriteSyncMode) -> Self {
        self.write_sync_mode = mode;
        self
    }

    /// Set the preload mode.
    pub fn with_preload_mode(mut self, mode: PreloadMode) -> Self {
        self.preload_mode = mode;
        self
    }

    /// Set the memory mode.
    pub fn with_memory_mode(mut self, mode: MemoryMode) -> Self {
        self.memory_mode = mode;
        self
    }

    /// Set the offheap tier limit.
    pub fn with_offheap_max_memory(mut self, bytes: u64) -> Self {
        self.offheap_max_memory = Some(bytes);
        self
    }

    /// Set the number of backups.
    pub fn with_backups(mut self, backups: usize) -> Self {
        self.backups = backups;
        self
    }

    /// Set the affinity configuration.
    pub fn with_affinity(mut self, affinity: AffinityConfig) -> Self {
        self.affinity = affinity;
        self
    }

    /// Set the transaction configuration.
    pub fn with_tx(mut self, tx: TxConfig) -> Self {
        self.tx = tx;
        self
    }

    /// Set the transaction lock timeout.
    pub fn with_tx_timeout(mut self, timeout: Duration) -> Self {
        self.tx.default_timeout = timeout;
        self
    }

    /// Set the eviction configuration.
    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = eviction;
        self
    }

    /// Set the near cache configuration.
    pub fn with_near(mut self, near: NearConfig) -> Self {
        self.near = near;
        self
    }

    /// Set the store configuration.
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set the async operation limit; 0 disables it.
    pub fn with_max_concurrent_async_ops(mut self, max: usize) -> Self {
        self.max_concurrent_async_ops = max;
        self
    }

    /// Backups as seen by the affinity function.
    pub fn effective_backups(&self) -> usize {
        match self.cache_mode {
            CacheMode::Partitioned => self.backups,
            CacheMode::Replicated => usize::MAX,
        }
    }

    /// Whether the cache runs transactions.
    pub fn is_transactional(&self) -> bool {
        self.atomicity_mode == AtomicityMode::Transactional
    }

    /// Validate the configuration on its own.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| -> Result<()> {
            Err(ConfigError::Invalid {
                cache: self.name.clone(),
                reason: reason.to_string(),
            }
            .into())
        };

        if self.name.is_empty() {
            return invalid("cache name must not be empty");
        }
        if self.affinity.partitions == 0 {
            return invalid("partition count must be positive");
        }
        if let AffinityKind::ConsistentHash { replicas } = self.affinity.kind {
            if replicas == 0 {
                return invalid("consistent hash replicas must be positive");
            }
        }
        if self.eviction.policy != EvictionPolicyKind::None && self.eviction.max_entries == 0 {
            return invalid("eviction policy requires max_entries > 0");
        }
        if self.memory_mode != MemoryMode::OnheapTiered && self.offheap_max_memory.is_none() {
            return invalid("offheap memory modes require offheap_max_memory");
        }
        if self.memory_mode == MemoryMode::OffheapValues
            && self.eviction.policy != EvictionPolicyKind::None
        {
            return invalid("OFFHEAP_VALUES cannot be combined with an eviction policy");
        }
        if self.cache_mode == CacheMode::Replicated
            && self.distribution_mode.near_enabled()
            && self.distribution_mode.is_affinity_node()
        {
            return invalid("replicated caches cannot use a near cache on data nodes");
        }
        if self.store.write_behind.is_some() && !self.store.write_through {
            return invalid("write-behind requires write-through");
        }
        if let Some(wb) = &self.store.write_behind {
            if wb.flush_size == 0 || wb.flush_frequency.is_zero() {
                return invalid("write-behind flush size and frequency must be positive");
            }
        }
        if self.tx.completed_versions_window == 0 {
            return invalid("completed versions window must be positive");
        }
        if self.max_remap_attempts == 0 {
            return invalid("max_remap_attempts must be positive");
        }
        Ok(())
    }

    /// Check that a cache with the same name on another node agrees on the
    /// attributes every node must share.
    pub fn check_compatible(&self, remote: &CacheConfig) -> Result<()> {
        let mismatch = |attribute: &'static str, local: String, remote: String| -> Result<()> {
            Err(ConfigError::Mismatch {
                cache: self.name.clone(),
                attribute,
                local,
                remote,
            }
            .into())
        };

        if self.cache_mode != remote.cache_mode {
            return mismatch(
                "cache_mode",
                format!("{:?}", self.cache_mode),
                format!("{:?}", remote.cache_mode),
            );
        }
        if self.atomicity_mode != remote.atomicity_mode {
            return mismatch(
                "atomicity_mode",
                format!("{:?}", self.atomicity_mode),
                format!("{:?}", remote.atomicity_mode),
            );
        }
        if self.preload_mode != remote.preload_mode {
            return mismatch(
                "preload_mode",
                format!("{:?}", self.preload_mode),
                format!("{:?}", remote.preload_mode),
            );
        }
        if self.affinity.kind.name() != remote.affinity.kind.name() {
            return mismatch(
                "affinity",
                self.affinity.kind.name().to_string(),
                remote.affinity.kind.name().to_string(),
            );
        }
        if self.affinity.partitions != remote.affinity.partitions {
            return mismatch(
                "affinity_partitions",
                self.affinity.partitions.to_string(),
                remote.affinity.partitions.to_string(),
            );
        }
        if self.affinity.exclude_neighbors != remote.affinity.exclude_neighbors {
            return mismatch(
                "affinity_exclude_neighbors",
                self.affinity.exclude_neighbors.to_string(),
                remote.affinity.exclude_neighbors.to_string(),
            );
        }
        if self.backups != remote.backups {
            return mismatch(
                "backups",
                self.backups.to_string(),
                remote.backups.to_string(),
            );
        }
        if self.write_order_mode != remote.write_order_mode {
            return mismatch(
                "write_order_mode",
                format!("{:?}", self.write_order_mode),
                format!("{:?}", remote.write_order_mode),
            );
        }
        if self.memory_mode != remote.memory_mode {
            return mismatch(
                "memory_mode",
                format!("{:?}", self.memory_mode),
                format!("{:?}", remote.memory_mode),
            );
        }
        Ok(())
    }
}

/// Configuration of one grid node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Unique node identifier.
    pub node_id: NodeId,

    /// Client nodes never own partitions.
    pub client: bool,

    /// Host identity used for neighbour exclusion.
    pub macs: String,

    /// Data center of the node.
    pub data_center_id: u8,

    /// Caches started on the node.
    pub caches: Vec<CacheConfig>,
}

impl NodeConfig {
    /// Create a data node configuration without caches.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            client: false,
            macs: format!("host-{node_id}"),
            data_center_id: 0,
            caches: Vec::new(),
        }
    }

    /// Add a cache.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.caches.push(cache);
        self
    }

    /// Mark the node as a client.
    pub fn with_client(mut self, client: bool) -> Self {
        self.client = client;
        self
    }

    /// Set the host identity.
    pub fn with_macs(mut self, macs: impl Into<String>) -> Self {
        self.macs = macs.into();
        self
    }

    /// Set the data center.
    pub fn with_data_center_id(mut self, id: u8) -> Self {
        self.data_center_id = id;
        self
    }

    /// Find a cache configuration by name.
    pub fn cache(&self, name: &str) -> Option<&CacheConfig> {
        self.caches.iter().find(|c| c.name == name)
    }

    /// Validate every cache and reject duplicate names.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for cache in &self.caches {
            if !names.insert(cache.name.as_str()) {
                return Err(ConfigError::DuplicateCache(cache.name.clone()).into());
            }
            cache.validate()?;
        }
        Ok(())
    }

    /// Check every cache shared with `remote` for compatibility.
    pub fn check_compatible(&self, remote: &NodeConfig) -> Result<()> {
        for cache in &self.caches {
            if let Some(other) = remote.cache(&cache.name) {
                cache.check_compatible(other)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::default();
        assert_eq!(config.name, DEFAULT_CACHE_NAME);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = CacheConfig::new("orders")
            .with_backups(2)
            .with_atomicity_mode(AtomicityMode::Transactional)
            .with_tx_timeout(Duration::from_millis(250))
            .with_affinity(AffinityConfig::default().with_partitions(64));

        assert_eq!(config.backups, 2);
        assert!(config.is_transactional());
        assert_eq!(config.tx.default_timeout, Duration::from_millis(250));
        assert_eq!(config.affinity.partitions, 64);
        assert_eq!(config.effective_backups(), 2);
        assert_eq!(
            config.with_cache_mode(CacheMode::Replicated).effective_backups(),
            usize::MAX
        );
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let zero_parts = CacheConfig::default().with_affinity(AffinityConfig::default().with_partitions(0));
        assert!(zero_parts.validate().is_err());

        let evict_zero = CacheConfig::default().with_eviction(EvictionConfig::new(EvictionPolicyKind::Lru, 0));
        assert!(evict_zero.validate().is_err());

        let offheap = CacheConfig::default().with_memory_mode(MemoryMode::OffheapTiered);
        assert!(offheap.validate().is_err());
        assert!(offheap.with_offheap_max_memory(0).validate().is_ok());

        let values_with_eviction = CacheConfig::default()
            .with_memory_mode(MemoryMode::OffheapValues)
            .with_offheap_max_memory(1 << 20)
            .with_eviction(EvictionConfig::new(EvictionPolicyKind::Fifo, 10));
        assert!(values_with_eviction.validate().is_err());
    }

    #[test]
    fn test_duplicate_cache_names() {
        let node = NodeConfig::new(1)
            .with_cache(CacheConfig::new("a"))
            .with_cache(CacheConfig::new("a"));
        match node.validate() {
            Err(Error::Config(ConfigError::DuplicateCache(name))) => assert_eq!(name, "a"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_compatibility_checks() {
        let base = CacheConfig::new("c");

        let cases = vec![
            ("preload_mode", base.clone().with_preload_mode(PreloadMode::Async)),
            ("cache_mode", base.clone().with_cache_mode(CacheMode::Replicated)),
            (
                "affinity",
                base.clone()
                    .with_affinity(AffinityConfig::default().with_kind(AffinityKind::Fair)),
            ),
            ("memory_mode", {
                base.clone()
                    .with_memory_mode(MemoryMode::OffheapTiered)
                    .with_offheap_max_memory(0)
            }),
            ("backups", base.clone().with_backups(3)),
        ];

        for (attr, remote) in cases {
            match base.check_compatible(&remote) {
                Err(Error::Config(ConfigError::Mismatch { attribute, .. })) => {
                    assert_eq!(attribute, attr)
                }
                other => panic!("{attr}: unexpected {other:?}"),
            }
        }

        // Node-local settings may differ.
        let near = base
            .clone()
            .with_distribution_mode(DistributionMode::NearPartitioned)
            .with_max_concurrent_async_ops(5);
        assert!(base.check_compatible(&near).is_ok());
    }
}
