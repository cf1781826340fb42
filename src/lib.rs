//! Partitioned, transactional in-memory data grid.
//!
//! This crate provides an embedded distributed cache where:
//! - **Affinity functions** map keys to partitions and partitions to a
//!   primary plus backups
//! - **MVCC lock queues** order conflicting access to each key on its primary
//! - **Transactions** run PESSIMISTIC or OPTIMISTIC with a two-phase finish
//! - **Atomic caches** order writes at the primary or by origin clock
//!
//! # Features
//!
//! - Consistent-hash, rendezvous and fair affinity functions
//! - Near caches with version-checked invalidation
//! - Group-lock transactions scoped to one partition
//! - Multi-update windows that hold off topology exchanges
//! - Preloading of joining nodes, LRU/FIFO eviction with a swap tier
//! - Read-through, write-through and write-behind stores
//!
//! # Example
//!
//! ```rust,no_run
//! use gridcache::{CacheConfig, TestGrid};
//! use gridcache::types::{AtomicityMode, TxConcurrency, TxIsolation};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let grid = TestGrid::new();
//!     let config = CacheConfig::new("accounts")
//!         .with_atomicity_mode(AtomicityMode::Transactional)
//!         .with_backups(1);
//!     let nodes = grid.start_nodes(3, config).await?;
//!     let cache = nodes[0].cache("accounts")?;
//!
//!     let tx = cache
//!         .tx_start(TxConcurrency::Pessimistic, TxIsolation::RepeatableRead)
//!         .await?;
//!     tx.put("alice", "100").await?;
//!     tx.put("bob", "50").await?;
//!     tx.commit().await?;
//!
//!     assert_eq!(cache.get("alice").await?.as_deref(), Some(&b"100"[..]));
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Application Layer                │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │        Cache / Transaction / TypedCache     │
//! │  • get / put / remove / lock                │
//! │  • tx_start / commit / rollback             │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼────────────────┐
//!     ▼               ▼                ▼
//! ┌──────────┐  ┌────────────┐  ┌─────────────┐
//! │ Affinity │  │ Coordinator│  │  Exchange   │
//! │ Partition│  │  (origin)  │  │ (topology)  │
//! └──────────┘  └────────────┘  └─────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │  Primary / backup handlers                  │
//! │  entries • MVCC queues • versions • stores  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Transactions**: locks are granted by the primary in version order;
//!   committed writes carry one version stamped by the primary
//! - **Atomic writes**: PRIMARY order serializes at the primary; CLOCK order
//!   keeps the highest version on every owner
//! - **Reads**: served by an owner, or by a near copy that is invalidated
//!   when the primary applies a newer version

pub mod affinity;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod entry;
pub mod error;
pub mod future;
pub mod grid;
pub mod marshal;
pub mod metrics;
pub mod mvcc;
pub mod network;
pub mod partition;
pub mod store;
pub mod swap;
pub mod testing;
pub mod tx;
pub mod types;
pub mod version;

// Re-export main types for convenience
pub use cache::{AsyncOp, Cache};
pub use config::{
    AffinityConfig, AffinityKind, CacheConfig, EvictionConfig, EvictionPolicyKind, NearConfig,
    NodeConfig, StoreConfig, TxConfig, WriteBehindConfig,
};
pub use error::{Error, Result};
pub use grid::{GridNode, NodeResources};
pub use marshal::{BincodeMarshaller, Marshaller, TypedCache};
pub use tx::Transaction;
pub use types::{CacheKey, CacheStats, CacheValue, NodeId, PartitionId, TopologyVersion};
pub use version::{CacheVersion, VersionGenerator};

// Re-export cluster types
pub use cluster::{ClusterNode, DiscoveryEvent, LocalDiscovery, TopologySnapshot};

// Re-export store types
pub use store::{CacheStore, MemoryStore, WriteBehindStore};

// Re-export metrics types
pub use metrics::{CacheMetrics, Counter, Gauge, Histogram, LabeledCounter, MetricsSnapshot};

// Re-export testing types
pub use testing::TestGrid;
