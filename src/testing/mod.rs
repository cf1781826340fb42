//! Testing utilities for the cache grid.
//!
//! [`TestGrid`] runs several [`GridNode`]s in one process, connected through
//! a [`LocalTransport`] and a [`LocalDiscovery`]. It drives the exchange of
//! every topology change the way a real discovery layer would.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           TestGrid                              │
//! │                                                                 │
//! │  ┌────────────────┐    join / leave    ┌──────────────────────┐ │
//! │  │ LocalDiscovery │ ─────────────────► │ exchange driver      │ │
//! │  │  - join order  │                    │  1. prepare (old)    │ │
//! │  │  - versions    │                    │  2. init    (new)    │ │
//! │  └────────────────┘                    │  3. complete (old)   │ │
//! │                                        │  4. evict renting    │ │
//! │                                        └──────────┬───────────┘ │
//! │                                                   ▼             │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐                       │
//! │  │ GridNode │  │ GridNode │  │ GridNode │  ◄── LocalTransport   │
//! │  └──────────┘  └──────────┘  └──────────┘      (block/unblock)  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gridcache::{CacheConfig, TestGrid};
//!
//! let grid = TestGrid::new();
//! let nodes = grid.start_nodes(3, CacheConfig::new("orders").with_backups(1)).await?;
//!
//! let cache = nodes[0].cache("orders")?;
//! cache.put("k", "v").await?;
//!
//! // Stopping a node runs the exchange on the survivors.
//! grid.stop_node(nodes[0].id()).await?;
//! ```

#[cfg(test)]
mod utils;

mod grid_atomic_tests;
mod grid_topology_tests;

use crate::cluster::{DiscoveryEvent, LocalDiscovery, LoggingDiscoveryListener};
use crate::config::{CacheConfig, NodeConfig};
use crate::error::Result;
use crate::future::ReleaseFuture;
use crate::grid::{cluster_node, GridNode, NodeResources};
use crate::network::LocalTransport;
use crate::types::NodeId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Several grid nodes in one process.
pub struct TestGrid {
    transport: Arc<LocalTransport>,
    discovery: LocalDiscovery,
    nodes: RwLock<BTreeMap<NodeId, Arc<GridNode>>>,
    exchange: tokio::sync::Mutex<()>,
}

impl TestGrid {
    /// Create an empty grid.
    pub fn new() -> Self {
        let discovery = LocalDiscovery::new();
        discovery.add_listener(Arc::new(LoggingDiscoveryListener));
        Self {
            transport: Arc::new(LocalTransport::new()),
            discovery,
            nodes: RwLock::new(BTreeMap::new()),
            exchange: tokio::sync::Mutex::new(()),
        }
    }

    /// Transport connecting the nodes.
    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    /// Discovery of the grid.
    pub fn discovery(&self) -> &LocalDiscovery {
        &self.discovery
    }

    /// A running node.
    pub fn node(&self, id: NodeId) -> Option<Arc<GridNode>> {
        self.nodes.read().get(&id).cloned()
    }

    /// Running nodes in id order.
    pub fn nodes(&self) -> Vec<Arc<GridNode>> {
        self.nodes.read().values().cloned().collect()
    }

    /// Start `count` data nodes with ids `1..=count`, each with `cache`.
    pub async fn start_nodes(&self, count: u64, cache: CacheConfig) -> Result<Vec<Arc<GridNode>>> {
        let mut started = Vec::with_capacity(count as usize);
        for id in 1..=count {
            started.push(self.start_node(NodeConfig::new(id).with_cache(cache.clone())).await?);
        }
        Ok(started)
    }

    /// Join a node without stores.
    pub async fn start_node(&self, config: NodeConfig) -> Result<Arc<GridNode>> {
        self.start_node_with(config, NodeResources::new()).await
    }

    /// Join a node and run the exchange on every node.
    ///
    /// Returns once the new node finished its join exchange. With async
    /// preloading the data may still be arriving; see
    /// [`TestGrid::preload_future`].
    pub async fn start_node_with(
        &self,
        config: NodeConfig,
        resources: NodeResources,
    ) -> Result<Arc<GridNode>> {
        let _exchange = self.exchange.lock().await;
        config.validate()?;
        for existing in self.nodes() {
            config.check_compatible(existing.config())?;
        }

        let (local, topology) = self.discovery.join(cluster_node(&config))?;
        let node_id = local.id;
        let node = match GridNode::new(config, local, self.transport.clone(), resources) {
            Ok(node) => node,
            Err(e) => {
                self.discovery.leave(node_id);
                return Err(e);
            }
        };
        self.transport.register(node.id(), node.clone());

        let event = DiscoveryEvent::NodeJoined {
            node: node.local().clone(),
        };
        let existing = self.nodes();
        for other in &existing {
            other.prepare_exchange(&event, &topology).await?;
        }
        node.init_exchange(&event, &topology).await?;
        for other in &existing {
            other.complete_exchange(&event, &topology).await?;
        }

        self.nodes.write().insert(node.id(), node.clone());
        self.evict_after_preload();
        info!(node_id = node.id(), topology_version = topology.version(), "Test node joined");
        Ok(node)
    }

    /// Stop a node gracefully and run the exchange on the survivors.
    pub async fn stop_node(&self, id: NodeId) -> Result<()> {
        self.remove_node(id, false).await
    }

    /// Drop a node as if it crashed.
    pub async fn fail_node(&self, id: NodeId) -> Result<()> {
        self.remove_node(id, true).await
    }

    async fn remove_node(&self, id: NodeId, failed: bool) -> Result<()> {
        let _exchange = self.exchange.lock().await;
        let Some(node) = self.nodes.write().remove(&id) else {
            warn!(node_id = id, "Stopping unknown node");
            return Ok(());
        };
        node.stop().await;
        self.transport.deregister(id);

        let (event, topology) = if failed {
            (DiscoveryEvent::NodeFailed { node_id: id }, self.discovery.fail(id))
        } else {
            (DiscoveryEvent::NodeLeft { node_id: id }, self.discovery.leave(id))
        };
        let Some(topology) = topology else {
            return Ok(());
        };

        let survivors = self.nodes();
        for other in &survivors {
            other.prepare_exchange(&event, &topology).await?;
        }
        for other in &survivors {
            other.complete_exchange(&event, &topology).await?;
        }
        self.evict_after_preload();
        info!(node_id = id, failed, topology_version = topology.version(), "Test node removed");
        Ok(())
    }

    /// Completes when every node finished preloading for the last exchange.
    pub fn preload_future(&self) -> ReleaseFuture {
        ReleaseFuture::join(self.nodes().iter().map(|n| n.preload_future()))
    }

    /// Stop every node.
    pub async fn shutdown(&self) {
        let nodes: Vec<_> = std::mem::take(&mut *self.nodes.write()).into_values().collect();
        for node in nodes {
            node.stop().await;
            self.transport.deregister(node.id());
        }
    }

    /// Partitions a node stopped owning are cleared once every node has
    /// its new data.
    fn evict_after_preload(&self) {
        let nodes = self.nodes();
        let preload = ReleaseFuture::join(nodes.iter().map(|n| n.preload_future()));
        if preload.is_done() {
            for node in &nodes {
                node.evict_renting();
            }
            return;
        }
        tokio::spawn(async move {
            if preload.wait().await.is_ok() {
                for node in &nodes {
                    if !node.is_stopped() {
                        node.evict_renting();
                    }
                }
            }
        });
    }
}

impl Default for TestGrid {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TestGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestGrid")
            .field("nodes", &self.nodes.read().keys().collect::<Vec<_>>())
            .field("topology_version", &self.discovery.snapshot().version())
            .finish()
    }
}
