//! In-process discovery service.
//!
//! Assigns join orders, bumps the topology version on every membership
//! change and notifies registered listeners with the new snapshot.

use super::events::{DiscoveryEvent, DiscoveryListener};
use super::node::ClusterNode;
use super::topology::TopologySnapshot;
use crate::error::{ConfigError, Result};
use crate::types::{NodeId, TopologyVersion};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

struct State {
    version: TopologyVersion,
    next_order: u32,
    nodes: BTreeMap<NodeId, ClusterNode>,
}

/// Discovery for nodes living in one process.
pub struct LocalDiscovery {
    state: Mutex<State>,
    listeners: RwLock<Vec<Arc<dyn DiscoveryListener>>>,
}

impl LocalDiscovery {
    /// Create an empty topology.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                version: 0,
                next_order: 1,
                nodes: BTreeMap::new(),
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener for topology changes.
    pub fn add_listener(&self, listener: Arc<dyn DiscoveryListener>) {
        self.listeners.write().push(listener);
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> TopologySnapshot {
        let state = self.state.lock();
        TopologySnapshot::new(state.version, state.nodes.values().cloned().collect())
    }

    /// Add a node; returns the node with its join order and the new snapshot.
    pub fn join(&self, mut node: ClusterNode) -> Result<(ClusterNode, TopologySnapshot)> {
        let snapshot = {
            let mut state = self.state.lock();
            if state.nodes.contains_key(&node.id) {
                return Err(ConfigError::DuplicateNode(node.id).into());
            }
            node.order = state.next_order;
            state.next_order += 1;
            state.version += 1;
            state.nodes.insert(node.id, node.clone());
            TopologySnapshot::new(state.version, state.nodes.values().cloned().collect())
        };

        debug!(node_id = node.id, order = node.order, version = snapshot.version(), "Node joined");
        self.notify(&DiscoveryEvent::NodeJoined { node: node.clone() }, &snapshot);
        Ok((node, snapshot))
    }

    /// Remove a node gracefully.
    pub fn leave(&self, node_id: NodeId) -> Option<TopologySnapshot> {
        self.remove(node_id, DiscoveryEvent::NodeLeft { node_id })
    }

    /// Remove a node that failed.
    pub fn fail(&self, node_id: NodeId) -> Option<TopologySnapshot> {
        self.remove(node_id, DiscoveryEvent::NodeFailed { node_id })
    }

    fn remove(&self, node_id: NodeId, event: DiscoveryEvent) -> Option<TopologySnapshot> {
        let snapshot = {
            let mut state = self.state.lock();
            state.nodes.remove(&node_id)?;
            state.version += 1;
            TopologySnapshot::new(state.version, state.nodes.values().cloned().collect())
        };
        self.notify(&event, &snapshot);
        Some(snapshot)
    }

    fn notify(&self, event: &DiscoveryEvent, snapshot: &TopologySnapshot) {
        for listener in self.listeners.read().iter() {
            listener.on_event(event, snapshot);
        }
    }
}

impl Default for LocalDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalDiscovery")
            .field("version", &state.version)
            .field("nodes", &state.nodes.len())
            .finish()
    }
}
