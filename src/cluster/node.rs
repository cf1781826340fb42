//! Cluster node descriptor.

use crate::types::{DistributionMode, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A member of the cluster as seen by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Unique node identifier.
    pub id: NodeId,
    /// Join order, assigned by discovery. Lower is older.
    pub order: u32,
    /// Client nodes never own data.
    pub client: bool,
    /// Host identity; nodes sharing it are neighbours.
    pub macs: String,
    /// Data center the node runs in.
    pub data_center_id: u8,
    /// Caches started on the node and the role it plays for each.
    pub caches: BTreeMap<String, DistributionMode>,
}

impl ClusterNode {
    /// Create a data node descriptor with no caches.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            order: 0,
            client: false,
            macs: format!("host-{id}"),
            data_center_id: 0,
            caches: BTreeMap::new(),
        }
    }

    /// Set the host identity.
    pub fn with_macs(mut self, macs: impl Into<String>) -> Self {
        self.macs = macs.into();
        self
    }

    /// Mark the node as a client.
    pub fn with_client(mut self, client: bool) -> Self {
        self.client = client;
        self
    }

    /// Register a cache on the node.
    pub fn with_cache(mut self, name: impl Into<String>, mode: DistributionMode) -> Self {
        self.caches.insert(name.into(), mode);
        self
    }

    /// Whether this node owns partitions of the named cache.
    pub fn is_affinity_node(&self, cache: &str) -> bool {
        !self.client
            && self
                .caches
                .get(cache)
                .is_some_and(|mode| mode.is_affinity_node())
    }

    /// Whether the two nodes share a host.
    pub fn is_neighbor(&self, other: &ClusterNode) -> bool {
        self.macs == other.macs
    }
}
