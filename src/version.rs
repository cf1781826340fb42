//! Version stamps used to order writes and detect conflicts.
//!
//! A [`CacheVersion`] is compared lexicographically on
//! `(topology_version, global_order)` with `node_order` breaking ties, so two
//! nodes stamping concurrently still produce a total order. The
//! [`VersionGenerator`] is a Lamport clock: it never issues an order lower
//! than any order it has observed from another node.

use crate::types::TopologyVersion;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Immutable version stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CacheVersion {
    /// Topology version at which the stamp was issued.
    pub topology_version: TopologyVersion,
    /// Lamport order of the issuing node.
    pub global_order: u64,
    /// Join order of the issuing node.
    pub node_order: u32,
    /// Data center of the issuing node.
    pub data_center_id: u8,
}

impl CacheVersion {
    /// Create a version from its parts.
    pub fn new(
        topology_version: TopologyVersion,
        global_order: u64,
        node_order: u32,
        data_center_id: u8,
    ) -> Self {
        Self {
            topology_version,
            global_order,
            node_order,
            data_center_id,
        }
    }

    /// The version of an entry that was never written.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Whether this is the zero version.
    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }
}

impl Ord for CacheVersion {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.topology_version
            .cmp(&other.topology_version)
            .then(self.global_order.cmp(&other.global_order))
            .then(self.node_order.cmp(&other.node_order))
            .then(self.data_center_id.cmp(&other.data_center_id))
    }
}

impl PartialOrd for CacheVersion {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{}.{}.{}@{}",
            self.topology_version, self.global_order, self.node_order, self.data_center_id
        )
    }
}

/// Issues strictly increasing versions for one node.
pub struct VersionGenerator {
    node_order: u32,
    data_center_id: u8,
    order: AtomicU64,
}

impl VersionGenerator {
    /// Create a generator for the node with the given join order.
    pub fn new(node_order: u32, data_center_id: u8) -> Self {
        Self {
            node_order,
            data_center_id,
            order: AtomicU64::new(0),
        }
    }

    /// Issue the next version for the given topology version.
    pub fn next(&self, topology_version: TopologyVersion) -> CacheVersion {
        let order = self.order.fetch_add(1, Ordering::SeqCst) + 1;
        CacheVersion::new(
            topology_version,
            order,
            self.node_order,
            self.data_center_id,
        )
    }

    /// Advance the local clock past a version observed from another node.
    pub fn on_received(&self, version: &CacheVersion) {
        self.order.fetch_max(version.global_order, Ordering::SeqCst);
    }

    /// The last issued or observed order.
    pub fn last_order(&self) -> u64 {
        self.order.load(Ordering::SeqCst)
    }

    /// Join order of the owning node.
    pub fn node_order(&self) -> u32 {
        self.node_order
    }
}

impl std::fmt::Debug for VersionGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionGenerator")
            .field("node_order", &self.node_order)
            .field("data_center_id", &self.data_center_id)
            .field("order", &self.last_order())
            .finish()
    }
}
