//! Consistent hashing affinity with virtual nodes.
//!
//! Each data node is placed on the ring `replicas` times. A partition's
//! owners are the distinct nodes met when walking the ring clockwise from
//! the partition's hash position, so adding or removing a node only moves
//! the partitions whose walk crosses that node's virtual nodes.

use super::{hash_bytes, select_owners, AffinityContext, AffinityFunction};
use crate::cluster::ClusterNode;
use crate::types::{NodeId, PartitionId};
use std::collections::{BTreeMap, HashMap};

/// Default number of virtual nodes per physical node.
pub const DEFAULT_REPLICAS: usize = 128;

/// A consistent hash ring of node ids.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// Hash position on the ring to owning node.
    vnodes: BTreeMap<u64, NodeId>,

    /// Number of virtual nodes per physical node.
    replicas: usize,

    /// Physical nodes in the ring, sorted.
    nodes: Vec<NodeId>,
}

impl HashRing {
    /// Create an empty ring.
    pub fn new(replicas: usize) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            replicas: replicas.max(1),
            nodes: Vec::new(),
        }
    }

    /// Number of physical nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Physical nodes in the ring.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Add a node and its virtual nodes.
    pub fn add_node(&mut self, node_id: NodeId) {
        if self.nodes.contains(&node_id) {
            return;
        }
        self.nodes.push(node_id);
        self.nodes.sort_unstable();

        for i in 0..self.replicas {
            self.vnodes.insert(Self::vnode_position(node_id, i), node_id);
        }
    }

    /// Remove a node and its virtual nodes.
    pub fn remove_node(&mut self, node_id: NodeId) {
        if !self.nodes.contains(&node_id) {
            return;
        }
        self.nodes.retain(|&n| n != node_id);

        for i in 0..self.replicas {
            self.vnodes.remove(&Self::vnode_position(node_id, i));
        }
    }

    /// Distinct nodes in ring order starting at `position`, at most `count`.
    pub fn owners_at(&self, position: u64, count: usize) -> Vec<NodeId> {
        let mut owners = Vec::with_capacity(count.min(self.nodes.len()));
        for node_id in self.walk(position) {
            if owners.len() >= count || owners.len() >= self.nodes.len() {
                break;
            }
            if !owners.contains(&node_id) {
                owners.push(node_id);
            }
        }
        owners
    }

    /// Every distinct node in ring order starting at `position`.
    pub fn walk(&self, position: u64) -> impl Iterator<Item = NodeId> + '_ {
        let mut seen = Vec::with_capacity(self.nodes.len());
        self.vnodes
            .range(position..)
            .chain(self.vnodes.range(..position))
            .map(|(_, &node_id)| node_id)
            .filter(move |node_id| {
                if seen.contains(node_id) {
                    false
                } else {
                    seen.push(*node_id);
                    true
                }
            })
    }

    fn vnode_position(node_id: NodeId, index: usize) -> u64 {
        hash_bytes(format!("{node_id}:{index}").as_bytes())
    }

    /// Ring position of a partition.
    pub fn partition_position(partition: PartitionId) -> u64 {
        hash_bytes(&partition.to_le_bytes())
    }
}

/// Affinity function backed by a [`HashRing`].
#[derive(Debug, Clone)]
pub struct ConsistentHashAffinity {
    partitions: u32,
    replicas: usize,
    exclude_neighbors: bool,
}

impl ConsistentHashAffinity {
    /// Create the function with `replicas` virtual nodes per node.
    pub fn new(partitions: u32, replicas: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            replicas: replicas.max(1),
            exclude_neighbors: false,
        }
    }

    /// Keep nodes sharing a host out of the same owner list.
    pub fn with_exclude_neighbors(mut self, exclude: bool) -> Self {
        self.exclude_neighbors = exclude;
        self
    }
}

impl AffinityFunction for ConsistentHashAffinity {
    fn name(&self) -> &'static str {
        "consistent-hash"
    }

    fn partitions(&self) -> u32 {
        self.partitions
    }

    fn assign_partitions(&self, ctx: &AffinityContext<'_>) -> Vec<Vec<NodeId>> {
        let count = ctx.owners_per_partition();
        let mut ring = HashRing::new(self.replicas);
        for node in ctx.nodes {
            ring.add_node(node.id);
        }
        let by_id: HashMap<NodeId, &ClusterNode> = ctx.nodes.iter().map(|n| (n.id, n)).collect();

        (0..self.partitions)
            .map(|p| {
                let position = HashRing::partition_position(p);
                if self.exclude_neighbors {
                    let ranked = ring.walk(position).filter_map(|id| by_id.get(&id).copied());
                    select_owners(ranked, count, true)
                } else {
                    ring.owners_at(position, count)
                }
            })
            .collect()
    }
}
