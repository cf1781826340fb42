//! Immutable view of cluster membership at one topology version.

use super::node::ClusterNode;
use crate::types::{NodeId, TopologyVersion};

/// Membership snapshot. Nodes are kept in join order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    version: TopologyVersion,
    nodes: Vec<ClusterNode>,
}

impl TopologySnapshot {
    /// Create a snapshot; nodes are sorted by join order.
    pub fn new(version: TopologyVersion, mut nodes: Vec<ClusterNode>) -> Self {
        nodes.sort_by_key(|n| (n.order, n.id));
        Self { version, nodes }
    }

    /// Topology version of the snapshot.
    pub fn version(&self) -> TopologyVersion {
        self.version
    }

    /// All nodes in join order.
    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    /// Ids of all nodes in join order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    /// Find a node by id.
    pub fn node(&self, id: NodeId) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Whether the node is a member.
    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// The oldest member.
    pub fn oldest(&self) -> Option<&ClusterNode> {
        self.nodes.first()
    }

    /// Nodes owning partitions of the named cache, in join order.
    pub fn affinity_nodes(&self, cache: &str) -> Vec<ClusterNode> {
        self.nodes
            .iter()
            .filter(|n| n.is_affinity_node(cache))
            .cloned()
            .collect()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the snapshot has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DistributionMode;

    fn node(id: NodeId, order: u32) -> ClusterNode {
        let mut n = ClusterNode::new(id).with_cache("c", DistributionMode::PartitionedOnly);
        n.order = order;
        n
    }

    #[test]
    fn test_nodes_sorted_by_order() {
        let snap = TopologySnapshot::new(3, vec![node(10, 3), node(20, 1), node(30, 2)]);
        assert_eq!(snap.node_ids(), vec![20, 30, 10]);
        assert_eq!(snap.oldest().map(|n| n.id), Some(20));
    }

    #[test]
    fn test_affinity_nodes_skip_clients() {
        let mut client = node(4, 4);
        client.client = true;
        let snap = TopologySnapshot::new(4, vec![node(1, 1), node(2, 2), client]);
        let ids: Vec<_> = snap.affinity_nodes("c").iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(snap.affinity_nodes("missing").is_empty());
    }
}
