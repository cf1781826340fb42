//! Discovery events.

use super::node::ClusterNode;
use super::topology::TopologySnapshot;
use crate::types::NodeId;

/// Events related to cluster membership changes.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A new node joined the cluster.
    NodeJoined {
        /// The joined node, with its assigned join order.
        node: ClusterNode,
    },

    /// A node left the cluster gracefully.
    NodeLeft {
        /// The node's ID.
        node_id: NodeId,
    },

    /// A node has been confirmed as failed.
    NodeFailed {
        /// The node's ID.
        node_id: NodeId,
    },
}

impl DiscoveryEvent {
    /// Get the node ID associated with this event.
    pub fn node_id(&self) -> NodeId {
        match self {
            DiscoveryEvent::NodeJoined { node } => node.id,
            DiscoveryEvent::NodeLeft { node_id } => *node_id,
            DiscoveryEvent::NodeFailed { node_id } => *node_id,
        }
    }

    /// Check if this is a join event.
    pub fn is_join(&self) -> bool {
        matches!(self, DiscoveryEvent::NodeJoined { .. })
    }

    /// Check if this is a leave-type event.
    pub fn is_leave(&self) -> bool {
        matches!(
            self,
            DiscoveryEvent::NodeLeft { .. } | DiscoveryEvent::NodeFailed { .. }
        )
    }
}

/// Listener for discovery events.
pub trait DiscoveryListener: Send + Sync + 'static {
    /// Called after the topology changed, with the new snapshot.
    fn on_event(&self, event: &DiscoveryEvent, topology: &TopologySnapshot);
}

/// Event listener that logs events.
pub struct LoggingDiscoveryListener;

impl DiscoveryListener for LoggingDiscoveryListener {
    fn on_event(&self, event: &DiscoveryEvent, topology: &TopologySnapshot) {
        let topology_version = topology.version();
        match event {
            DiscoveryEvent::NodeJoined { node } => {
                tracing::info!(
                    node_id = node.id,
                    order = node.order,
                    client = node.client,
                    topology_version,
                    "Node joined topology"
                );
            }
            DiscoveryEvent::NodeLeft { node_id } => {
                tracing::info!(node_id, topology_version, "Node left topology");
            }
            DiscoveryEvent::NodeFailed { node_id } => {
                tracing::warn!(node_id, topology_version, "Node failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_node_id() {
        let event = DiscoveryEvent::NodeJoined {
            node: ClusterNode::new(42),
        };
        assert_eq!(event.node_id(), 42);
    }

    #[test]
    fn test_event_types() {
        let join = DiscoveryEvent::NodeJoined {
            node: ClusterNode::new(1),
        };
        assert!(join.is_join());
        assert!(!join.is_leave());

        let failed = DiscoveryEvent::NodeFailed { node_id: 1 };
        assert!(!failed.is_join());
        assert!(failed.is_leave());
    }
}
