//! Rendezvous (highest random weight) affinity.
//!
//! For each partition every data node gets a score `hash(node, partition)`;
//! nodes are ranked by score (node id breaks ties) and the first
//! `1 + backups` distinct nodes own the partition. A membership change only
//! moves partitions whose ranked prefix contains the joining or leaving node.

use super::{node_partition_hash, select_owners, AffinityContext, AffinityFunction};
use crate::cluster::ClusterNode;
use crate::types::{NodeId, PartitionId};

/// Rendezvous hashing affinity function.
#[derive(Debug, Clone)]
pub struct RendezvousAffinity {
    partitions: u32,
    exclude_neighbors: bool,
}

impl RendezvousAffinity {
    /// Create the function with a fixed partition count.
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            exclude_neighbors: false,
        }
    }

    /// Keep nodes sharing a host out of the same owner list.
    pub fn with_exclude_neighbors(mut self, exclude: bool) -> Self {
        self.exclude_neighbors = exclude;
        self
    }

    fn rank<'a>(&self, nodes: &'a [ClusterNode], partition: PartitionId) -> Vec<&'a ClusterNode> {
        let mut ranked: Vec<(u64, &ClusterNode)> = nodes
            .iter()
            .map(|n| (node_partition_hash(n.id, partition), n))
            .collect();
        ranked.sort_by(|(ha, a), (hb, b)| ha.cmp(hb).then(a.id.cmp(&b.id)));
        ranked.into_iter().map(|(_, n)| n).collect()
    }
}

impl AffinityFunction for RendezvousAffinity {
    fn name(&self) -> &'static str {
        "rendezvous"
    }

    fn partitions(&self) -> u32 {
        self.partitions
    }

    fn assign_partitions(&self, ctx: &AffinityContext<'_>) -> Vec<Vec<NodeId>> {
        let count = ctx.owners_per_partition();
        (0..self.partitions)
            .map(|p| {
                if ctx.nodes.len() <= 1 {
                    return ctx.nodes.iter().map(|n| n.id).collect();
                }
                select_owners(self.rank(ctx.nodes, p), count, self.exclude_neighbors)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_assignment_well_formed() {
        let f = RendezvousAffinity::new(256);
        let nodes = data_nodes(5);
        let assignment = f.assign_partitions(&ctx(&nodes, 2, None));
        assert_well_formed(&assignment, 3);
    }

    #[test]
    fn test_single_node_owns_everything() {
        let f = RendezvousAffinity::new(16);
        let nodes = data_nodes(1);
        let assignment = f.assign_partitions(&ctx(&nodes, 1, None));
        assert!(assignment.iter().all(|owners| owners == &vec![1]));
    }

    #[test]
    fn test_empty_topology() {
        let f = RendezvousAffinity::new(8);
        let assignment = f.assign_partitions(&ctx(&[], 1, None));
        assert!(assignment.iter().all(Vec::is_empty));
    }

    #[test]
    fn test_leave_only_moves_partitions_of_leaving_node() {
        let f = RendezvousAffinity::new(256);
        let four = data_nodes(4);
        let three = data_nodes(3);
        let before = f.assign_partitions(&ctx(&four, 1, None));
        let after = f.assign_partitions(&ctx(&three, 1, None));

        for (b, a) in before.iter().zip(&after) {
            if !b.contains(&4) {
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_balance() {
        let f = RendezvousAffinity::new(1024);
        let nodes = data_nodes(4);
        let assignment = f.assign_partitions(&ctx(&nodes, 0, None));
        for id in 1..=4 {
            let owned = assignment.iter().filter(|o| o[0] == id).count();
            assert!(owned > 150 && owned < 370, "node {id} owns {owned}");
        }
    }

    #[test]
    fn test_exclude_neighbors_keeps_backup_off_primary_host() {
        let f = RendezvousAffinity::new(128).with_exclude_neighbors(true);
        let nodes = vec![
            data_node(1, "a"),
            data_node(2, "a"),
            data_node(3, "b"),
            data_node(4, "c"),
        ];
        let assignment = f.assign_partitions(&ctx(&nodes, 1, None));
        for owners in &assignment {
            let primary = nodes.iter().find(|n| n.id == owners[0]).unwrap();
            let backup = nodes.iter().find(|n| n.id == owners[1]).unwrap();
            assert!(!primary.is_neighbor(backup));
        }
    }
}
