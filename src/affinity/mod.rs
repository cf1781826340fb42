//! Affinity: key to partition, partition to owner nodes.
//!
//! ```text
//!   key bytes ──hash──► partition ──assignment[topology]──► [primary, backup1, ...]
//! ```
//!
//! Three functions are provided: a virtual-node hash ring, rendezvous (HRW)
//! hashing and a fair function that balances partition counts per node. All
//! of them are pure functions of the membership (plus, for the fair
//! function, the previous assignment), so every node computes the same
//! assignment for the same topology version.

pub mod assignment;
pub mod fair;
pub mod hashring;
pub mod rendezvous;

pub use assignment::{AffinityAssignment, AffinityCache};
pub use fair::FairAffinity;
pub use hashring::{ConsistentHashAffinity, HashRing};
pub use rendezvous::RendezvousAffinity;

use crate::cluster::{ClusterNode, DiscoveryEvent};
use crate::config::{AffinityConfig, AffinityKind};
use crate::types::{NodeId, PartitionId, TopologyVersion};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use twox_hash::XxHash64;

/// Input to an assignment computation.
#[derive(Debug, Clone, Copy)]
pub struct AffinityContext<'a> {
    /// Data nodes for the cache, in join order.
    pub nodes: &'a [ClusterNode],
    /// Requested backup count; `usize::MAX` means every node.
    pub backups: usize,
    /// Topology version being computed.
    pub topology_version: TopologyVersion,
    /// Assignment of the previous topology version, if known.
    pub previous: Option<&'a AffinityAssignment>,
    /// Event that caused the change.
    pub event: Option<&'a DiscoveryEvent>,
}

impl AffinityContext<'_> {
    /// Owners per partition: `1 + backups`, capped by the node count.
    pub fn owners_per_partition(&self) -> usize {
        self.backups.saturating_add(1).min(self.nodes.len())
    }
}

/// Maps keys to partitions and partitions to nodes.
pub trait AffinityFunction: Send + Sync + std::fmt::Debug {
    /// Name used to compare functions across nodes.
    fn name(&self) -> &'static str;

    /// Number of partitions.
    fn partitions(&self) -> u32;

    /// Partition for a key.
    fn partition(&self, key: &[u8]) -> PartitionId {
        (hash_bytes(key) % u64::from(self.partitions().max(1))) as PartitionId
    }

    /// Ordered owners for every partition.
    fn assign_partitions(&self, ctx: &AffinityContext<'_>) -> Vec<Vec<NodeId>>;
}

/// Build the affinity function described by the configuration.
pub fn create_affinity(config: &AffinityConfig) -> Arc<dyn AffinityFunction> {
    match config.kind {
        AffinityKind::ConsistentHash { replicas } => Arc::new(
            ConsistentHashAffinity::new(config.partitions, replicas)
                .with_exclude_neighbors(config.exclude_neighbors),
        ),
        AffinityKind::Rendezvous => Arc::new(
            RendezvousAffinity::new(config.partitions)
                .with_exclude_neighbors(config.exclude_neighbors),
        ),
        AffinityKind::Fair => Arc::new(FairAffinity::new(config.partitions)),
    }
}

/// Calculate the hash of some bytes using xxHash64.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Hash of a (node, partition) pair.
pub(crate) fn node_partition_hash(node: NodeId, partition: PartitionId) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    node.hash(&mut hasher);
    partition.hash(&mut hasher);
    hasher.finish()
}

/// Take `count` distinct owners from candidates ranked best first.
///
/// With `exclude_neighbors`, nodes sharing a host with an already chosen
/// owner are skipped; if that leaves the list short, a second pass fills it
/// from the skipped nodes.
pub(crate) fn select_owners<'a>(
    ranked: impl IntoIterator<Item = &'a ClusterNode>,
    count: usize,
    exclude_neighbors: bool,
) -> Vec<NodeId> {
    let ranked: Vec<&ClusterNode> = ranked.into_iter().collect();
    let mut owners: Vec<&ClusterNode> = Vec::with_capacity(count);

    for &node in &ranked {
        if owners.len() >= count {
            break;
        }
        if owners.iter().any(|o| o.id == node.id) {
            continue;
        }
        if exclude_neighbors && owners.iter().any(|o| o.is_neighbor(node)) {
            continue;
        }
        owners.push(node);
    }

    if exclude_neighbors && owners.len() < count {
        for &node in &ranked {
            if owners.len() >= count {
                break;
            }
            if !owners.iter().any(|o| o.id == node.id) {
                owners.push(node);
            }
        }
    }

    owners.into_iter().map(|n| n.id).collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::types::DistributionMode;

    /// Data nodes 1..=count with join order equal to id.
    pub fn data_nodes(count: u64) -> Vec<ClusterNode> {
        (1..=count).map(|id| data_node(id, &format!("host-{id}"))).collect()
    }

    pub fn data_node(id: NodeId, macs: &str) -> ClusterNode {
        let mut node = ClusterNode::new(id)
            .with_macs(macs)
            .with_cache("c", DistributionMode::PartitionedOnly);
        node.order = id as u32;
        node
    }

    pub fn ctx<'a>(
        nodes: &'a [ClusterNode],
        backups: usize,
        previous: Option<&'a AffinityAssignment>,
    ) -> AffinityContext<'a> {
        AffinityContext {
            nodes,
            backups,
            topology_version: nodes.len() as u64,
            previous,
            event: None,
        }
    }

    /// Every partition has the expected owner count and no duplicates.
    pub fn assert_well_formed(assignment: &[Vec<NodeId>], expected_owners: usize) {
        for (p, owners) in assignment.iter().enumerate() {
            assert_eq!(owners.len(), expected_owners, "partition {p}");
            let mut dedup = owners.clone();
            dedup.sort_unstable();
            dedup.dedup();
            assert_eq!(dedup.len(), owners.len(), "duplicate owners in partition {p}");
        }
    }

    /// Number of partitions whose owner list changed.
    pub fn moved(before: &[Vec<NodeId>], after: &[Vec<NodeId>]) -> usize {
        before.iter().zip(after).filter(|(a, b)| a != b).count()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_partition_is_deterministic_and_in_range() {
        let functions: Vec<Arc<dyn AffinityFunction>> = vec![
            Arc::new(ConsistentHashAffinity::new(128, 64)),
            Arc::new(RendezvousAffinity::new(128)),
            Arc::new(FairAffinity::new(128)),
        ];
        for f in functions {
            for i in 0..1000 {
                let key = format!("key-{i}");
                let p = f.partition(key.as_bytes());
                assert!(p < 128);
                assert_eq!(p, f.partition(key.as_bytes()));
            }
        }
    }

    #[test]
    fn test_select_owners_excludes_neighbors() {
        let nodes = vec![data_node(1, "a"), data_node(2, "a"), data_node(3, "b")];
        let owners = select_owners(nodes.iter(), 2, true);
        assert_eq!(owners, vec![1, 3]);

        let owners = select_owners(nodes.iter(), 2, false);
        assert_eq!(owners, vec![1, 2]);
    }

    #[test]
    fn test_select_owners_fills_when_all_neighbors() {
        let nodes = vec![data_node(1, "a"), data_node(2, "a"), data_node(3, "a")];
        let owners = select_owners(nodes.iter(), 2, true);
        assert_eq!(owners, vec![1, 2]);
    }

    #[test]
    fn test_create_affinity_from_config() {
        let config = AffinityConfig::default().with_kind(AffinityKind::Fair).with_partitions(64);
        let f = create_affinity(&config);
        assert_eq!(f.name(), "fair");
        assert_eq!(f.partitions(), 64);

        let nodes = data_nodes(3);
        let assignment = f.assign_partitions(&ctx(&nodes, 1, None));
        assert_well_formed(&assignment, 2);
    }

    #[test]
    fn test_random_keys_spread_over_partitions() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let f = RendezvousAffinity::new(16);
        let mut counts = [0usize; 16];
        for _ in 0..16_000 {
            let key: [u8; 16] = rng.gen();
            counts[f.partition(&key) as usize] += 1;
        }
        for count in counts {
            assert!(count > 500 && count < 1500, "skewed partition count {count}");
        }
    }
}
