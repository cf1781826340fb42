//! Fair affinity: balanced partition counts per node.
//!
//! Owners are assigned tier by tier (primary, first backup, ...). Within a
//! tier every node gets a quota of `partitions / nodes` (the oldest
//! `partitions % nodes` nodes get one more). Partitions keep their previous
//! owner for the tier when that owner is alive and under quota; the rest go
//! to the least loaded node not already owning the partition.

use super::{node_partition_hash, AffinityContext, AffinityFunction};
use crate::types::{NodeId, PartitionId};
use std::collections::{HashMap, HashSet};

/// Balanced affinity function.
#[derive(Debug, Clone)]
pub struct FairAffinity {
    partitions: u32,
}

impl FairAffinity {
    /// Create the function with a fixed partition count.
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }
}

impl AffinityFunction for FairAffinity {
    fn name(&self) -> &'static str {
        "fair"
    }

    fn partitions(&self) -> u32 {
        self.partitions
    }

    fn assign_partitions(&self, ctx: &AffinityContext<'_>) -> Vec<Vec<NodeId>> {
        let parts = self.partitions as usize;
        let mut result: Vec<Vec<NodeId>> = vec![Vec::new(); parts];
        if ctx.nodes.is_empty() {
            return result;
        }

        let node_count = ctx.nodes.len();
        let tiers = ctx.owners_per_partition();
        let alive: HashSet<NodeId> = ctx.nodes.iter().map(|n| n.id).collect();
        let base = parts / node_count;
        let extra = parts % node_count;
        let quota: HashMap<NodeId, usize> = ctx
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id, base + usize::from(i < extra)))
            .collect();

        for tier in 0..tiers {
            let mut load: HashMap<NodeId, usize> = HashMap::with_capacity(node_count);
            let mut pending = Vec::new();

            for (p, owners) in result.iter_mut().enumerate() {
                let previous = ctx
                    .previous
                    .and_then(|a| a.nodes(p as PartitionId).get(tier).copied())
                    .filter(|id| alive.contains(id) && !owners.contains(id));

                match previous {
                    Some(id) if load.get(&id).copied().unwrap_or(0) < quota[&id] => {
                        owners.push(id);
                        *load.entry(id).or_default() += 1;
                    }
                    _ => pending.push(p),
                }
            }

            for p in pending {
                let owners = &mut result[p];
                let pick = ctx
                    .nodes
                    .iter()
                    .filter(|n| !owners.contains(&n.id))
                    .min_by_key(|n| {
                        let used = load.get(&n.id).copied().unwrap_or(0);
                        (
                            used >= quota[&n.id],
                            used,
                            node_partition_hash(n.id, p as PartitionId),
                            n.id,
                        )
                    })
                    .map(|n| n.id);

                if let Some(id) = pick {
                    owners.push(id);
                    *load.entry(id).or_default() += 1;
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::AffinityAssignment;
    use super::*;

    fn primary_counts(assignment: &[Vec<NodeId>]) -> HashMap<NodeId, usize> {
        let mut counts = HashMap::new();
        for owners in assignment {
            *counts.entry(owners[0]).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_primaries_balanced_within_one() {
        let f = FairAffinity::new(256);
        for n in 1..=7 {
            let nodes = data_nodes(n);
            let assignment = f.assign_partitions(&ctx(&nodes, 1, None));
            assert_well_formed(&assignment, (n as usize).min(2));

            let counts = primary_counts(&assignment);
            let max = counts.values().max().copied().unwrap_or(0);
            let min = counts.values().min().copied().unwrap_or(0);
            assert!(max - min <= 1, "{n} nodes: {counts:?}");
        }
    }

    #[test]
    fn test_backups_balanced() {
        let f = FairAffinity::new(300);
        let nodes = data_nodes(4);
        let assignment = f.assign_partitions(&ctx(&nodes, 2, None));
        assert_well_formed(&assignment, 3);

        let mut totals: HashMap<NodeId, usize> = HashMap::new();
        for owners in &assignment {
            for id in owners {
                *totals.entry(*id).or_insert(0) += 1;
            }
        }
        for (id, total) in totals {
            assert!((215..=235).contains(&total), "node {id} owns {total}");
        }
    }

    #[test]
    fn test_join_keeps_previous_owners_where_possible() {
        let f = FairAffinity::new(120);
        let three = data_nodes(3);
        let before = f.assign_partitions(&ctx(&three, 0, None));
        let prev = AffinityAssignment::new(3, before.clone());

        let four = data_nodes(4);
        let after = f.assign_partitions(&ctx(&four, 0, Some(&prev)));

        // Exactly the new node's quota moves.
        assert_eq!(moved(&before, &after), 30);
        for (b, a) in before.iter().zip(&after) {
            if b != a {
                assert_eq!(a[0], 4);
            }
        }
    }

    #[test]
    fn test_leave_moves_only_departed_partitions() {
        let f = FairAffinity::new(120);
        let four = data_nodes(4);
        let before = f.assign_partitions(&ctx(&four, 0, None));
        let prev = AffinityAssignment::new(4, before.clone());

        let three = data_nodes(3);
        let after = f.assign_partitions(&ctx(&three, 0, Some(&prev)));
        for (b, a) in before.iter().zip(&after) {
            if b[0] != 4 {
                assert_eq!(a, b);
            }
        }
        let counts = primary_counts(&after);
        assert!(counts.values().all(|&c| c == 40));
    }

    #[test]
    fn test_deterministic() {
        let f = FairAffinity::new(64);
        let nodes = data_nodes(3);
        assert_eq!(
            f.assign_partitions(&ctx(&nodes, 1, None)),
            f.assign_partitions(&ctx(&nodes, 1, None))
        );
    }
}
