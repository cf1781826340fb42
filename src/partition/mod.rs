//! Local partition states for one cache.
//!
//! ```text
//!            assigned, no data yet          preload done
//!   (none) ───────────────────────► MOVING ─────────────► OWNING
//!                                                           │ no longer assigned
//!                                                           ▼
//!                        EVICTED ◄──────── entries cleared ─ RENTING
//! ```
//!
//! The map is copy-on-recompute: readers take an `Arc` snapshot and never
//! observe a half-applied topology change.

use crate::affinity::AffinityAssignment;
use crate::types::{NodeId, PartitionId, TopologyVersion};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// State of a partition on the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionState {
    /// Assigned and waiting for preload.
    Moving,
    /// Assigned and holding authoritative data.
    Owning,
    /// No longer assigned; data is being cleared.
    Renting,
    /// Cleared.
    Evicted,
    /// Every previous owner left before the data could be moved.
    Lost,
}

/// Immutable snapshot of partition states.
#[derive(Debug, Clone, Default)]
pub struct PartitionMap {
    topology_version: TopologyVersion,
    states: BTreeMap<PartitionId, PartitionState>,
    lost: BTreeSet<PartitionId>,
}

impl PartitionMap {
    /// Topology version the snapshot reflects.
    pub fn topology_version(&self) -> TopologyVersion {
        self.topology_version
    }

    /// State of a partition, `None` if it never lived here.
    pub fn state(&self, partition: PartitionId) -> Option<PartitionState> {
        self.states.get(&partition).copied()
    }

    /// Partitions in the given state.
    pub fn partitions_in(&self, state: PartitionState) -> Vec<PartitionId> {
        self.states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Partitions reported lost.
    pub fn lost_partitions(&self) -> Vec<PartitionId> {
        self.lost.iter().copied().collect()
    }
}

/// Partition changes caused by a new assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionChanges {
    /// Partitions that must be preloaded, with the nodes that held them.
    pub moving: Vec<(PartitionId, Vec<NodeId>)>,
    /// Partitions the local node stopped owning.
    pub renting: Vec<PartitionId>,
    /// Partitions with no surviving previous owner.
    pub lost: Vec<PartitionId>,
}

/// Local partition topology of one cache.
pub struct PartitionTopology {
    local_node: NodeId,
    map: RwLock<Arc<PartitionMap>>,
}

impl PartitionTopology {
    /// Create an empty topology for the local node.
    pub fn new(local_node: NodeId) -> Self {
        Self {
            local_node,
            map: RwLock::new(Arc::new(PartitionMap::default())),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<PartitionMap> {
        self.map.read().clone()
    }

    /// Topology version of the current snapshot.
    pub fn topology_version(&self) -> TopologyVersion {
        self.map.read().topology_version
    }

    /// State of a partition in the current snapshot.
    pub fn state(&self, partition: PartitionId) -> Option<PartitionState> {
        self.map.read().state(partition)
    }

    /// Install states for a new assignment.
    ///
    /// `previous` is the assignment being replaced and `alive` the nodes in
    /// the new topology. A newly assigned partition is MOVING when some alive
    /// node held it before, OWNING when nobody did (fresh cluster), and
    /// reported lost when all previous holders left.
    pub fn update(
        &self,
        assignment: &AffinityAssignment,
        previous: Option<&AffinityAssignment>,
        alive: &BTreeSet<NodeId>,
    ) -> PartitionChanges {
        let mut changes = PartitionChanges::default();
        let mut guard = self.map.write();
        let mut next = PartitionMap {
            topology_version: assignment.topology_version(),
            states: guard.states.clone(),
            lost: guard.lost.clone(),
        };

        for p in 0..assignment.partitions() {
            let owned_now = assignment.is_owner(self.local_node, p);
            let current = next.states.get(&p).copied();
            let holding = matches!(
                current,
                Some(PartitionState::Owning) | Some(PartitionState::Moving)
            );

            if owned_now && !holding {
                let prior: Vec<NodeId> = previous.map(|a| a.nodes(p).to_vec()).unwrap_or_default();
                let sources: Vec<NodeId> = prior
                    .iter()
                    .copied()
                    .filter(|id| *id != self.local_node && alive.contains(id))
                    .collect();

                if prior.is_empty() {
                    next.states.insert(p, PartitionState::Owning);
                } else if sources.is_empty() {
                    next.states.insert(p, PartitionState::Owning);
                    next.lost.insert(p);
                    changes.lost.push(p);
                } else {
                    next.states.insert(p, PartitionState::Moving);
                    changes.moving.push((p, sources));
                }
            } else if !owned_now && holding {
                next.states.insert(p, PartitionState::Renting);
                changes.renting.push(p);
            }
        }

        if !changes.lost.is_empty() {
            warn!(
                node_id = self.local_node,
                topology_version = next.topology_version,
                lost = changes.lost.len(),
                "Partitions lost"
            );
        }
        debug!(
            node_id = self.local_node,
            topology_version = next.topology_version,
            moving = changes.moving.len(),
            renting = changes.renting.len(),
            "Partition map updated"
        );

        *guard = Arc::new(next);
        changes
    }

    /// Mark a preloaded partition as owned.
    pub fn own(&self, partition: PartitionId) {
        self.transition(partition, PartitionState::Moving, PartitionState::Owning);
    }

    /// Mark a rented partition as cleared.
    pub fn evicted(&self, partition: PartitionId) {
        self.transition(partition, PartitionState::Renting, PartitionState::Evicted);
    }

    fn transition(&self, partition: PartitionId, from: PartitionState, to: PartitionState) {
        let mut guard = self.map.write();
        if guard.state(partition) != Some(from) {
            return;
        }
        let mut next = PartitionMap::clone(&guard);
        next.states.insert(partition, to);
        *guard = Arc::new(next);
    }
}

impl std::fmt::Debug for PartitionTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.snapshot();
        f.debug_struct("PartitionTopology")
            .field("local_node", &self.local_node)
            .field("topology_version", &map.topology_version)
            .field("partitions", &map.states.len())
            .finish()
    }
}
