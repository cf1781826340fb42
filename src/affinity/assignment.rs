//! Computed assignments and the per-cache assignment history.

use super::{AffinityContext, AffinityFunction};
use crate::cluster::{DiscoveryEvent, TopologySnapshot};
use crate::error::{Error, Result, TopologyError};
use crate::types::{NodeId, PartitionId, TopologyVersion};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Number of past assignments kept per cache.
const HISTORY_SIZE: usize = 32;

/// Immutable partition to owners mapping for one topology version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityAssignment {
    topology_version: TopologyVersion,
    assignment: Vec<Vec<NodeId>>,
    primary: HashMap<NodeId, Vec<PartitionId>>,
    backup: HashMap<NodeId, Vec<PartitionId>>,
}

impl AffinityAssignment {
    /// Wrap a computed assignment.
    pub fn new(topology_version: TopologyVersion, assignment: Vec<Vec<NodeId>>) -> Self {
        let mut primary: HashMap<NodeId, Vec<PartitionId>> = HashMap::new();
        let mut backup: HashMap<NodeId, Vec<PartitionId>> = HashMap::new();
        for (p, owners) in assignment.iter().enumerate() {
            let p = p as PartitionId;
            if let Some((first, rest)) = owners.split_first() {
                primary.entry(*first).or_default().push(p);
                for id in rest {
                    backup.entry(*id).or_default().push(p);
                }
            }
        }
        Self {
            topology_version,
            assignment,
            primary,
            backup,
        }
    }

    /// Topology version the assignment was computed for.
    pub fn topology_version(&self) -> TopologyVersion {
        self.topology_version
    }

    /// Number of partitions.
    pub fn partitions(&self) -> u32 {
        self.assignment.len() as u32
    }

    /// Owners of a partition, primary first.
    pub fn nodes(&self, partition: PartitionId) -> &[NodeId] {
        self.assignment
            .get(partition as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Primary owner of a partition.
    pub fn primary(&self, partition: PartitionId) -> Option<NodeId> {
        self.nodes(partition).first().copied()
    }

    /// Backup owners of a partition.
    pub fn backups(&self, partition: PartitionId) -> &[NodeId] {
        self.nodes(partition).get(1..).unwrap_or(&[])
    }

    /// Whether `node` is the primary of `partition`.
    pub fn is_primary(&self, node: NodeId, partition: PartitionId) -> bool {
        self.primary(partition) == Some(node)
    }

    /// Whether `node` is a backup of `partition`.
    pub fn is_backup(&self, node: NodeId, partition: PartitionId) -> bool {
        self.backups(partition).contains(&node)
    }

    /// Whether `node` owns `partition` in any role.
    pub fn is_owner(&self, node: NodeId, partition: PartitionId) -> bool {
        self.nodes(partition).contains(&node)
    }

    /// Partitions for which `node` is primary.
    pub fn primary_partitions(&self, node: NodeId) -> &[PartitionId] {
        self.primary.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Partitions for which `node` is a backup.
    pub fn backup_partitions(&self, node: NodeId) -> &[PartitionId] {
        self.backup.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The raw owner lists.
    pub fn assignment(&self) -> &[Vec<NodeId>] {
        &self.assignment
    }
}

/// Assignment history of one cache on one node.
///
/// Readers always see a complete assignment; a new version is installed as a
/// whole and announced through a `watch` channel so operations can await
/// readiness of a topology version.
pub struct AffinityCache {
    cache_name: String,
    function: Arc<dyn AffinityFunction>,
    backups: usize,
    history: RwLock<BTreeMap<TopologyVersion, Arc<AffinityAssignment>>>,
    ready: watch::Sender<TopologyVersion>,
}

impl AffinityCache {
    /// Create an empty history. `backups` of `usize::MAX` replicates to all.
    pub fn new(cache_name: impl Into<String>, function: Arc<dyn AffinityFunction>, backups: usize) -> Self {
        let (ready, _) = watch::channel(0);
        Self {
            cache_name: cache_name.into(),
            function,
            backups,
            history: RwLock::new(BTreeMap::new()),
            ready,
        }
    }

    /// The affinity function.
    pub fn function(&self) -> &Arc<dyn AffinityFunction> {
        &self.function
    }

    /// Number of partitions.
    pub fn partitions(&self) -> u32 {
        self.function.partitions()
    }

    /// Partition of a key.
    pub fn partition(&self, key: &[u8]) -> PartitionId {
        self.function.partition(key)
    }

    /// Compute and install the assignment for a topology snapshot.
    pub fn calculate(
        &self,
        topology: &TopologySnapshot,
        event: Option<&DiscoveryEvent>,
    ) -> Arc<AffinityAssignment> {
        let version = topology.version();
        if let Some(existing) = self.history.read().get(&version) {
            return existing.clone();
        }

        let nodes = topology.affinity_nodes(&self.cache_name);
        let previous = self.latest_before(version);
        let ctx = AffinityContext {
            nodes: &nodes,
            backups: self.backups,
            topology_version: version,
            previous: previous.as_deref(),
            event,
        };
        let assignment = Arc::new(AffinityAssignment::new(
            version,
            self.function.assign_partitions(&ctx),
        ));

        debug!(
            cache = %self.cache_name,
            topology_version = version,
            data_nodes = nodes.len(),
            "Affinity calculated"
        );
        self.install_arc(assignment.clone());
        assignment
    }

    /// Install an assignment computed elsewhere (fetched from another node).
    pub fn install(&self, assignment: AffinityAssignment) {
        self.install_arc(Arc::new(assignment));
    }

    fn install_arc(&self, assignment: Arc<AffinityAssignment>) {
        let version = assignment.topology_version();
        {
            let mut history = self.history.write();
            history.insert(version, assignment);
            while history.len() > HISTORY_SIZE {
                history.pop_first();
            }
        }
        self.ready.send_if_modified(|ready| {
            if version > *ready {
                *ready = version;
                true
            } else {
                false
            }
        });
    }

    fn latest_before(&self, version: TopologyVersion) -> Option<Arc<AffinityAssignment>> {
        self.history
            .read()
            .range(..version)
            .next_back()
            .map(|(_, a)| a.clone())
    }

    /// Highest installed topology version.
    pub fn ready_version(&self) -> TopologyVersion {
        *self.ready.borrow()
    }

    /// Assignment for an exact topology version.
    pub fn assignment(&self, version: TopologyVersion) -> Result<Arc<AffinityAssignment>> {
        self.history.read().get(&version).cloned().ok_or_else(|| {
            Error::Topology(TopologyError::StaleTopology {
                requested: version,
                current: self.ready_version(),
            })
        })
    }

    /// Most recent assignment.
    pub fn latest(&self) -> Result<Arc<AffinityAssignment>> {
        self.history
            .read()
            .values()
            .next_back()
            .cloned()
            .ok_or(Error::Topology(TopologyError::StaleTopology {
                requested: 0,
                current: 0,
            }))
    }

    /// Wait until an assignment for `version` or newer is installed.
    pub async fn ready(&self, version: TopologyVersion) -> Result<Arc<AffinityAssignment>> {
        let mut rx = self.ready.subscribe();
        rx.wait_for(|ready| *ready >= version)
            .await
            .map(|_| ())
            .map_err(|_| Error::Cancelled)?;
        self.latest()
    }

    /// Owners of a partition in the latest assignment, primary first.
    pub fn map_partition_to_primary_and_backups(&self, partition: PartitionId) -> Vec<NodeId> {
        self.latest()
            .map(|a| a.nodes(partition).to_vec())
            .unwrap_or_default()
    }

    /// Owners of a key in the latest assignment, primary first.
    pub fn map_key_to_primary_and_backups(&self, key: &[u8]) -> Vec<NodeId> {
        self.map_partition_to_primary_and_backups(self.partition(key))
    }

    /// Primary of a key in the latest assignment.
    pub fn map_key_to_node(&self, key: &[u8]) -> Option<NodeId> {
        self.map_key_to_primary_and_backups(key).first().copied()
    }

    /// Whether `node` is the primary of `key`.
    pub fn is_primary(&self, node: NodeId, key: &[u8]) -> bool {
        self.map_key_to_node(key) == Some(node)
    }

    /// Whether `node` is a backup of `key`.
    pub fn is_backup(&self, node: NodeId, key: &[u8]) -> bool {
        self.map_key_to_primary_and_backups(key)
            .get(1..)
            .is_some_and(|b| b.contains(&node))
    }

    /// Partitions for which `node` is primary in the latest assignment.
    pub fn primary_partitions(&self, node: NodeId) -> Vec<PartitionId> {
        self.latest()
            .map(|a| a.primary_partitions(node).to_vec())
            .unwrap_or_default()
    }

    /// Partitions for which `node` is a backup in the latest assignment.
    pub fn backup_partitions(&self, node: NodeId) -> Vec<PartitionId> {
        self.latest()
            .map(|a| a.backup_partitions(node).to_vec())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for AffinityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityCache")
            .field("cache_name", &self.cache_name)
            .field("function", &self.function.name())
            .field("backups", &self.backups)
            .field("ready_version", &self.ready_version())
            .finish()
    }
}
