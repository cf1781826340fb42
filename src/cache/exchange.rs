//! Partition map exchange.
//!
//! Every topology change runs three phases on each node:
//!
//! ```text
//!   prepare   block new operations, salvage locks of departed nodes,
//!             wait until locks requested on older topologies are released
//!   init      (joining node) fetch the current assignment from the oldest
//!             node, compute the new one and start preloading
//!   complete  (existing nodes) compute the new assignment, start
//!             preloading, drop near copies and reopen the gate
//! ```
//!
//! Partitions the node stops owning stay RENTING until every node has
//! finished preloading, then [`CacheContext::evict_renting`] clears them.

use super::context::CacheContext;
use crate::affinity::AffinityAssignment;
use crate::cluster::{DiscoveryEvent, TopologySnapshot};
use crate::entry::EntrySnapshot;
use crate::error::{Error, NetworkError, Result};
use crate::future::ReleaseFuture;
use crate::network::Message;
use crate::partition::PartitionState;
use crate::types::{NodeId, PartitionId, PreloadMode};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

impl CacheContext {
    /// Block operations and wait for locks of older topologies to drain.
    pub(crate) async fn prepare_exchange(
        &self,
        event: &DiscoveryEvent,
        topology: &TopologySnapshot,
    ) -> Result<()> {
        tokio::select! {
            res = self.gate.block() => res?,
            _ = self.cancel.cancelled() => return Err(Error::NodeStopping(self.local.id)),
        }
        if event.is_leave() {
            self.salvage(event.node_id());
        }

        let release = self
            .mvcc
            .finish_locks(0..self.affinity.partitions(), topology.version());
        if !release.is_done() {
            debug!(
                cache = %self.name,
                topology_version = topology.version(),
                locks = self.mvcc.lock_count(),
                "Waiting for locks of older topologies"
            );
        }
        tokio::select! {
            res = release.wait() => res?,
            _ = self.cancel.cancelled() => return Err(Error::NodeStopping(self.local.id)),
        }
        debug!(cache = %self.name, topology_version = topology.version(), "Exchange prepared");
        Ok(())
    }

    /// First exchange of a node that just joined.
    pub(crate) async fn init_exchange(
        self: &Arc<Self>,
        event: &DiscoveryEvent,
        topology: &TopologySnapshot,
    ) -> Result<()> {
        let source = topology
            .nodes()
            .iter()
            .find(|n| n.id != self.local.id && n.caches.contains_key(&self.name))
            .map(|n| n.id);
        if let Some(source) = source {
            match self.fetch_affinity(source).await {
                Ok(assignment) => {
                    debug!(
                        cache = %self.name,
                        source,
                        topology_version = assignment.topology_version(),
                        "Fetched affinity"
                    );
                    self.affinity.install(assignment);
                }
                Err(e) => warn!(cache = %self.name, source, error = %e, "Affinity fetch failed"),
            }
        }
        self.recompute(event, topology).await
    }

    async fn fetch_affinity(&self, source: NodeId) -> Result<AffinityAssignment> {
        match self
            .request(source, Message::AffinityFetch { topology_version: 0 })
            .await?
        {
            Message::AffinityResponse {
                topology_version,
                assignment,
            } => Ok(AffinityAssignment::new(topology_version, assignment)),
            other => Err(NetworkError::UnexpectedResponse {
                expected: "AffinityResponse",
                actual: other.kind().to_string(),
            }
            .into()),
        }
    }

    /// Finish an exchange on a node that was already running.
    pub(crate) async fn complete_exchange(
        self: &Arc<Self>,
        event: &DiscoveryEvent,
        topology: &TopologySnapshot,
    ) -> Result<()> {
        let result = self.recompute(event, topology).await;
        if let Some(near) = &self.near {
            near.clear();
        }
        self.gate.unblock();
        result
    }

    async fn recompute(
        self: &Arc<Self>,
        event: &DiscoveryEvent,
        topology: &TopologySnapshot,
    ) -> Result<()> {
        *self.topology.write() = topology.clone();
        let previous = self.affinity.latest().ok();
        let assignment = self.affinity.calculate(topology, Some(event));
        let alive: BTreeSet<NodeId> = topology.node_ids().into_iter().collect();
        let changes = self
            .partitions
            .update(&assignment, previous.as_deref(), &alive);

        info!(
            cache = %self.name,
            node_id = self.local.id,
            topology_version = topology.version(),
            primary = assignment.primary_partitions(self.local.id).len(),
            backup = assignment.backup_partitions(self.local.id).len(),
            moving = changes.moving.len(),
            lost = changes.lost.len(),
            "Exchange completed"
        );
        self.start_preload(changes.moving).await;
        Ok(())
    }

    async fn start_preload(self: &Arc<Self>, moving: Vec<(PartitionId, Vec<NodeId>)>) {
        if moving.is_empty() {
            *self.preload.lock() = ReleaseFuture::completed();
            return;
        }
        match self.config.preload_mode {
            PreloadMode::None => {
                for (partition, _) in moving {
                    self.partitions.own(partition);
                }
                *self.preload.lock() = ReleaseFuture::completed();
            }
            PreloadMode::Sync => {
                self.preload(moving).await;
                *self.preload.lock() = ReleaseFuture::completed();
            }
            PreloadMode::Async => {
                let (handle, future) = ReleaseFuture::pending();
                *self.preload.lock() = future;
                let ctx = self.clone();
                tokio::spawn(async move {
                    ctx.preload(moving).await;
                    if ctx.is_stopping() {
                        handle.fail_stopping(ctx.local.id);
                    } else {
                        handle.complete();
                    }
                });
            }
        }
    }

    /// Fetch entries of moving partitions, trying the previous owners in
    /// order. Partitions no source could supply are owned anyway.
    async fn preload(&self, moving: Vec<(PartitionId, Vec<NodeId>)>) {
        let started = std::time::Instant::now();
        let mut pending = moving;
        let mut round = 0;
        let mut total = 0;

        while !pending.is_empty() {
            if self.cancel.is_cancelled() {
                return;
            }
            let mut by_source: BTreeMap<NodeId, Vec<PartitionId>> = BTreeMap::new();
            for (partition, sources) in &pending {
                match sources.get(round) {
                    Some(source) => by_source.entry(*source).or_default().push(*partition),
                    None => {
                        warn!(cache = %self.name, partition, "No source left to preload from");
                        self.partitions.own(*partition);
                    }
                }
            }

            let mut failed = HashSet::new();
            for (source, partitions) in by_source {
                match self.preload_from(source, &partitions).await {
                    Ok(count) => {
                        total += count;
                        for partition in &partitions {
                            self.partitions.own(*partition);
                        }
                    }
                    Err(e) => {
                        warn!(cache = %self.name, source, error = %e, "Preload from node failed");
                        failed.extend(partitions);
                    }
                }
            }
            pending.retain(|(partition, _)| failed.contains(partition));
            round += 1;
        }
        info!(
            cache = %self.name,
            node_id = self.local.id,
            entries = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Preload finished"
        );
    }

    async fn preload_from(&self, source: NodeId, partitions: &[PartitionId]) -> Result<usize> {
        let response = self
            .request(
                source,
                Message::PreloadDemand {
                    partitions: partitions.to_vec(),
                },
            )
            .await?;
        let Message::PreloadSupply { entries } = response else {
            return Err(NetworkError::UnexpectedResponse {
                expected: "PreloadSupply",
                actual: response.kind().to_string(),
            }
            .into());
        };

        let count = entries.len();
        for EntrySnapshot {
            key,
            partition,
            value,
            version,
            ttl_remaining_ms,
        } in entries
        {
            self.versions.on_received(&version);
            let ttl = ttl_remaining_ms.map(Duration::from_millis);
            self.entries
                .with_entry(&key, partition, |e| e.apply_if_newer(value, version, ttl));
        }
        self.metrics.preloaded.inc_by(count as u64);
        self.evict_if_needed();
        debug!(cache = %self.name, source, partitions = partitions.len(), entries = count, "Preloaded");
        Ok(count)
    }

    /// Clear partitions the node no longer owns.
    pub(crate) fn evict_renting(&self) -> usize {
        let renting = self
            .partitions
            .snapshot()
            .partitions_in(PartitionState::Renting);
        let mut cleared = 0;
        for partition in renting {
            cleared += self.entries.clear_partition(partition);
            self.partitions.evicted(partition);
        }
        if cleared > 0 {
            debug!(cache = %self.name, node_id = self.local.id, cleared, "Rented partitions evicted");
        }
        cleared
    }

    /// Drop locks and reader registrations of a node that left.
    pub(crate) fn salvage(&self, node: NodeId) -> usize {
        let locks = self.mvcc.locks_from(node);
        for (version, key) in &locks {
            self.entries.with_existing(key, |e| e.remove_candidate(*version));
            self.mvcc.remove_lock(*version, key);
            self.entries.remove_if_empty(key);
        }
        let unread = self.entries.remove_reader_everywhere(node);
        for key in &unread {
            self.entries.remove_if_empty(key);
        }
        if !locks.is_empty() || !unread.is_empty() {
            info!(
                cache = %self.name,
                node,
                locks = locks.len(),
                readers = unread.len(),
                "Salvaged state of departed node"
            );
        }
        locks.len()
    }

    /// Partitions with no surviving owner after the last exchange.
    pub fn lost_partitions(&self) -> Vec<PartitionId> {
        self.partitions.snapshot().lost_partitions()
    }
}
