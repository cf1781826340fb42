//! Originating-node side of reads and atomic writes.
//!
//! Reads are served locally when the node owns the key, then from the near
//! cache, and otherwise from the primary. Atomic writes go to the primary
//! in PRIMARY write order; in CLOCK order the origin stamps the write and
//! sends it to every owner itself.

use super::context::{expect_get, expect_version, ttl_ms, CacheContext};
use crate::affinity::AffinityAssignment;
use crate::error::{Result, TopologyError};
use crate::network::{AtomicUpdate, GetRequest, GetResponse, Message};
use crate::partition::PartitionState;
use crate::types::{CacheKey, CacheValue, PartitionId, WriteOrderMode, WriteSyncMode};
use crate::version::CacheVersion;
use std::time::Duration;
use tracing::trace;

impl CacheContext {
    /// Read `key`, remapping on topology changes.
    pub(crate) async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>> {
        let partition = self.partition(key);
        self.remap(partition, move || self.get_once(key, partition))
            .await
    }

    async fn get_once(&self, key: &CacheKey, partition: PartitionId) -> Result<Option<CacheValue>> {
        let assignment = self.latest()?;
        if let Some(value) = self.local_read(&assignment, key, partition).await? {
            return Ok(value);
        }

        if let Some(near) = &self.near {
            if let Some((value, _)) = near.get(key) {
                self.metrics.record_near(true);
                return Ok(Some(value));
            }
            self.metrics.record_near(false);
        }

        let primary = assignment
            .primary(partition)
            .ok_or(TopologyError::NoOwners(partition))?;
        let request = GetRequest {
            key: key.clone(),
            partition,
            topology_version: assignment.topology_version(),
            register_reader: self.near.is_some(),
        };
        let GetResponse { value, version } =
            expect_get(self.request(primary, Message::NearGet(request)).await?)?;
        if !version.is_zero() {
            self.versions.on_received(&version);
        }
        if let (Some(near), Some(value)) = (&self.near, &value) {
            near.insert(key.clone(), value.clone(), version);
        }
        Ok(value)
    }

    /// Serve a read from local entries when the node owns the partition.
    /// Returns `None` when the read has to go remote.
    async fn local_read(
        &self,
        assignment: &AffinityAssignment,
        key: &CacheKey,
        partition: PartitionId,
    ) -> Result<Option<Option<CacheValue>>> {
        let local = self.local.id;
        if assignment.is_primary(local, partition) {
            let (value, _) = self.read_at_primary(key, partition, None).await?;
            return Ok(Some(value));
        }
        if assignment.is_backup(local, partition)
            && self.partitions.state(partition) == Some(PartitionState::Owning)
        {
            let value = self
                .entries
                .with_existing(key, |e| e.value().cloned())
                .flatten();
            if value.is_some() {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Value and version of `key` read from its primary, without near
    /// caching or reader registration.
    pub(crate) async fn primary_read(&self, key: &CacheKey, partition: PartitionId) -> Result<GetResponse> {
        self.remap(partition, move || async move {
            let (assignment, primary) = self.primary_of(partition)?;
            if primary == self.local.id {
                let (value, version) = self.read_at_primary(key, partition, None).await?;
                return Ok(GetResponse { value, version });
            }
            let request = GetRequest {
                key: key.clone(),
                partition,
                topology_version: assignment.topology_version(),
                register_reader: false,
            };
            let response = expect_get(self.request(primary, Message::NearGet(request)).await?)?;
            self.versions.on_received(&response.version);
            Ok(response)
        })
        .await
    }

    /// Write or remove `key` outside a transaction. Returns the version the
    /// write was applied with.
    pub(crate) async fn atomic_update(
        &self,
        key: &CacheKey,
        value: Option<CacheValue>,
        ttl: Option<Duration>,
    ) -> Result<CacheVersion> {
        let partition = self.partition(key);
        let ttl = if value.is_some() {
            ttl.or(self.config.default_ttl)
        } else {
            None
        };
        let value = &value;
        let version = self
            .remap(partition, move || async move {
                match self.config.write_order_mode {
                    WriteOrderMode::Primary => {
                        self.primary_update_once(key, partition, value.clone(), ttl)
                            .await
                    }
                    WriteOrderMode::Clock => {
                        self.clock_update_once(key, partition, value.clone(), ttl)
                            .await
                    }
                }
            })
            .await?;

        if let Some(near) = &self.near {
            near.invalidate(key, version);
        }
        trace!(cache = %self.name, %version, "Atomic update done");
        Ok(version)
    }

    async fn primary_update_once(
        &self,
        key: &CacheKey,
        partition: PartitionId,
        value: Option<CacheValue>,
        ttl: Option<Duration>,
    ) -> Result<CacheVersion> {
        let (assignment, primary) = self.primary_of(partition)?;
        let update = AtomicUpdate {
            key: key.clone(),
            partition,
            value,
            ttl_ms: ttl_ms(ttl),
            topology_version: assignment.topology_version(),
            version: None,
        };
        expect_version(self.request(primary, Message::NearAtomicUpdate(update)).await?)
    }

    async fn clock_update_once(
        &self,
        key: &CacheKey,
        partition: PartitionId,
        value: Option<CacheValue>,
        ttl: Option<Duration>,
    ) -> Result<CacheVersion> {
        let (assignment, primary) = self.primary_of(partition)?;
        let version = self.versions.next(assignment.topology_version());
        let update = self.clock_update(key, partition, value, ttl, version);

        expect_version(
            self.request(primary, Message::NearAtomicUpdate(update.clone()))
                .await?,
        )?;

        let mut targets = Vec::new();
        for backup in assignment.backups(partition) {
            if *backup == self.local.id {
                self.request(*backup, Message::NearAtomicUpdate(update.clone()))
                    .await?;
            } else {
                targets.push((*backup, Message::NearAtomicUpdate(update.clone())));
            }
        }
        let wait = self.config.write_sync_mode == WriteSyncMode::FullSync;
        self.send_all(targets, wait).await?;
        Ok(version)
    }
}
