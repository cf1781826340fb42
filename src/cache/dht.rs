//! Handlers run on partition owners.
//!
//! The primary of a partition serializes access to its keys: it grants
//! locks, stamps committed writes and replicates them to backups. Backups
//! only apply versioned updates and keep the highest version they saw.
//!
//! ```text
//!   origin ── NearLock ──────► primary ── (queue) ── LockResponse ──► origin
//!   origin ── TxFinish ──────► primary ── DhtTxUpdate ──────────────► backups
//!   origin ── NearAtomicUpdate► primary ── DhtAtomicUpdate ─────────► backups
//!                                  └──── Invalidate ────────────────► near readers
//! ```

use super::context::{ttl_ms, BoxFuture, CacheContext};
use super::keylock::KeyGuard;
use crate::error::{Error, NetworkError, Result, TopologyError, TxError};
use crate::mvcc::{CandidateFlags, LockOutcome, MvccCandidate};
use crate::network::{
    AtomicUpdate, DhtTxUpdate, EntryUpdate, FinishRequest, FinishResponse, GetRequest,
    GetResponse, LockRequest, Message, UnlockRequest,
};
use crate::affinity::AffinityAssignment;
use crate::types::{CacheKey, CacheValue, NodeId, PartitionId, WriteOrderMode, WriteSyncMode};
use crate::version::CacheVersion;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

enum LockStatus {
    Owned,
    Waiting,
    Gone,
}

impl CacheContext {
    /// Dispatch a request received from `from`.
    pub(crate) fn handle_message(&self, from: NodeId, msg: Message) -> BoxFuture<'_, Result<Message>> {
        Box::pin(async move {
            self.ensure_running()?;
            trace!(cache = %self.name, from, kind = %msg.kind(), "Handling message");
            match msg {
                Message::NearGet(req) => self.on_near_get(from, req).await,
                Message::NearLock(req) => self.on_near_lock(from, req).await,
                Message::Unlock(req) => self.on_unlock(from, req),
                Message::IsLocked { key, partition } => self.on_is_locked(&key, partition),
                Message::TxFinish(req) => self.on_tx_finish(from, req).await,
                Message::DhtTxUpdate(req) => Ok(self.on_dht_tx_update(req)),
                Message::NearAtomicUpdate(req) => match self.config.write_order_mode {
                    WriteOrderMode::Primary => self.on_primary_atomic_update(from, req).await,
                    WriteOrderMode::Clock => self.on_clock_atomic_update(from, req).await,
                },
                Message::DhtAtomicUpdate(update) => Ok(self.on_dht_atomic_update(update)),
                Message::Invalidate { key, version } => {
                    if let Some(near) = &self.near {
                        if near.invalidate(&key, version) {
                            trace!(cache = %self.name, %version, "Near copy invalidated");
                        }
                    }
                    Ok(Message::Ack)
                }
                Message::PreloadDemand { partitions } => {
                    let wanted: HashSet<PartitionId> = partitions.into_iter().collect();
                    let entries = self.entries.partition_entries(&wanted);
                    debug!(
                        cache = %self.name,
                        to = from,
                        partitions = wanted.len(),
                        entries = entries.len(),
                        "Supplying preload"
                    );
                    Ok(Message::PreloadSupply { entries })
                }
                Message::AffinityFetch { topology_version } => {
                    let assignment = if topology_version == 0 {
                        self.affinity.latest()?
                    } else {
                        self.affinity.assignment(topology_version)?
                    };
                    Ok(Message::AffinityResponse {
                        topology_version: assignment.topology_version(),
                        assignment: assignment.assignment().to_vec(),
                    })
                }
                other => Err(NetworkError::UnexpectedResponse {
                    expected: "request",
                    actual: other.kind().to_string(),
                }
                .into()),
            }
        })
    }

    /// Value and version of `key` on its primary, loading it from the store
    /// on a miss when read-through is on. `reader` is registered as a near
    /// reader when a value is returned.
    pub(crate) async fn read_at_primary(
        &self,
        key: &CacheKey,
        partition: PartitionId,
        reader: Option<NodeId>,
    ) -> Result<(Option<CacheValue>, CacheVersion)> {
        let swapped = self.entries.peek(key).is_none();
        let found = self.entries.with_existing(key, |e| {
            let value = e.value().cloned();
            if let (Some(node), Some(_)) = (reader, &value) {
                e.add_reader(node);
            }
            (value, e.version())
        });
        if swapped && found.is_some() {
            self.metrics.unswapped.inc();
        }
        let (value, version) = found.unwrap_or((None, CacheVersion::zero()));
        if value.is_some() || !self.config.store.read_through {
            return Ok((value, version));
        }
        let Some(store) = &self.store else {
            return Ok((value, version));
        };

        // A load racing an atomic write could otherwise bring back a value
        // the write just removed.
        let _guard = self.lock_key(key).await?;
        let Some(loaded) = store.load(key).await? else {
            return Ok((None, version));
        };
        let stamp = self.versions.next(self.topology_version());
        let ttl = self.config.default_ttl;
        let result = self.entries.with_entry(key, partition, |e| {
            if e.value().is_none() && e.version() < stamp {
                e.apply(Some(loaded), stamp, ttl);
            }
            let value = e.value().cloned();
            if let (Some(node), Some(_)) = (reader, &value) {
                e.add_reader(node);
            }
            (value, e.version())
        });
        trace!(cache = %self.name, version = %result.1, "Loaded value through store");
        self.evict_if_needed();
        Ok(result)
    }

    async fn on_near_get(&self, from: NodeId, req: GetRequest) -> Result<Message> {
        self.check_primary(req.partition)?;
        let reader = (req.register_reader && from != self.local.id).then_some(from);
        let (value, version) = self.read_at_primary(&req.key, req.partition, reader).await?;
        Ok(Message::GetResponse(GetResponse { value, version }))
    }

    async fn on_near_lock(&self, from: NodeId, req: LockRequest) -> Result<Message> {
        let assignment = self.check_primary(req.partition)?;
        let topology_version = assignment.topology_version();

        let mut flags = CandidateFlags::READY;
        flags.set(CandidateFlags::TX, req.tx);
        flags.set(CandidateFlags::GROUP_LOCK, req.group);
        if from == self.local.id {
            flags |= CandidateFlags::LOCAL;
        } else {
            flags |= CandidateFlags::NEAR_LOCAL;
        }
        let candidate = MvccCandidate::new(req.xid, from, req.owner_id, topology_version, flags);

        let (outcome, inserted) = self.entries.with_entry(&req.key, req.partition, |e| {
            let before = e.candidates().len();
            let outcome = e.add_candidate(candidate);
            (outcome, e.candidates().len() > before)
        });
        if inserted {
            self.mvcc
                .add_lock(req.xid, &req.key, req.partition, topology_version, from);
        }
        trace!(cache = %self.name, xid = %req.xid, from, ?outcome, "Lock requested");

        if outcome == LockOutcome::Queued {
            self.metrics.lock_waits.inc();
            if let Err(e) = self.await_lock(from, &req).await {
                self.abandon_lock(from, &req);
                if matches!(e, Error::Tx(TxError::LockTimeout { .. })) {
                    self.metrics.lock_timeouts.inc();
                    debug!(cache = %self.name, xid = %req.xid, from, "Lock wait timed out");
                }
                return Err(e);
            }
        }

        let (value, version) = self.read_at_primary(&req.key, req.partition, None).await?;
        Ok(Message::LockResponse(GetResponse { value, version }))
    }

    fn lock_status(&self, from: NodeId, req: &LockRequest) -> LockStatus {
        self.entries
            .with_existing(&req.key, |e| {
                let queue = e.candidates();
                let (owned, present) = if req.tx {
                    (queue.is_owned_by(req.xid), queue.candidate(req.xid).is_some())
                } else {
                    (
                        queue.is_owned_by_owner(from, req.owner_id),
                        queue
                            .iter()
                            .any(|c| !c.tx() && c.node_id() == from && c.owner_id() == req.owner_id),
                    )
                };
                match (owned, present) {
                    (true, _) => LockStatus::Owned,
                    (false, true) => LockStatus::Waiting,
                    (false, false) => LockStatus::Gone,
                }
            })
            .unwrap_or(LockStatus::Gone)
    }

    async fn await_lock(&self, from: NodeId, req: &LockRequest) -> Result<()> {
        let deadline = req
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        loop {
            let notify = self
                .entries
                .with_existing(&req.key, |e| e.lock_notify())
                .ok_or(Error::Cancelled)?;
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.lock_status(from, req) {
                LockStatus::Owned => return Ok(()),
                LockStatus::Gone => return Err(Error::Cancelled),
                LockStatus::Waiting => {}
            }

            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = &mut notified => {}
                _ = expired => {
                    return Err(TxError::LockTimeout {
                        timeout_ms: req.timeout_ms.unwrap_or_default(),
                    }
                    .into());
                }
                _ = self.cancel.cancelled() => return Err(Error::NodeStopping(self.local.id)),
            }
        }
    }

    /// Undo one lock acquisition that will not be reported to its requester.
    fn abandon_lock(&self, from: NodeId, req: &LockRequest) {
        let released = self
            .entries
            .with_existing(&req.key, |e| {
                if req.tx {
                    e.remove_candidate(req.xid)
                } else {
                    e.release_owner(from, req.owner_id)
                }
            })
            .flatten();
        if let Some(released) = released {
            if released.removed {
                self.mvcc.remove_lock(released.candidate.version(), &req.key);
            }
        }
        self.entries.remove_if_empty(&req.key);
    }

    fn on_unlock(&self, from: NodeId, req: UnlockRequest) -> Result<Message> {
        self.check_primary(req.partition)?;
        let released = self
            .entries
            .with_existing(&req.key, |e| e.release_owner(from, req.owner_id))
            .flatten();
        match released {
            Some(released) => {
                if released.removed {
                    self.mvcc.remove_lock(released.candidate.version(), &req.key);
                    self.entries.remove_if_empty(&req.key);
                }
                trace!(cache = %self.name, from, removed = released.removed, "Explicit lock released");
            }
            None => debug!(cache = %self.name, from, owner_id = req.owner_id, "Unlock without a held lock"),
        }
        Ok(Message::Ack)
    }

    fn on_is_locked(&self, key: &CacheKey, partition: PartitionId) -> Result<Message> {
        self.check_primary(partition)?;
        let locked = self
            .entries
            .with_existing(key, |e| e.is_locked())
            .unwrap_or(false);
        Ok(Message::Locked(locked))
    }

    async fn on_tx_finish(&self, from: NodeId, req: FinishRequest) -> Result<Message> {
        self.versions.on_received(&req.xid);
        if req.commit {
            if self.txs.is_completed(&req.xid) {
                debug!(cache = %self.name, xid = %req.xid, "Duplicate finish ignored");
                return Ok(Message::FinishResponse(FinishResponse::default()));
            }
            let holds_locks = req.locked.iter().any(|(key, _)| {
                self.entries
                    .with_existing(key, |e| e.candidates().candidate(req.xid).is_some())
                    .unwrap_or(false)
            });
            if !holds_locks && self.txs.is_missing(&req.xid) {
                return Err(TxError::MissingCommitVersion(req.xid).into());
            }
        }

        let mut response = FinishResponse::default();
        let mut replicated = Ok(());
        if req.commit && !req.writes.is_empty() {
            let assignment = self.latest()?;
            let version = self.versions.next(assignment.topology_version());
            let mut per_backup: BTreeMap<NodeId, Vec<EntryUpdate>> = BTreeMap::new();
            let mut invalidations: Vec<(CacheKey, BTreeSet<NodeId>)> = Vec::new();

            for write in &req.writes {
                let ttl = write.ttl_ms.map(Duration::from_millis);
                let readers = self.entries.with_entry(&write.key, write.partition, |e| {
                    e.apply(write.value.clone(), version, ttl);
                    e.take_readers()
                });
                if write.value.is_some() {
                    self.metrics.puts.inc();
                } else {
                    self.metrics.removes.inc();
                }
                for backup in assignment.backups(write.partition) {
                    per_backup.entry(*backup).or_default().push(EntryUpdate {
                        key: write.key.clone(),
                        partition: write.partition,
                        value: write.value.clone(),
                        version,
                        ttl_ms: write.ttl_ms,
                    });
                }
                invalidations.push((write.key.clone(), readers));
                response.versions.push((write.key.clone(), version));
            }

            let wait = self.config.write_sync_mode == WriteSyncMode::FullSync;
            let targets = per_backup
                .into_iter()
                .map(|(backup, updates)| {
                    (
                        backup,
                        Message::DhtTxUpdate(DhtTxUpdate {
                            xid: req.xid,
                            updates,
                        }),
                    )
                })
                .collect();
            replicated = self.send_all(targets, wait).await;

            let wait_readers = self.config.write_sync_mode != WriteSyncMode::FullAsync;
            for (key, readers) in invalidations {
                self.invalidate_readers(&key, readers, version, from, wait_readers)
                    .await;
            }
            debug!(
                cache = %self.name,
                xid = %req.xid,
                %version,
                writes = req.writes.len(),
                "Transaction committed at primary"
            );
        }

        self.release_tx_locks(&req);
        self.evict_if_needed();

        if let Err(e) = replicated {
            warn!(cache = %self.name, xid = %req.xid, error = %e, "Backup replication failed");
            return Err(e);
        }
        Ok(Message::FinishResponse(response))
    }

    fn release_tx_locks(&self, req: &FinishRequest) {
        self.txs.complete(req.xid);
        let keys: BTreeSet<&CacheKey> = req
            .locked
            .iter()
            .map(|(key, _)| key)
            .chain(req.writes.iter().map(|w| &w.key))
            .collect();
        for key in keys {
            self.entries.with_existing(key, |e| e.remove_candidate(req.xid));
            self.mvcc.remove_lock(req.xid, key);
            self.entries.remove_if_empty(key);
        }
    }

    fn on_dht_tx_update(&self, req: DhtTxUpdate) -> Message {
        for update in req.updates {
            self.apply_update(update);
        }
        self.evict_if_needed();
        Message::Ack
    }

    fn on_dht_atomic_update(&self, update: EntryUpdate) -> Message {
        self.apply_update(update);
        self.evict_if_needed();
        Message::Ack
    }

    /// Apply a replicated write unless a newer version is already present.
    ///
    /// A removal leaves the entry in place as a tombstone carrying its
    /// version. Backup updates may arrive out of order, and an older put
    /// delivered after the removal must not bring the value back.
    fn apply_update(&self, update: EntryUpdate) -> bool {
        self.versions.on_received(&update.version);
        let ttl = update.ttl_ms.map(Duration::from_millis);
        let applied = self.entries.with_entry(&update.key, update.partition, |e| {
            e.apply_if_newer(update.value, update.version, ttl)
        });
        if !applied {
            trace!(cache = %self.name, version = %update.version, "Stale backup update ignored");
        }
        applied
    }

    /// Wait for the write lock of `key`, giving up when the node stops.
    async fn lock_key(&self, key: &CacheKey) -> Result<KeyGuard<'_>> {
        tokio::select! {
            guard = self.write_locks.lock(key) => Ok(guard),
            _ = self.cancel.cancelled() => Err(Error::NodeStopping(self.local.id)),
        }
    }

    async fn on_primary_atomic_update(&self, from: NodeId, req: AtomicUpdate) -> Result<Message> {
        self.check_primary(req.partition)?;
        let guard = self.lock_key(&req.key).await?;
        // Ownership may have moved while waiting.
        let assignment = self.check_primary(req.partition)?;
        let topology_version = assignment.topology_version();
        let version = self.versions.next(topology_version);

        self.mvcc
            .add_lock(version, &req.key, req.partition, topology_version, from);
        let result = self
            .apply_primary_update(from, &req, version, &assignment, guard)
            .await;
        self.mvcc.remove_lock(version, &req.key);
        result?;
        Ok(Message::AtomicUpdateResponse { version })
    }

    /// Write through, apply locally, then replicate. `guard` is held until
    /// the local apply so that the store and the entry see the same order.
    async fn apply_primary_update(
        &self,
        from: NodeId,
        req: &AtomicUpdate,
        version: CacheVersion,
        assignment: &AffinityAssignment,
        guard: KeyGuard<'_>,
    ) -> Result<()> {
        self.store_update(None, &req.key, req.value.clone()).await?;

        let ttl = req.ttl_ms.map(Duration::from_millis);
        let readers = self.entries.with_entry(&req.key, req.partition, |e| {
            if e.apply_if_newer(req.value.clone(), version, ttl) {
                e.take_readers()
            } else {
                BTreeSet::new()
            }
        });
        if req.value.is_some() {
            self.metrics.puts.inc();
        } else {
            self.metrics.removes.inc();
            self.entries.remove_if_empty(&req.key);
        }
        drop(guard);

        let update = EntryUpdate {
            key: req.key.clone(),
            partition: req.partition,
            value: req.value.clone(),
            version,
            ttl_ms: req.ttl_ms,
        };
        let targets = assignment
            .backups(req.partition)
            .iter()
            .map(|backup| (*backup, Message::DhtAtomicUpdate(update.clone())))
            .collect();
        let wait = self.config.write_sync_mode == WriteSyncMode::FullSync;
        self.send_all(targets, wait).await?;

        let wait_readers = self.config.write_sync_mode != WriteSyncMode::FullAsync;
        self.invalidate_readers(&req.key, readers, version, from, wait_readers)
            .await;
        self.evict_if_needed();
        trace!(cache = %self.name, %version, from, "Atomic update applied at primary");
        Ok(())
    }

    async fn on_clock_atomic_update(&self, from: NodeId, req: AtomicUpdate) -> Result<Message> {
        let assignment = self.latest()?;
        if !assignment.is_owner(self.local.id, req.partition) {
            return Err(TopologyError::NotPrimary {
                partition: req.partition,
                node: self.local.id,
                topology_version: assignment.topology_version(),
            }
            .into());
        }
        let version = req
            .version
            .ok_or_else(|| Error::Internal("clock update without a version".to_string()))?;
        self.versions.on_received(&version);

        let primary = assignment.is_primary(self.local.id, req.partition);
        let guard = self.lock_key(&req.key).await?;
        let newer = self
            .entries
            .with_existing(&req.key, |e| version > e.version())
            .unwrap_or(true);
        if primary && newer {
            self.store_update(None, &req.key, req.value.clone()).await?;
        }

        let ttl = req.ttl_ms.map(Duration::from_millis);
        let (applied, readers) = self.entries.with_entry(&req.key, req.partition, |e| {
            let applied = e.apply_if_newer(req.value.clone(), version, ttl);
            let readers = if applied && primary {
                e.take_readers()
            } else {
                BTreeSet::new()
            };
            (applied, readers)
        });
        drop(guard);
        if applied {
            if req.value.is_some() {
                self.metrics.puts.inc();
            } else {
                self.metrics.removes.inc();
            }
        } else {
            trace!(cache = %self.name, %version, "Stale clock update ignored");
        }

        if primary {
            let wait = self.config.write_sync_mode != WriteSyncMode::FullAsync;
            self.invalidate_readers(&req.key, readers, version, from, wait)
                .await;
        }
        self.evict_if_needed();
        Ok(Message::AtomicUpdateResponse { version })
    }

    /// Build the update a CLOCK origin sends to each owner.
    pub(crate) fn clock_update(
        &self,
        key: &CacheKey,
        partition: PartitionId,
        value: Option<CacheValue>,
        ttl: Option<Duration>,
        version: CacheVersion,
    ) -> AtomicUpdate {
        AtomicUpdate {
            key: key.clone(),
            partition,
            value,
            ttl_ms: ttl_ms(ttl),
            topology_version: version.topology_version,
            version: Some(version),
        }
    }
}
