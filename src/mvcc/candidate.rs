//! Lock candidates and their flags.

use crate::types::{NodeId, TopologyVersion};
use crate::version::CacheVersion;
use bitflags::bitflags;

bitflags! {
    /// State bits of a lock candidate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CandidateFlags: u16 {
        /// Requested by the node holding the queue.
        const LOCAL = 1;
        /// Acquired more than once by the same owner.
        const REENTRY = 1 << 1;
        /// Currently holds the entry lock.
        const OWNER = 1 << 2;
        /// May be granted once it reaches the head of the queue.
        const READY = 1 << 3;
        /// Has been activated at least once.
        const USED = 1 << 4;
        /// Belongs to a transaction rather than an explicit lock.
        const TX = 1 << 5;
        /// Implicit single-key transaction.
        const SINGLE_IMPLICIT = 1 << 6;
        /// Requested by a near node.
        const NEAR_LOCAL = 1 << 7;
        /// Requested on a DHT owner on behalf of a remote transaction.
        const DHT_LOCAL = 1 << 8;
        /// Released and removed from its queue.
        const REMOVED = 1 << 9;
        /// Lock on a partition group key.
        const GROUP_LOCK = 1 << 10;
    }
}

macro_rules! flag_accessors {
    ($($get:ident, $set:ident => $flag:ident;)*) => {
        $(
            #[doc = concat!("Whether the `", stringify!($flag), "` flag is set.")]
            pub fn $get(&self) -> bool {
                self.flags.contains(CandidateFlags::$flag)
            }

            #[doc = concat!("Set or clear the `", stringify!($flag), "` flag.")]
            pub fn $set(&mut self, on: bool) {
                self.flags.set(CandidateFlags::$flag, on);
            }
        )*
    };
}

/// One owner's claim on an entry lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvccCandidate {
    version: CacheVersion,
    node_id: NodeId,
    owner_id: u64,
    topology_version: TopologyVersion,
    flags: CandidateFlags,
    reentries: u32,
}

impl MvccCandidate {
    /// Create a candidate.
    pub fn new(
        version: CacheVersion,
        node_id: NodeId,
        owner_id: u64,
        topology_version: TopologyVersion,
        flags: CandidateFlags,
    ) -> Self {
        Self {
            version,
            node_id,
            owner_id,
            topology_version,
            flags,
            reentries: 0,
        }
    }

    /// Version of the owning transaction or lock.
    pub fn version(&self) -> CacheVersion {
        self.version
    }

    /// Node that requested the lock.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Owner handle on the requesting node.
    pub fn owner_id(&self) -> u64 {
        self.owner_id
    }

    /// Topology version the lock was requested on.
    pub fn topology_version(&self) -> TopologyVersion {
        self.topology_version
    }

    /// All flags.
    pub fn flags(&self) -> CandidateFlags {
        self.flags
    }

    /// Number of stacked reentrant acquisitions.
    pub fn reentry_count(&self) -> u32 {
        self.reentries
    }

    pub(crate) fn add_reentry(&mut self) {
        self.reentries += 1;
        self.set_reentry(true);
    }

    pub(crate) fn pop_reentry(&mut self) -> bool {
        if self.reentries == 0 {
            return false;
        }
        self.reentries -= 1;
        if self.reentries == 0 {
            self.set_reentry(false);
        }
        true
    }

    /// Whether `other` is a reacquisition by the same owner.
    pub fn is_reentry_of(&self, other: &MvccCandidate) -> bool {
        if self.version == other.version {
            return true;
        }
        !self.tx() && !other.tx() && self.node_id == other.node_id && self.owner_id == other.owner_id
    }

    flag_accessors! {
        local, set_local => LOCAL;
        reentry, set_reentry => REENTRY;
        owner, set_owner => OWNER;
        ready, set_ready => READY;
        used, set_used => USED;
        tx, set_tx => TX;
        single_implicit, set_single_implicit => SINGLE_IMPLICIT;
        near_local, set_near_local => NEAR_LOCAL;
        dht_local, set_dht_local => DHT_LOCAL;
        removed, set_removed => REMOVED;
        group_lock, set_group_lock => GROUP_LOCK;
    }
}
