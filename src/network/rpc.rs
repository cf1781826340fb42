//! Messages exchanged between grid nodes.
//!
//! Every request travels inside an [`Envelope`] naming the cache it targets.
//! Requests from a near (originating) node are prefixed `Near`, requests a
//! primary sends to its backups are prefixed `Dht`.

use crate::entry::EntrySnapshot;
use crate::types::{CacheKey, CacheValue, NodeId, PartitionId, TopologyVersion};
use crate::version::CacheVersion;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A message addressed to one cache on the receiving node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Target cache name.
    pub cache: String,

    /// Payload.
    pub msg: Message,
}

impl Envelope {
    /// Wrap a message for `cache`.
    pub fn new(cache: impl Into<String>, msg: Message) -> Self {
        Self {
            cache: cache.into(),
            msg,
        }
    }
}

/// Requests and responses of the cache protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Read a key from its primary.
    NearGet(GetRequest),

    /// Value and version of a key.
    GetResponse(GetResponse),

    /// Acquire a transaction or explicit lock at the primary.
    NearLock(LockRequest),

    /// Lock granted, with the current value and version.
    LockResponse(GetResponse),

    /// Release one explicit-lock acquisition.
    Unlock(UnlockRequest),

    /// Ask the primary whether a key is locked.
    IsLocked { key: CacheKey, partition: PartitionId },

    /// Answer to [`Message::IsLocked`].
    Locked(bool),

    /// Commit or roll back a transaction at one primary.
    TxFinish(FinishRequest),

    /// Versions the primary stamped while finishing.
    FinishResponse(FinishResponse),

    /// Committed transaction writes replicated to a backup.
    DhtTxUpdate(DhtTxUpdate),

    /// Atomic write sent by the originating node.
    NearAtomicUpdate(AtomicUpdate),

    /// Atomic write replicated by the primary to a backup.
    DhtAtomicUpdate(EntryUpdate),

    /// Version an atomic write was applied with.
    AtomicUpdateResponse { version: CacheVersion },

    /// Drop a near copy older than `version`.
    Invalidate { key: CacheKey, version: CacheVersion },

    /// Request entries of partitions being moved to the sender.
    PreloadDemand { partitions: Vec<PartitionId> },

    /// Entries answering a [`Message::PreloadDemand`].
    PreloadSupply { entries: Vec<EntrySnapshot> },

    /// Request the assignment computed for a topology version.
    AffinityFetch { topology_version: TopologyVersion },

    /// Assignment answering a [`Message::AffinityFetch`].
    AffinityResponse {
        topology_version: TopologyVersion,
        assignment: Vec<Vec<NodeId>>,
    },

    /// Empty acknowledgement.
    Ack,
}

/// Kind of a message, used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    NearGet,
    GetResponse,
    NearLock,
    LockResponse,
    Unlock,
    IsLocked,
    Locked,
    TxFinish,
    FinishResponse,
    DhtTxUpdate,
    NearAtomicUpdate,
    DhtAtomicUpdate,
    AtomicUpdateResponse,
    Invalidate,
    PreloadDemand,
    PreloadSupply,
    AffinityFetch,
    AffinityResponse,
    Ack,
}

impl MessageKind {
    /// Label value.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::NearGet => "NearGet",
            MessageKind::GetResponse => "GetResponse",
            MessageKind::NearLock => "NearLock",
            MessageKind::LockResponse => "LockResponse",
            MessageKind::Unlock => "Unlock",
            MessageKind::IsLocked => "IsLocked",
            MessageKind::Locked => "Locked",
            MessageKind::TxFinish => "TxFinish",
            MessageKind::FinishResponse => "FinishResponse",
            MessageKind::DhtTxUpdate => "DhtTxUpdate",
            MessageKind::NearAtomicUpdate => "NearAtomicUpdate",
            MessageKind::DhtAtomicUpdate => "DhtAtomicUpdate",
            MessageKind::AtomicUpdateResponse => "AtomicUpdateResponse",
            MessageKind::Invalidate => "Invalidate",
            MessageKind::PreloadDemand => "PreloadDemand",
            MessageKind::PreloadSupply => "PreloadSupply",
            MessageKind::AffinityFetch => "AffinityFetch",
            MessageKind::AffinityResponse => "AffinityResponse",
            MessageKind::Ack => "Ack",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    /// Kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::NearGet(_) => MessageKind::NearGet,
            Message::GetResponse(_) => MessageKind::GetResponse,
            Message::NearLock(_) => MessageKind::NearLock,
            Message::LockResponse(_) => MessageKind::LockResponse,
            Message::Unlock(_) => MessageKind::Unlock,
            Message::IsLocked { .. } => MessageKind::IsLocked,
            Message::Locked(_) => MessageKind::Locked,
            Message::TxFinish(_) => MessageKind::TxFinish,
            Message::FinishResponse(_) => MessageKind::FinishResponse,
            Message::DhtTxUpdate(_) => MessageKind::DhtTxUpdate,
            Message::NearAtomicUpdate(_) => MessageKind::NearAtomicUpdate,
            Message::DhtAtomicUpdate(_) => MessageKind::DhtAtomicUpdate,
            Message::AtomicUpdateResponse { .. } => MessageKind::AtomicUpdateResponse,
            Message::Invalidate { .. } => MessageKind::Invalidate,
            Message::PreloadDemand { .. } => MessageKind::PreloadDemand,
            Message::PreloadSupply { .. } => MessageKind::PreloadSupply,
            Message::AffinityFetch { .. } => MessageKind::AffinityFetch,
            Message::AffinityResponse { .. } => MessageKind::AffinityResponse,
            Message::Ack => MessageKind::Ack,
        }
    }
}

/// Read request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: CacheKey,
    pub partition: PartitionId,
    pub topology_version: TopologyVersion,
    /// Register the sender as a near reader of the entry.
    pub register_reader: bool,
}

/// Value and version of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponse {
    pub value: Option<CacheValue>,
    pub version: CacheVersion,
}

/// Lock request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    /// Transaction version, or a fresh version for an explicit lock.
    pub xid: CacheVersion,
    pub key: CacheKey,
    pub partition: PartitionId,
    pub topology_version: TopologyVersion,
    /// Lock owner handle on the sender.
    pub owner_id: u64,
    /// Transaction lock rather than explicit lock.
    pub tx: bool,
    /// Lock on a partition group key.
    pub group: bool,
    /// Wait deadline; `None` waits forever.
    pub timeout_ms: Option<u64>,
}

/// Explicit unlock request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockRequest {
    pub key: CacheKey,
    pub partition: PartitionId,
    pub owner_id: u64,
}

/// One write of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxWrite {
    pub key: CacheKey,
    pub partition: PartitionId,
    /// `None` removes the key.
    pub value: Option<CacheValue>,
    pub ttl_ms: Option<u64>,
}

/// Finish request for the part of a transaction mapped to one primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishRequest {
    pub xid: CacheVersion,
    pub commit: bool,
    pub topology_version: TopologyVersion,
    pub writes: Vec<TxWrite>,
    /// Keys locked at this primary, with their partitions.
    pub locked: Vec<(CacheKey, PartitionId)>,
}

/// Versions stamped by a primary for committed writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinishResponse {
    pub versions: Vec<(CacheKey, CacheVersion)>,
}

/// A versioned write applied on a backup or near node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryUpdate {
    pub key: CacheKey,
    pub partition: PartitionId,
    pub value: Option<CacheValue>,
    pub version: CacheVersion,
    pub ttl_ms: Option<u64>,
}

/// Committed writes of a transaction for one backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtTxUpdate {
    pub xid: CacheVersion,
    pub updates: Vec<EntryUpdate>,
}

/// Atomic write from the originating node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicUpdate {
    pub key: CacheKey,
    pub partition: PartitionId,
    pub value: Option<CacheValue>,
    pub ttl_ms: Option<u64>,
    pub topology_version: TopologyVersion,
    /// Set in CLOCK mode where the origin stamps the write.
    pub version: Option<CacheVersion>,
}

/// Encode an envelope to bytes.
pub fn encode_message(envelope: &Envelope) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(envelope)
}

/// Decode an envelope from bytes.
pub fn decode_message(data: &[u8]) -> Result<Envelope, bincode::Error> {
    bincode::deserialize(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_envelope_survives_encoding() {
        let msg = Message::NearLock(LockRequest {
            xid: CacheVersion::new(3, 9, 2, 0),
            key: Bytes::from_static(b"key"),
            partition: 17,
            topology_version: 3,
            owner_id: 5,
            tx: true,
            group: false,
            timeout_ms: Some(250),
        });
        let encoded = encode_message(&Envelope::new("orders", msg)).unwrap();
        let decoded = decode_message(&encoded).unwrap();

        assert_eq!(decoded.cache, "orders");
        match decoded.msg {
            Message::NearLock(req) => {
                assert_eq!(req.xid, CacheVersion::new(3, 9, 2, 0));
                assert_eq!(req.partition, 17);
                assert_eq!(req.timeout_ms, Some(250));
            }
            other => panic!("Wrong message type: {:?}", other.kind()),
        }
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(Message::Ack.kind().as_str(), "Ack");
        let msg = Message::Invalidate {
            key: Bytes::from_static(b"k"),
            version: CacheVersion::zero(),
        };
        assert_eq!(msg.kind(), MessageKind::Invalidate);
        assert_eq!(MessageKind::DhtAtomicUpdate.to_string(), "DhtAtomicUpdate");
    }
}
