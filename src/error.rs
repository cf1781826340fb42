//! Error types for the cache grid.

use crate::types::{NodeId, PartitionId, TopologyVersion};
use crate::version::CacheVersion;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for cache grid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the cache grid.
#[derive(Error, Debug)]
pub enum Error {
    /// Routing or ownership errors caused by a topology change.
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Transaction and lock errors.
    #[error("transaction error: {0}")]
    Tx(#[from] TxError),

    /// Persistent store errors.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration validation errors.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Message delivery errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Value could not be marshalled or unmarshalled.
    #[error("marshal error: {0}")]
    Marshal(String),

    /// The local or remote node is stopping.
    #[error("node {0} is stopping")]
    NodeStopping(NodeId),

    /// A multi-update is already active for the cache.
    #[error("multi-update already active for cache {cache} at topology version {topology_version}")]
    MultiUpdateActive {
        cache: String,
        topology_version: TopologyVersion,
    },

    /// The named cache is not configured on this node.
    #[error("cache not found: {0}")]
    CacheNotFound(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the operation may succeed when retried against the
    /// topology that caused the failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Topology(TopologyError::NotPrimary { .. })
                | Error::Topology(TopologyError::StaleTopology { .. })
        )
    }

    /// Returns true if this error leaves a transaction in an unknown state.
    pub fn is_heuristic(&self) -> bool {
        matches!(self, Error::Tx(TxError::Heuristic { .. }))
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Marshal(err.to_string())
    }
}

/// Errors caused by partition ownership changes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// The receiving node is not the primary for the partition.
    #[error("node {node} is not primary for partition {partition} at topology version {topology_version}")]
    NotPrimary {
        partition: PartitionId,
        node: NodeId,
        topology_version: TopologyVersion,
    },

    /// The requested topology version is not known yet or was pruned.
    #[error("topology version {requested} is not available (current {current})")]
    StaleTopology {
        requested: TopologyVersion,
        current: TopologyVersion,
    },

    /// No data node owns the partition.
    #[error("no owners for partition {0}")]
    NoOwners(PartitionId),

    /// Routing kept failing after repeated remaps.
    #[error("gave up remapping partition {partition} after {attempts} attempts")]
    RemapExhausted {
        partition: PartitionId,
        attempts: usize,
    },
}

/// Transaction and lock errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    /// A lock could not be acquired before the deadline.
    #[error("lock acquisition timed out after {timeout_ms}ms")]
    LockTimeout { timeout_ms: u64 },

    /// Optimistic version validation failed.
    #[error("optimistic conflict on key {key}: expected {expected}, found {found}")]
    OptimisticConflict {
        key: String,
        expected: CacheVersion,
        found: CacheVersion,
    },

    /// The transaction was marked rollback-only.
    #[error("transaction {0} is marked rollback-only")]
    RollbackOnly(CacheVersion),

    /// The transaction was rolled back because of a failure.
    #[error("transaction {xid} rolled back: {reason}")]
    RolledBack { xid: CacheVersion, reason: String },

    /// The commit outcome cannot be determined.
    #[error("heuristic outcome for transaction {xid}: {reason}")]
    Heuristic { xid: CacheVersion, reason: String },

    /// A finish referenced a version older than the completed-versions window.
    #[error("commit version {0} is missing from the completed versions window")]
    MissingCommitVersion(CacheVersion),

    /// The operation is not valid in the current transaction state.
    #[error("invalid transaction state for {operation}: {state}")]
    InvalidState { operation: String, state: String },

    /// A key outside the locked partition was used in a group-lock transaction.
    #[error("key maps to partition {actual}, transaction is locked on partition {expected}")]
    GroupLockMismatch {
        expected: PartitionId,
        actual: PartitionId,
    },

    /// The cache is not transactional.
    #[error("cache {0} is not transactional")]
    NotTransactional(String),
}

/// Persistent store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Loading a value failed.
    #[error("load failed: {0}")]
    Load(String),

    /// Writing or removing a value failed.
    #[error("write failed: {0}")]
    Write(String),

    /// Ending a store session failed.
    #[error("session end failed: {0}")]
    Session(String),
}

/// Configuration validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A single setting is out of range or inconsistent.
    #[error("invalid configuration for cache {cache}: {reason}")]
    Invalid { cache: String, reason: String },

    /// Two caches on one node share a name.
    #[error("duplicate cache name: {0}")]
    DuplicateCache(String),

    /// A joining node disagrees with the cluster on a cache attribute.
    #[error("cache {cache} attribute {attribute} mismatch: local={local}, remote={remote}")]
    Mismatch {
        cache: String,
        attribute: &'static str,
        local: String,
        remote: String,
    },

    /// A node with the same id is already part of the topology.
    #[error("node {0} is already part of the topology")]
    DuplicateNode(NodeId),
}

/// Message delivery errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// The target node is not reachable.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// Failed to send message.
    #[error("send to node {to} failed: {reason}")]
    SendFailed { to: NodeId, reason: String },

    /// Unexpected response for a request.
    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: String,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Serializable error carried in responses between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    NotPrimary {
        partition: PartitionId,
        node: NodeId,
        topology_version: TopologyVersion,
    },
    LockTimeout {
        timeout_ms: u64,
    },
    OptimisticConflict {
        key: String,
        expected: CacheVersion,
        found: CacheVersion,
    },
    MissingCommitVersion(CacheVersion),
    Store(String),
    Stopping(NodeId),
    Other(String),
}

impl From<&Error> for RemoteError {
    fn from(err: &Error) -> Self {
        match err {
            Error::Topology(TopologyError::NotPrimary {
                partition,
                node,
                topology_version,
            }) => RemoteError::NotPrimary {
                partition: *partition,
                node: *node,
                topology_version: *topology_version,
            },
            Error::Tx(TxError::LockTimeout { timeout_ms }) => RemoteError::LockTimeout {
                timeout_ms: *timeout_ms,
            },
            Error::Tx(TxError::OptimisticConflict {
                key,
                expected,
                found,
            }) => RemoteError::OptimisticConflict {
                key: key.clone(),
                expected: *expected,
                found: *found,
            },
            Error::Tx(TxError::MissingCommitVersion(v)) => RemoteError::MissingCommitVersion(*v),
            Error::Store(e) => RemoteError::Store(e.to_string()),
            Error::NodeStopping(node) => RemoteError::Stopping(*node),
            other => RemoteError::Other(other.to_string()),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotPrimary {
                partition,
                node,
                topology_version,
            } => Error::Topology(TopologyError::NotPrimary {
                partition,
                node,
                topology_version,
            }),
            RemoteError::LockTimeout { timeout_ms } => {
                Error::Tx(TxError::LockTimeout { timeout_ms })
            }
            RemoteError::OptimisticConflict {
                key,
                expected,
                found,
            } => Error::Tx(TxError::OptimisticConflict {
                key,
                expected,
                found,
            }),
            RemoteError::MissingCommitVersion(v) => Error::Tx(TxError::MissingCommitVersion(v)),
            RemoteError::Store(reason) => Error::Store(StoreError::Write(reason)),
            RemoteError::Stopping(node) => Error::NodeStopping(node),
            RemoteError::Other(reason) => Error::Internal(reason),
        }
    }
}
