//! Cluster membership: node descriptors, topology snapshots and discovery.
//!
//! Discovery is the source of truth for which nodes are alive. Every join or
//! leave produces a new [`TopologySnapshot`] with a strictly higher version;
//! caches consume the snapshot to recompute affinity.

pub mod discovery;
pub mod events;
pub mod node;
pub mod topology;

pub use discovery::LocalDiscovery;
pub use events::{DiscoveryEvent, DiscoveryListener, LoggingDiscoveryListener};
pub use node::ClusterNode;
pub use topology::TopologySnapshot;
