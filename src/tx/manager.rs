//! Per-cache transaction bookkeeping.

use super::completed::CompletedVersions;
use crate::types::{TxConcurrency, TxIsolation, TxState};
use crate::version::CacheVersion;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Instant;

/// Summary of a transaction started on this node.
#[derive(Debug, Clone)]
pub struct TxInfo {
    pub concurrency: TxConcurrency,
    pub isolation: TxIsolation,
    pub state: TxState,
    pub started: Instant,
}

/// Tracks local transactions and transactions finished on this node.
#[derive(Debug)]
pub struct TxManager {
    active: DashMap<CacheVersion, TxInfo>,
    completed: Mutex<CompletedVersions>,
}

impl TxManager {
    /// Create a manager remembering `window` completed versions.
    pub fn new(window: usize) -> Self {
        Self {
            active: DashMap::new(),
            completed: Mutex::new(CompletedVersions::new(window)),
        }
    }

    /// Register a transaction started here.
    pub fn register(&self, xid: CacheVersion, concurrency: TxConcurrency, isolation: TxIsolation) {
        self.active.insert(
            xid,
            TxInfo {
                concurrency,
                isolation,
                state: TxState::Active,
                started: Instant::now(),
            },
        );
    }

    /// Record a state change of a local transaction.
    pub fn set_state(&self, xid: CacheVersion, state: TxState) {
        if let Some(mut info) = self.active.get_mut(&xid) {
            info.state = state;
        }
    }

    /// Forget a local transaction.
    pub fn deregister(&self, xid: CacheVersion) -> Option<TxInfo> {
        self.active.remove(&xid).map(|(_, info)| info)
    }

    /// Info of a local transaction.
    pub fn info(&self, xid: CacheVersion) -> Option<TxInfo> {
        self.active.get(&xid).map(|i| i.clone())
    }

    /// Number of local transactions not yet finished.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Record that `xid` finished on this node.
    pub fn complete(&self, xid: CacheVersion) -> bool {
        self.completed.lock().add(xid)
    }

    /// Whether `xid` already finished on this node.
    pub fn is_completed(&self, xid: &CacheVersion) -> bool {
        self.completed.lock().contains(xid)
    }

    /// Whether `xid` is too old to be checked against the completed window.
    pub fn is_missing(&self, xid: &CacheVersion) -> bool {
        self.completed.lock().is_missing(xid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_deregister() {
        let manager = TxManager::new(8);
        let xid = CacheVersion::new(1, 1, 1, 0);
        manager.register(xid, TxConcurrency::Pessimistic, TxIsolation::RepeatableRead);
        assert_eq!(manager.active_count(), 1);

        manager.set_state(xid, TxState::Committing);
        assert_eq!(manager.info(xid).map(|i| i.state), Some(TxState::Committing));

        assert!(manager.deregister(xid).is_some());
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_completed_window() {
        let manager = TxManager::new(1);
        let old = CacheVersion::new(1, 1, 1, 0);
        let new = CacheVersion::new(1, 2, 1, 0);
        assert!(manager.complete(new));
        assert!(manager.is_completed(&new));
        assert!(manager.is_missing(&old));
    }
}
