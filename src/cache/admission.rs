//! Admission control for asynchronous cache operations.

use crate::error::{Error, Result};
use crate::types::NodeId;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Bounds the number of async operations in flight for one cache.
#[derive(Debug, Clone)]
pub struct AsyncAdmission {
    permits: Option<Arc<Semaphore>>,
    limit: usize,
    node: NodeId,
}

impl AsyncAdmission {
    /// Create a limiter for `node`; a limit of 0 admits everything.
    pub fn new(limit: usize, node: NodeId) -> Self {
        Self {
            permits: (limit > 0).then(|| Arc::new(Semaphore::new(limit))),
            limit,
            node,
        }
    }

    /// Configured limit, 0 if unlimited.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Permits currently free, `None` if unlimited.
    pub fn available(&self) -> Option<usize> {
        self.permits.as_ref().map(|p| p.available_permits())
    }

    /// Wait for a slot. The slot is released when the permit is dropped.
    pub async fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>> {
        match &self.permits {
            Some(permits) => permits
                .clone()
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| Error::NodeStopping(self.node)),
            None => Ok(None),
        }
    }

    /// Stop admitting; waiters fail with [`Error::NodeStopping`].
    pub fn close(&self) {
        if let Some(permits) = &self.permits {
            permits.close();
        }
    }
}

/// Handle to a running async cache operation.
#[derive(Debug)]
pub struct AsyncOp<T> {
    handle: JoinHandle<Result<T>>,
}

impl<T> AsyncOp<T> {
    pub(crate) fn new(handle: JoinHandle<Result<T>>) -> Self {
        Self { handle }
    }

    /// Whether the operation finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the result.
    pub async fn join(self) -> Result<T> {
        self.handle
            .await
            .map_err(|e| Error::Internal(format!("async operation failed: {e}")))?
    }
}
