//! Completion barrier shared by lock-release and preload waits.
//!
//! A [`ReleaseFuture`] is a cloneable view over one or more `watch`
//! channels. It completes when every underlying [`ReleaseHandle`] has been
//! completed. A handle failed by a stopping node makes waiters see
//! [`Error::NodeStopping`]; a handle dropped without an outcome makes them
//! see [`Error::Cancelled`].

use crate::error::{Error, Result};
use crate::types::NodeId;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReleaseState {
    Pending,
    Done,
    Stopped(NodeId),
}

/// Completing side of a [`ReleaseFuture`].
#[derive(Debug)]
pub struct ReleaseHandle {
    tx: watch::Sender<ReleaseState>,
}

impl ReleaseHandle {
    /// Mark the future as done.
    pub fn complete(&self) {
        self.tx.send_replace(ReleaseState::Done);
    }

    /// Fail the future because `node` is stopping. No effect once done.
    pub fn fail_stopping(&self, node: NodeId) {
        self.tx.send_if_modified(|state| {
            if *state != ReleaseState::Pending {
                return false;
            }
            *state = ReleaseState::Stopped(node);
            true
        });
    }

    /// Whether the future was already completed.
    pub fn is_complete(&self) -> bool {
        *self.tx.borrow() == ReleaseState::Done
    }
}

/// Future resolving once all tracked holders have released.
#[derive(Debug, Clone)]
pub struct ReleaseFuture {
    parts: Vec<watch::Receiver<ReleaseState>>,
}

impl ReleaseFuture {
    /// Create a pending future with its completing handle.
    pub fn pending() -> (ReleaseHandle, ReleaseFuture) {
        let (tx, rx) = watch::channel(ReleaseState::Pending);
        (ReleaseHandle { tx }, ReleaseFuture { parts: vec![rx] })
    }

    /// Create a future that is already done.
    pub fn completed() -> Self {
        Self { parts: Vec::new() }
    }

    /// Combine several futures into one that completes when all do.
    pub fn join(futures: impl IntoIterator<Item = ReleaseFuture>) -> Self {
        Self {
            parts: futures.into_iter().flat_map(|f| f.parts).collect(),
        }
    }

    /// Whether the future has completed.
    pub fn is_done(&self) -> bool {
        self.parts
            .iter()
            .all(|rx| *rx.borrow() == ReleaseState::Done)
    }

    /// Wait for completion.
    pub async fn wait(&self) -> Result<()> {
        for rx in &self.parts {
            let mut rx = rx.clone();
            let state = rx
                .wait_for(|state| *state != ReleaseState::Pending)
                .await
                .map(|state| *state)
                .map_err(|_| Error::Cancelled)?;
            if let ReleaseState::Stopped(node) = state {
                return Err(Error::NodeStopping(node));
            }
        }
        Ok(())
    }

    /// Wait for completion with a deadline.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Invoke `listener` with the outcome once the future resolves.
    pub fn listen<F>(&self, listener: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let fut = self.clone();
        tokio::spawn(async move {
            listener(fut.wait().await);
        });
    }
}
