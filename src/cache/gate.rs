//! Gate between cache operations, multi-updates and topology exchanges.
//!
//! ```text
//!   begin_multi_update ──► exchange waits ──► end_multi_update ──► exchange blocks gate
//!   new operations ──► wait_open ◄──────────────────────────────── exchange unblocks gate
//! ```
//!
//! Both flags live in one `watch` value so that checking and flipping them
//! is a single step. Stopping the node releases every waiter with
//! [`Error::NodeStopping`].

use crate::error::{Error, Result};
use crate::types::{NodeId, TopologyVersion};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GateState {
    open: bool,
    multi_update: Option<TopologyVersion>,
    stopped: Option<NodeId>,
}

impl GateState {
    fn check_running(&self) -> Result<()> {
        match self.stopped {
            Some(node) => Err(Error::NodeStopping(node)),
            None => Ok(()),
        }
    }
}

/// Per-cache exchange gate.
#[derive(Debug)]
pub struct ExchangeGate {
    cache: String,
    state: watch::Sender<GateState>,
}

impl ExchangeGate {
    /// Create an open gate.
    pub fn new(cache: impl Into<String>) -> Self {
        let (state, _) = watch::channel(GateState {
            open: true,
            multi_update: None,
            stopped: None,
        });
        Self {
            cache: cache.into(),
            state,
        }
    }

    /// Whether new operations may start.
    pub fn is_open(&self) -> bool {
        self.state.borrow().open
    }

    /// Topology version of the active multi-update.
    pub fn multi_update(&self) -> Option<TopologyVersion> {
        self.state.borrow().multi_update
    }

    /// Wait until no exchange blocks the gate.
    pub async fn wait_open(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| s.open || s.stopped.is_some())
            .await
            .map(|s| *s)
            .map_err(|_| Error::Cancelled)?;
        state.check_running()
    }

    /// Start a multi-update at `topology_version`.
    ///
    /// Fails immediately if one is already active.
    pub async fn begin_multi_update(&self, topology_version: TopologyVersion) -> Result<()> {
        loop {
            self.wait_open().await?;
            let mut active = None;
            let mut stopped = Ok(());
            let started = self.state.send_if_modified(|s| {
                stopped = s.check_running();
                if stopped.is_err() {
                    return false;
                }
                if let Some(v) = s.multi_update {
                    active = Some(v);
                    return false;
                }
                if !s.open {
                    return false;
                }
                s.multi_update = Some(topology_version);
                true
            });
            stopped?;
            if let Some(v) = active {
                return Err(Error::MultiUpdateActive {
                    cache: self.cache.clone(),
                    topology_version: v,
                });
            }
            if started {
                return Ok(());
            }
        }
    }

    /// End the active multi-update. Returns whether one was active.
    pub fn end_multi_update(&self) -> bool {
        self.state.send_if_modified(|s| s.multi_update.take().is_some())
    }

    /// Wait for any multi-update to end, then close the gate.
    pub async fn block(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        loop {
            let state = rx
                .wait_for(|s| s.multi_update.is_none() || s.stopped.is_some())
                .await
                .map(|s| *s)
                .map_err(|_| Error::Cancelled)?;
            state.check_running()?;
            let blocked = self.state.send_if_modified(|s| {
                if s.multi_update.is_some() || s.stopped.is_some() {
                    return false;
                }
                s.open = false;
                true
            });
            if blocked {
                return Ok(());
            }
        }
    }

    /// Reopen the gate.
    pub fn unblock(&self) {
        self.state.send_if_modified(|s| !std::mem::replace(&mut s.open, true));
    }

    /// Fail current and future waiters because `node` is stopping.
    pub fn stop(&self, node: NodeId) {
        self.state.send_modify(|s| {
            s.open = true;
            s.multi_update = None;
            s.stopped.get_or_insert(node);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_nested_multi_update_fails_fast() {
        let gate = ExchangeGate::new("c");
        gate.begin_multi_update(3).await.unwrap();
        let err = gate.begin_multi_update(3).await.unwrap_err();
        assert!(matches!(
            err,
            Error::MultiUpdateActive {
                topology_version: 3,
                ..
            }
        ));
        assert!(gate.end_multi_update());
        assert!(!gate.end_multi_update());
    }

    #[tokio::test]
    async fn test_block_waits_for_multi_update() {
        let gate = Arc::new(ExchangeGate::new("c"));
        gate.begin_multi_update(1).await.unwrap();

        let g = gate.clone();
        let blocker = tokio::spawn(async move { g.block().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocker.is_finished());
        assert!(gate.is_open());

        gate.end_multi_update();
        blocker.await.unwrap().unwrap();
        assert!(!gate.is_open());
    }

    #[tokio::test]
    async fn test_stop_fails_waiters() {
        let gate = Arc::new(ExchangeGate::new("c"));
        gate.block().await.unwrap();

        let g = gate.clone();
        let op = tokio::spawn(async move { g.wait_open().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!op.is_finished());

        gate.stop(5);
        assert!(matches!(op.await.unwrap(), Err(Error::NodeStopping(5))));
        assert!(matches!(gate.block().await, Err(Error::NodeStopping(5))));
        assert!(matches!(
            gate.begin_multi_update(1).await,
            Err(Error::NodeStopping(5))
        ));
    }

    #[tokio::test]
    async fn test_operations_wait_for_unblock() {
        let gate = Arc::new(ExchangeGate::new("c"));
        gate.block().await.unwrap();

        let g = gate.clone();
        let op = tokio::spawn(async move { g.wait_open().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!op.is_finished());

        gate.unblock();
        op.await.unwrap().unwrap();
    }
}
