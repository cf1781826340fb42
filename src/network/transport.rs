//! Message delivery between grid nodes.
//!
//! [`LocalTransport`] connects nodes living in one process. Requests and
//! responses are still pushed through bincode so that everything crossing a
//! node boundary is exactly what a socket transport would carry.

use super::rpc::{decode_message, encode_message, Envelope, Message, MessageKind};
use crate::error::{Error, NetworkError, RemoteError, Result};
use crate::metrics::LabeledCounter;
use crate::types::NodeId;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Handler for requests arriving at a node.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a request from `from` and produce the response.
    async fn handle(&self, from: NodeId, envelope: Envelope) -> Result<Message>;
}

/// Request/response delivery between nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the response.
    async fn send(&self, from: NodeId, to: NodeId, envelope: Envelope) -> Result<Message>;
}

/// In-process transport used by embedded grids and tests.
pub struct LocalTransport {
    handlers: RwLock<HashMap<NodeId, Arc<dyn MessageHandler>>>,
    blocked: Mutex<HashSet<(NodeId, NodeId)>>,
    unblocked: Notify,
    messages: LabeledCounter<2>,
}

impl LocalTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            blocked: Mutex::new(HashSet::new()),
            unblocked: Notify::new(),
            messages: LabeledCounter::new(
                "grid_messages_sent_total",
                "Messages sent between nodes",
                ["from", "kind"],
            ),
        }
    }

    /// Make `node` reachable.
    pub fn register(&self, node: NodeId, handler: Arc<dyn MessageHandler>) {
        debug!(node, "Registered node with transport");
        self.handlers.write().insert(node, handler);
    }

    /// Make `node` unreachable.
    pub fn deregister(&self, node: NodeId) {
        if self.handlers.write().remove(&node).is_some() {
            debug!(node, "Deregistered node from transport");
        }
    }

    /// Whether `node` is reachable.
    pub fn is_registered(&self, node: NodeId) -> bool {
        self.handlers.read().contains_key(&node)
    }

    /// Hold every request from `from` to `to` until [`Self::unblock`].
    pub fn block(&self, from: NodeId, to: NodeId) {
        self.blocked.lock().insert((from, to));
    }

    /// Release requests held by [`Self::block`].
    pub fn unblock(&self, from: NodeId, to: NodeId) {
        self.blocked.lock().remove(&(from, to));
        self.unblocked.notify_waiters();
    }

    /// Messages sent, labelled by sending node and message kind.
    pub fn messages(&self) -> &LabeledCounter<2> {
        &self.messages
    }

    /// Number of messages of `kind` sent by `from`.
    pub fn sent(&self, from: NodeId, kind: MessageKind) -> u64 {
        self.messages.get([&from.to_string(), kind.as_str()])
    }

    /// Number of messages of any kind sent by `from`.
    pub fn sent_by(&self, from: NodeId) -> u64 {
        self.messages.sum_where(0, &from.to_string())
    }

    /// Number of messages of `kind` sent by any node.
    pub fn sent_of(&self, kind: MessageKind) -> u64 {
        self.messages.sum_where(1, kind.as_str())
    }

    async fn wait_unblocked(&self, from: NodeId, to: NodeId) {
        loop {
            let notified = self.unblocked.notified();
            if !self.blocked.lock().contains(&(from, to)) {
                return;
            }
            notified.await;
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut nodes: Vec<_> = self.handlers.read().keys().copied().collect();
        nodes.sort_unstable();
        f.debug_struct("LocalTransport")
            .field("nodes", &nodes)
            .field("messages", &self.messages.total())
            .finish()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, from: NodeId, to: NodeId, envelope: Envelope) -> Result<Message> {
        let kind = envelope.msg.kind();
        self.messages.inc([&from.to_string(), kind.as_str()]);
        trace!(from, to, kind = %kind, cache = %envelope.cache, "Sending message");

        self.wait_unblocked(from, to).await;

        let bytes = encode_message(&envelope)
            .map_err(|e| NetworkError::Serialization(e.to_string()))?;
        let handler = self
            .handlers
            .read()
            .get(&to)
            .cloned()
            .ok_or(NetworkError::NodeNotFound(to))?;
        let envelope =
            decode_message(&bytes).map_err(|e| NetworkError::Serialization(e.to_string()))?;

        let response: std::result::Result<Message, RemoteError> = handler
            .handle(from, envelope)
            .await
            .map_err(|e| RemoteError::from(&e));
        let bytes = bincode::serialize(&response)
            .map_err(|e| NetworkError::Serialization(e.to_string()))?;
        let response: std::result::Result<Message, RemoteError> = bincode::deserialize(&bytes)
            .map_err(|e| NetworkError::Serialization(e.to_string()))?;

        response.map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TxError;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, _from: NodeId, envelope: Envelope) -> Result<Message> {
            match envelope.msg {
                Message::IsLocked { .. } => Ok(Message::Locked(true)),
                _ => Err(Error::Tx(TxError::LockTimeout { timeout_ms: 5 })),
            }
        }
    }

    fn is_locked() -> Envelope {
        Envelope::new(
            "default",
            Message::IsLocked {
                key: bytes::Bytes::from_static(b"k"),
                partition: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_send_counts_by_sender_and_kind() {
        let transport = LocalTransport::new();
        transport.register(2, Arc::new(Echo));

        let resp = transport.send(1, 2, is_locked()).await.unwrap();
        assert!(matches!(resp, Message::Locked(true)));
        transport.send(1, 2, is_locked()).await.unwrap();

        assert_eq!(transport.sent(1, MessageKind::IsLocked), 2);
        assert_eq!(transport.sent_by(1), 2);
        assert_eq!(transport.sent_by(2), 0);
        assert_eq!(transport.sent_of(MessageKind::IsLocked), 2);
    }

    #[tokio::test]
    async fn test_remote_errors_keep_their_kind() {
        let transport = LocalTransport::new();
        transport.register(2, Arc::new(Echo));

        let err = transport
            .send(1, 2, Envelope::new("default", Message::Ack))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tx(TxError::LockTimeout { timeout_ms: 5 })));
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let transport = LocalTransport::new();
        let err = transport.send(1, 9, is_locked()).await.unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::NodeNotFound(9))));
    }

    #[tokio::test]
    async fn test_block_holds_requests() {
        let transport = Arc::new(LocalTransport::new());
        transport.register(2, Arc::new(Echo));
        transport.block(1, 2);

        let t = transport.clone();
        let pending = tokio::spawn(async move { t.send(1, 2, is_locked()).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!pending.is_finished());

        transport.unblock(1, 2);
        let resp = pending.await.unwrap().unwrap();
        assert!(matches!(resp, Message::Locked(true)));
    }
}
