//! A grid node: the caches configured on one cluster member.

use crate::cache::{Cache, CacheContext};
use crate::cluster::{ClusterNode, DiscoveryEvent, TopologySnapshot};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::future::ReleaseFuture;
use crate::marshal::TypedCache;
use crate::network::{Envelope, Message, MessageHandler, Transport};
use crate::store::CacheStore;
use crate::swap::SwapSpace;
use crate::types::NodeId;
use crate::version::VersionGenerator;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Stores and swap spaces handed to caches, keyed by cache name.
#[derive(Debug, Clone, Default)]
pub struct NodeResources {
    stores: HashMap<String, Arc<dyn CacheStore>>,
    swaps: HashMap<String, Arc<dyn SwapSpace>>,
}

impl NodeResources {
    /// No stores, default swap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Back the named cache with `store`.
    pub fn with_store(mut self, cache: impl Into<String>, store: Arc<dyn CacheStore>) -> Self {
        self.stores.insert(cache.into(), store);
        self
    }

    /// Use `swap` for the named cache.
    pub fn with_swap(mut self, cache: impl Into<String>, swap: Arc<dyn SwapSpace>) -> Self {
        self.swaps.insert(cache.into(), swap);
        self
    }
}

/// Descriptor other nodes see for a node with `config`.
pub fn cluster_node(config: &NodeConfig) -> ClusterNode {
    let mut node = ClusterNode::new(config.node_id)
        .with_client(config.client)
        .with_macs(config.macs.clone());
    node.data_center_id = config.data_center_id;
    for cache in &config.caches {
        node = node.with_cache(cache.name.clone(), cache.distribution_mode);
    }
    node
}

/// One cluster member and its caches.
pub struct GridNode {
    config: NodeConfig,
    local: ClusterNode,
    versions: Arc<VersionGenerator>,
    caches: BTreeMap<String, Arc<CacheContext>>,
    stopped: AtomicBool,
}

impl GridNode {
    /// Start the caches of `config`. `local` must carry the join order
    /// assigned by discovery.
    pub fn new(
        config: NodeConfig,
        local: ClusterNode,
        transport: Arc<dyn Transport>,
        resources: NodeResources,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let versions = Arc::new(VersionGenerator::new(local.order, local.data_center_id));

        let mut caches = BTreeMap::new();
        for cache in &config.caches {
            let ctx = CacheContext::new(
                cache.clone(),
                local.clone(),
                versions.clone(),
                transport.clone(),
                resources.stores.get(&cache.name).cloned(),
                resources.swaps.get(&cache.name).cloned(),
            )?;
            caches.insert(cache.name.clone(), ctx);
        }

        info!(
            node_id = local.id,
            order = local.order,
            client = local.client,
            caches = caches.len(),
            "Grid node started"
        );
        Ok(Arc::new(Self {
            config,
            local,
            versions,
            caches,
            stopped: AtomicBool::new(false),
        }))
    }

    /// Node id.
    pub fn id(&self) -> NodeId {
        self.local.id
    }

    /// Descriptor of this node, with its join order.
    pub fn local(&self) -> &ClusterNode {
        &self.local
    }

    /// Node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Version generator shared by the node's caches.
    pub fn versions(&self) -> &VersionGenerator {
        &self.versions
    }

    /// Names of the configured caches.
    pub fn cache_names(&self) -> Vec<String> {
        self.caches.keys().cloned().collect()
    }

    /// A new handle to the named cache.
    pub fn cache(&self, name: &str) -> Result<Cache> {
        self.caches
            .get(name)
            .map(|ctx| Cache::new(ctx.clone()))
            .ok_or_else(|| Error::CacheNotFound(name.to_string()))
    }

    /// A typed handle to the named cache.
    pub fn typed_cache<K, V>(&self, name: &str) -> Result<TypedCache<K, V>>
    where
        K: Serialize,
        V: Serialize + DeserializeOwned,
    {
        Ok(TypedCache::new(self.cache(name)?))
    }

    pub(crate) fn contexts(&self) -> impl Iterator<Item = &Arc<CacheContext>> {
        self.caches.values()
    }

    /// First exchange phase on a node that was already running.
    pub async fn prepare_exchange(&self, event: &DiscoveryEvent, topology: &TopologySnapshot) -> Result<()> {
        for ctx in self.contexts() {
            ctx.prepare_exchange(event, topology).await?;
        }
        Ok(())
    }

    /// Exchange on the node that just joined.
    pub async fn init_exchange(&self, event: &DiscoveryEvent, topology: &TopologySnapshot) -> Result<()> {
        for ctx in self.contexts() {
            ctx.init_exchange(event, topology).await?;
        }
        Ok(())
    }

    /// Last exchange phase on a node that was already running.
    pub async fn complete_exchange(&self, event: &DiscoveryEvent, topology: &TopologySnapshot) -> Result<()> {
        for ctx in self.contexts() {
            ctx.complete_exchange(event, topology).await?;
        }
        Ok(())
    }

    /// Completes when every cache finished preloading.
    pub fn preload_future(&self) -> ReleaseFuture {
        ReleaseFuture::join(self.contexts().map(|ctx| ctx.preload_future()))
    }

    /// Clear partitions this node no longer owns.
    pub fn evict_renting(&self) -> usize {
        self.contexts().map(|ctx| ctx.evict_renting()).sum()
    }

    /// Stop every cache. Pending and later operations fail with
    /// [`Error::NodeStopping`].
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for ctx in self.contexts() {
            ctx.stop().await;
        }
        info!(node_id = self.local.id, "Grid node stopped");
    }

    /// Whether [`GridNode::stop`] was called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for GridNode {
    async fn handle(&self, from: NodeId, envelope: Envelope) -> Result<Message> {
        if self.is_stopped() {
            return Err(Error::NodeStopping(self.local.id));
        }
        let ctx = self
            .caches
            .get(&envelope.cache)
            .ok_or_else(|| Error::CacheNotFound(envelope.cache.clone()))?;
        ctx.handle_message(from, envelope.msg).await
    }
}

impl std::fmt::Debug for GridNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridNode")
            .field("node_id", &self.local.id)
            .field("order", &self.local.order)
            .field("caches", &self.caches.keys().collect::<Vec<_>>())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
