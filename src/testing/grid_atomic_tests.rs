//! Atomic caches across several in-process nodes.
//!
//! These tests cover:
//! - PRIMARY and CLOCK write ordering and the messages each sends
//! - Write synchronization modes
//! - Near caches and their invalidation
//! - Expiry, replicated mode and async admission
//! - Eviction to swap, read-through, write-through and write-behind

#[cfg(test)]
mod tests {
    use crate::config::{
        CacheConfig, EvictionConfig, EvictionPolicyKind, NodeConfig, StoreConfig, WriteBehindConfig,
    };
    use crate::grid::{GridNode, NodeResources};
    use crate::network::{EntryUpdate, Message, MessageKind};
    use crate::store::{CacheStore, MemoryStore};
    use crate::testing::utils::{
        init_tracing, key_not_owned_by, key_with_backup, key_with_primary, wait_for,
        wait_for_result,
    };
    use crate::testing::TestGrid;
    use crate::types::{CacheMode, DistributionMode, WriteOrderMode, WriteSyncMode};
    use crate::version::CacheVersion;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    const CACHE: &str = "atomic";

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn atomic_cache() -> CacheConfig {
        CacheConfig::new(CACHE).with_backups(1)
    }

    /// Versions held by the primary and every backup of `key`.
    fn owner_versions(grid: &TestGrid, owners: &[u64], key: &str) -> Vec<Option<(Option<Bytes>, CacheVersion)>> {
        owners
            .iter()
            .map(|id| {
                let cache = grid.node(*id).unwrap().cache(CACHE).unwrap();
                cache
                    .local_entry(key.as_bytes())
                    .map(|e| (e.value, e.version))
            })
            .collect()
    }

    async fn start_with_store(
        grid: &TestGrid,
        count: u64,
        config: CacheConfig,
        store: &Arc<MemoryStore>,
    ) -> Vec<Arc<GridNode>> {
        let mut nodes = Vec::new();
        for id in 1..=count {
            let resources =
                NodeResources::new().with_store(CACHE, store.clone() as Arc<dyn CacheStore>);
            let node = grid
                .start_node_with(NodeConfig::new(id).with_cache(config.clone()), resources)
                .await
                .unwrap();
            nodes.push(node);
        }
        nodes
    }

    // ==================== Write Ordering ====================

    #[tokio::test]
    async fn test_primary_order_routes_through_primary() {
        init_tracing();
        let grid = TestGrid::new();
        let nodes = grid.start_nodes(3, atomic_cache()).await.unwrap();
        let cache = nodes[0].cache(CACHE).unwrap();
        let key = key_not_owned_by(&cache, 1);
        let owners = cache.affinity().map_key_to_primary_and_backups(key.as_bytes());

        cache.put(key.clone(), "v1").await.unwrap();

        assert_eq!(grid.transport().sent(1, MessageKind::NearAtomicUpdate), 1);
        assert_eq!(grid.transport().sent(owners[0], MessageKind::DhtAtomicUpdate), 1);
        let versions = owner_versions(&grid, &owners, &key);
        let (value, version) = versions[0].clone().unwrap();
        assert_eq!(value, Some(b("v1")));
        assert_eq!(versions[1], versions[0]);
        let primary_order = grid.node(owners[0]).unwrap().local().order;
        assert_eq!(version.node_order, primary_order);
        assert_eq!(version.topology_version, 3);
    }

    #[tokio::test]
    async fn test_primary_order_last_write_wins() {
        let grid = TestGrid::new();
        let nodes = grid.start_nodes(3, atomic_cache()).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        let c3 = nodes[2].cache(CACHE).unwrap();
        let key = key_with_primary(&c1, 2);

        c1.put(key.clone(), "first").await.unwrap();
        let first = nodes[1].cache(CACHE).unwrap().local_entry(key.as_bytes()).unwrap().version;
        c3.put(key.clone(), "second").await.unwrap();
        let second = nodes[1].cache(CACHE).unwrap().local_entry(key.as_bytes()).unwrap().version;

        assert!(second > first);
        for node in &nodes {
            let cache = node.cache(CACHE).unwrap();
            assert_eq!(cache.get(key.clone()).await.unwrap(), Some(b("second")));
        }

        c1.remove(key.clone()).await.unwrap();
        assert_eq!(c3.get(key.clone()).await.unwrap(), None);
        assert!(nodes[1].cache(CACHE).unwrap().local_entry(key.as_bytes()).is_none());
    }

    #[tokio::test]
    async fn test_backup_keeps_removal_over_older_put() {
        let grid = TestGrid::new();
        let nodes = grid.start_nodes(3, atomic_cache()).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        let backup = nodes[2].cache(CACHE).unwrap();
        let key = key_with_backup(&c1, 3);
        let primary = c1.affinity().map_key_to_primary_and_backups(key.as_bytes())[0];

        c1.put(key.clone(), "v1").await.unwrap();
        let base = backup.local_entry(key.as_bytes()).unwrap();
        let update = |value: Option<&str>, ahead: u64| {
            Message::DhtAtomicUpdate(EntryUpdate {
                key: Bytes::from(key.clone()),
                partition: base.partition,
                value: value.map(b),
                version: CacheVersion::new(
                    base.version.topology_version,
                    base.version.global_order + ahead,
                    base.version.node_order,
                    base.version.data_center_id,
                ),
                ttl_ms: None,
            })
        };

        // The removal overtakes the put the primary issued before it.
        let ctx = backup.context();
        ctx.handle_message(primary, update(None, 2)).await.unwrap();
        ctx.handle_message(primary, update(Some("v2"), 1)).await.unwrap();

        let entry = backup.local_entry(key.as_bytes()).unwrap();
        assert_eq!(entry.value, None);
        assert_eq!(entry.version.global_order, base.version.global_order + 2);
        assert_eq!(backup.get(key.clone()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clock_order_origin_sends_to_every_owner() {
        let grid = TestGrid::new();
        let config = atomic_cache().with_write_order_mode(WriteOrderMode::Clock);
        let nodes = grid.start_nodes(3, config).await.unwrap();
        let cache = nodes[0].cache(CACHE).unwrap();
        let key = key_not_owned_by(&cache, 1);
        let owners = cache.affinity().map_key_to_primary_and_backups(key.as_bytes());

        cache.put(key.clone(), "v1").await.unwrap();

        assert_eq!(grid.transport().sent(1, MessageKind::NearAtomicUpdate), 2);
        assert_eq!(grid.transport().sent_of(MessageKind::DhtAtomicUpdate), 0);
        let versions = owner_versions(&grid, &owners, &key);
        let (_, version) = versions[0].clone().unwrap();
        assert_eq!(versions[0], versions[1]);
        // Stamped by the origin.
        assert_eq!(version.node_order, nodes[0].local().order);
    }

    #[tokio::test]
    async fn test_clock_order_keeps_highest_version() {
        let grid = TestGrid::new();
        let config = atomic_cache().with_write_order_mode(WriteOrderMode::Clock);
        let nodes = grid.start_nodes(3, config).await.unwrap();
        let cache = nodes[0].cache(CACHE).unwrap();
        let key = key_with_primary(&cache, 2);

        cache.put(key.clone(), "current").await.unwrap();
        let primary = nodes[1].cache(CACHE).unwrap();
        let current = primary.local_entry(key.as_bytes()).unwrap().version;

        let stale = CacheVersion::new(1, 1, 1, 0);
        assert!(stale < current);
        let update = primary.context().clock_update(
            &b(&key),
            cache.affinity().partition(key.as_bytes()),
            Some(b("stale")),
            None,
            stale,
        );
        primary
            .context()
            .handle_message(3, Message::NearAtomicUpdate(update))
            .await
            .unwrap();

        let entry = primary.local_entry(key.as_bytes()).unwrap();
        assert_eq!(entry.value, Some(b("current")));
        assert_eq!(entry.version, current);
    }

    #[tokio::test]
    async fn test_clock_order_concurrent_writes_converge() {
        let grid = TestGrid::new();
        let config = atomic_cache().with_write_order_mode(WriteOrderMode::Clock);
        let nodes = grid.start_nodes(3, config).await.unwrap();
        let key = key_with_primary(&nodes[0].cache(CACHE).unwrap(), 2);
        let owners = nodes[0]
            .cache(CACHE)
            .unwrap()
            .affinity()
            .map_key_to_primary_and_backups(key.as_bytes());

        let mut writers = Vec::new();
        for node in &nodes {
            let cache = node.cache(CACHE).unwrap();
            let key = key.clone();
            writers.push(tokio::spawn(async move {
                for i in 0..20 {
                    cache
                        .put(key.clone(), format!("{}-{i}", cache.context().local_id()))
                        .await
                        .unwrap();
                }
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let versions = owner_versions(&grid, &owners, &key);
        assert!(versions[0].is_some());
        assert_eq!(versions[0], versions[1]);
    }

    // ==================== Write Synchronization ====================

    #[tokio::test]
    async fn test_full_sync_waits_for_backup() {
        let grid = TestGrid::new();
        let nodes = grid.start_nodes(2, atomic_cache()).await.unwrap();
        let cache = nodes[0].cache(CACHE).unwrap();
        let key = key_with_primary(&cache, 1);

        grid.transport().block(1, 2);
        let c = cache.clone();
        let k = key.clone();
        let put = tokio::spawn(async move { c.put(k, "v").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!put.is_finished());

        grid.transport().unblock(1, 2);
        put.await.unwrap().unwrap();
        let backup = nodes[1].cache(CACHE).unwrap();
        assert_eq!(backup.local_entry(key.as_bytes()).unwrap().value, Some(b("v")));
    }

    #[tokio::test]
    async fn test_primary_sync_does_not_wait_for_backup() {
        let grid = TestGrid::new();
        let config = atomic_cache().with_write_sync_mode(WriteSyncMode::PrimarySync);
        let nodes = grid.start_nodes(2, config).await.unwrap();
        let cache = nodes[0].cache(CACHE).unwrap();
        let key = key_with_primary(&cache, 1);
        let backup = nodes[1].cache(CACHE).unwrap();

        grid.transport().block(1, 2);
        tokio::time::timeout(Duration::from_secs(1), cache.put(key.clone(), "v"))
            .await
            .expect("primary sync put waited for the backup")
            .unwrap();
        assert!(backup.local_entry(key.as_bytes()).is_none());

        grid.transport().unblock(1, 2);
        let arrived = wait_for(
            || backup.local_entry(key.as_bytes()).is_some(),
            Duration::from_secs(2),
            Duration::from_millis(10),
        )
        .await;
        assert!(arrived);
    }

    // ==================== Near Cache ====================

    #[tokio::test]
    async fn test_near_copy_invalidated_by_remote_write() {
        let grid = TestGrid::new();
        let config = CacheConfig::new(CACHE).with_distribution_mode(DistributionMode::NearPartitioned);
        let nodes = grid.start_nodes(3, config).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        let c3 = nodes[2].cache(CACHE).unwrap();
        let key = key_with_primary(&c1, 2);

        c3.put(key.clone(), "old").await.unwrap();
        assert_eq!(c1.get(key.clone()).await.unwrap(), Some(b("old")));
        assert_eq!(c1.near_peek(key.as_bytes()), Some(b("old")));
        assert_eq!(c1.get(key.clone()).await.unwrap(), Some(b("old")));
        assert_eq!(c1.metrics().near_hits.get(), 1);

        c3.put(key.clone(), "new").await.unwrap();
        assert!(grid.transport().sent(2, MessageKind::Invalidate) >= 1);
        assert_eq!(c1.near_peek(key.as_bytes()), None);
        assert_eq!(c1.get(key.clone()).await.unwrap(), Some(b("new")));
        assert_eq!(c1.stats().near_entry_count, 1);
    }

    #[tokio::test]
    async fn test_near_only_client_reads_through_owners() {
        let grid = TestGrid::new();
        let config = CacheConfig::new(CACHE);
        grid.start_nodes(2, config.clone()).await.unwrap();
        let client = grid
            .start_node(
                NodeConfig::new(10)
                    .with_client(true)
                    .with_cache(config.with_distribution_mode(DistributionMode::NearOnly)),
            )
            .await
            .unwrap();
        let cache = client.cache(CACHE).unwrap();
        assert!(cache.affinity().primary_partitions(10).is_empty());

        cache.put("k", "v").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b("v")));
        assert_eq!(cache.near_peek(b"k"), Some(b("v")));
        assert!(cache.local_entry(b"k").is_none());
    }

    // ==================== Expiry ====================

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let grid = TestGrid::new();
        let nodes = grid.start_nodes(2, atomic_cache()).await.unwrap();
        let cache = nodes[0].cache(CACHE).unwrap();

        cache
            .put_with_ttl("short", "v", Duration::from_millis(100))
            .await
            .unwrap();
        cache.put("long", "v").await.unwrap();
        assert_eq!(cache.get("short").await.unwrap(), Some(b("v")));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(cache.get("short").await.unwrap(), None);
        assert_eq!(cache.get("long").await.unwrap(), Some(b("v")));
    }

    #[tokio::test]
    async fn test_default_ttl_applies_to_puts() {
        let grid = TestGrid::new();
        let config = atomic_cache().with_default_ttl(Duration::from_millis(100));
        let nodes = grid.start_nodes(1, config).await.unwrap();
        let cache = nodes[0].cache(CACHE).unwrap();

        cache.put("k", "v").await.unwrap();
        assert!(cache.local_entry(b"k").unwrap().ttl_remaining_ms.is_some());
        let expired = wait_for_result(
            || cache.get("k"),
            |r| matches!(r, Ok(None)),
            Duration::from_secs(2),
        )
        .await;
        assert!(expired.is_some());
    }

    // ==================== Replicated Mode ====================

    #[tokio::test]
    async fn test_replicated_cache_reads_locally() {
        let grid = TestGrid::new();
        let config = CacheConfig::new(CACHE).with_cache_mode(CacheMode::Replicated);
        let nodes = grid.start_nodes(3, config).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();

        for i in 0..20 {
            c1.put(format!("r-{i}"), "v").await.unwrap();
        }
        for node in &nodes {
            let cache = node.cache(CACHE).unwrap();
            assert_eq!(cache.stats().entry_count, 20);
            for i in 0..20 {
                assert_eq!(cache.get(format!("r-{i}")).await.unwrap(), Some(b("v")));
            }
        }
        assert_eq!(grid.transport().sent_of(MessageKind::NearGet), 0);
    }

    #[tokio::test]
    async fn test_replicated_cache_preloads_new_node() {
        let grid = TestGrid::new();
        let config = CacheConfig::new(CACHE).with_cache_mode(CacheMode::Replicated);
        let nodes = grid.start_nodes(2, config.clone()).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        for i in 0..50 {
            c1.put(format!("r-{i}"), "v").await.unwrap();
        }

        let joined = grid
            .start_node(NodeConfig::new(3).with_cache(config))
            .await
            .unwrap();
        let cache = joined.cache(CACHE).unwrap();
        assert_eq!(cache.stats().entry_count, 50);
        assert_eq!(cache.metrics().preloaded.get(), 50);
    }

    // ==================== Async Operations ====================

    #[tokio::test]
    async fn test_async_operations_are_bounded() {
        let grid = TestGrid::new();
        let config = atomic_cache().with_max_concurrent_async_ops(50);
        let nodes = grid.start_nodes(2, config).await.unwrap();
        let cache = nodes[0].cache(CACHE).unwrap();

        let mut ops = Vec::with_capacity(5000);
        for i in 0..5000 {
            ops.push(cache.put_async(format!("a-{i}"), "v").await.unwrap());
        }
        for op in ops {
            op.join().await.unwrap();
        }

        let in_flight = &cache.metrics().async_in_flight;
        assert!(in_flight.peak() <= 50, "peak was {}", in_flight.peak());
        assert!(in_flight.peak() >= 1);
        assert_eq!(in_flight.get(), 0);

        let get = cache.get_async("a-42").await.unwrap();
        assert_eq!(get.join().await.unwrap(), Some(b("v")));
        cache.remove_async("a-42").await.unwrap().join().await.unwrap();
        assert_eq!(cache.get("a-42").await.unwrap(), None);
    }

    // ==================== Eviction and Swap ====================

    #[tokio::test]
    async fn test_eviction_overflows_to_swap() {
        let grid = TestGrid::new();
        let config = CacheConfig::new(CACHE)
            .with_eviction(EvictionConfig::new(EvictionPolicyKind::Lru, 10).with_swap(true));
        let nodes = grid.start_nodes(1, config).await.unwrap();
        let cache = nodes[0].cache(CACHE).unwrap();

        for i in 0..30 {
            cache.put(format!("e-{i}"), format!("v{i}")).await.unwrap();
        }
        let stats = cache.stats();
        assert!(stats.entry_count <= 10, "entry count {}", stats.entry_count);
        assert_eq!(stats.swapped_count, 20);
        assert_eq!(cache.metrics().evictions.get(), 20);
        assert_eq!(cache.metrics().swapped_out.get(), 20);

        for i in 0..30 {
            assert_eq!(
                cache.get(format!("e-{i}")).await.unwrap(),
                Some(Bytes::from(format!("v{i}")))
            );
        }
        assert!(cache.metrics().unswapped.get() >= 20);
    }

    #[tokio::test]
    async fn test_eviction_without_swap_drops_entries() {
        let grid = TestGrid::new();
        let config = CacheConfig::new(CACHE)
            .with_eviction(EvictionConfig::new(EvictionPolicyKind::Fifo, 5));
        let nodes = grid.start_nodes(1, config).await.unwrap();
        let cache = nodes[0].cache(CACHE).unwrap();

        for i in 0..10 {
            cache.put(format!("e-{i}"), "v").await.unwrap();
        }
        assert_eq!(cache.stats().entry_count, 5);
        assert_eq!(cache.get("e-0").await.unwrap(), None);
        assert_eq!(cache.get("e-9").await.unwrap(), Some(b("v")));
    }

    // ==================== Stores ====================

    #[tokio::test]
    async fn test_read_through_loads_once_at_primary() {
        let grid = TestGrid::new();
        let store = Arc::new(MemoryStore::new());
        store.insert("stored", "from-store");
        let config = atomic_cache().with_store(StoreConfig::write_through());
        let nodes = start_with_store(&grid, 2, config, &store).await;
        let c1 = nodes[0].cache(CACHE).unwrap();
        let c2 = nodes[1].cache(CACHE).unwrap();

        assert_eq!(c1.get("stored").await.unwrap(), Some(b("from-store")));
        assert_eq!(c2.get("stored").await.unwrap(), Some(b("from-store")));
        assert_eq!(store.load_count(), 1);
        assert_eq!(c1.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_through_updates_store() {
        let grid = TestGrid::new();
        let store = Arc::new(MemoryStore::new());
        let config = atomic_cache().with_store(StoreConfig::write_through());
        let nodes = start_with_store(&grid, 2, config, &store).await;
        let cache = nodes[0].cache(CACHE).unwrap();

        cache.put("k", "v").await.unwrap();
        assert_eq!(store.get(b"k"), Some(b("v")));
        cache.remove("k").await.unwrap();
        assert!(store.get(b"k").is_none());

        store.set_failing(true);
        assert!(cache.put("k", "v2").await.is_err());
        store.set_failing(false);
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_writes_reach_store_in_version_order() {
        let grid = TestGrid::new();
        let store = Arc::new(MemoryStore::new());
        let config = atomic_cache().with_store(StoreConfig::write_through());
        let nodes = start_with_store(&grid, 2, config, &store).await;
        let c1 = nodes[0].cache(CACHE).unwrap();
        let key = key_with_primary(&c1, 1);

        store.set_write_delay(Duration::from_millis(150));
        let c = c1.clone();
        let k = key.clone();
        let slow = tokio::spawn(async move { c.put(k, "slow").await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.set_write_delay(Duration::ZERO);
        c1.put(key.clone(), "fast").await.unwrap();
        slow.await.unwrap().unwrap();

        assert_eq!(store.get(key.as_bytes()), Some(b("fast")));
        for node in &nodes {
            let cache = node.cache(CACHE).unwrap();
            assert_eq!(cache.get(key.clone()).await.unwrap(), Some(b("fast")));
        }
    }

    #[tokio::test]
    async fn test_write_behind_flushes_in_background() {
        let grid = TestGrid::new();
        let store = Arc::new(MemoryStore::new());
        let config = atomic_cache().with_store(StoreConfig::write_behind(WriteBehindConfig {
            flush_size: 1000,
            flush_frequency: Duration::from_millis(50),
        }));
        let nodes = start_with_store(&grid, 2, config, &store).await;
        let cache = nodes[0].cache(CACHE).unwrap();

        for i in 0..10 {
            cache.put(format!("w-{i}"), "v").await.unwrap();
        }
        let flushed = wait_for(|| store.len() == 10, Duration::from_secs(2), Duration::from_millis(10)).await;
        assert!(flushed, "store holds {} entries", store.len());
        assert_eq!(cache.get("w-3").await.unwrap(), Some(b("v")));
    }

    #[tokio::test]
    async fn test_write_behind_flushes_on_stop() {
        let grid = TestGrid::new();
        let store = Arc::new(MemoryStore::new());
        let config = atomic_cache().with_store(StoreConfig::write_behind(WriteBehindConfig {
            flush_size: 1000,
            flush_frequency: Duration::from_secs(60),
        }));
        let nodes = start_with_store(&grid, 1, config, &store).await;
        let cache = nodes[0].cache(CACHE).unwrap();

        cache.put("k", "v").await.unwrap();
        let write_behind = cache.context().write_behind().unwrap().clone();
        assert_eq!(write_behind.pending(), 1);
        assert!(store.get(b"k").is_none());

        grid.shutdown().await;
        assert_eq!(store.get(b"k"), Some(b("v")));
    }
}
