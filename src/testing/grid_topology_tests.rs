//! Topology changes: joins, leaves, preloading and the exchange gate.
//!
//! These tests cover:
//! - Synchronous and asynchronous preloading of joining nodes
//! - Partition release waiting for locks of older topologies
//! - Multi-updates holding off exchanges
//! - Configuration checks at join time
//! - Node stop, salvage of departed nodes and lost partitions
//! - Affinity agreement across nodes for every affinity function

#[cfg(test)]
mod tests {
    use crate::affinity::AffinityAssignment;
    use crate::config::{AffinityConfig, AffinityKind, CacheConfig, NodeConfig};
    use crate::error::{ConfigError, Error};
    use crate::partition::PartitionState;
    use crate::testing::utils::{init_tracing, key_with_primary, wait_for};
    use crate::testing::TestGrid;
    use crate::types::{
        AtomicityMode, CacheKey, DistributionMode, PreloadMode, TxConcurrency, TxIsolation,
    };
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    const CACHE: &str = "topo";

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn cache_config() -> CacheConfig {
        CacheConfig::new(CACHE).with_backups(1)
    }

    fn tx_config() -> CacheConfig {
        cache_config().with_atomicity_mode(AtomicityMode::Transactional)
    }

    fn keys(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("key-{i}")).collect()
    }

    /// Latest assignment, checked to be the same on every running node.
    fn agreed_assignment(grid: &TestGrid) -> Arc<AffinityAssignment> {
        let nodes = grid.nodes();
        let first = nodes[0].cache(CACHE).unwrap().affinity().latest().unwrap();
        for node in &nodes[1..] {
            let other = node.cache(CACHE).unwrap().affinity().latest().unwrap();
            assert_eq!(other.topology_version(), first.topology_version());
            assert_eq!(other.assignment(), first.assignment(), "node {} disagrees", node.id());
        }
        first
    }

    // ==================== Joins ====================

    #[tokio::test]
    async fn test_join_preloads_and_evicts_rented_partitions() {
        init_tracing();
        let grid = TestGrid::new();
        let nodes = grid.start_nodes(2, cache_config()).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        for key in keys(200) {
            c1.put(key.clone(), key).await.unwrap();
        }

        let joined = grid
            .start_node(NodeConfig::new(3).with_cache(cache_config()))
            .await
            .unwrap();
        let c3 = joined.cache(CACHE).unwrap();
        assert!(c3.metrics().preloaded.get() > 0);
        assert!(c3.preload_future().is_done());

        for key in keys(200) {
            let owners = c3.affinity().map_key_to_primary_and_backups(key.as_bytes());
            assert_eq!(owners.len(), 2);
            for node in grid.nodes() {
                let entry = node.cache(CACHE).unwrap().local_entry(key.as_bytes());
                if owners.contains(&node.id()) {
                    assert_eq!(entry.and_then(|e| e.value), Some(b(&key)), "{key} missing on owner {}", node.id());
                } else {
                    assert!(entry.is_none(), "{key} left on non-owner {}", node.id());
                }
            }
            assert_eq!(c3.get(key.clone()).await.unwrap(), Some(b(&key)));
        }
    }

    #[tokio::test]
    async fn test_async_preload_completes_in_background() {
        let grid = TestGrid::new();
        let config = cache_config().with_preload_mode(PreloadMode::Async);
        let nodes = grid.start_nodes(1, config.clone()).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        for key in keys(100) {
            c1.put(key.clone(), "v").await.unwrap();
        }

        let joined = grid
            .start_node(NodeConfig::new(2).with_cache(config))
            .await
            .unwrap();
        grid.preload_future()
            .wait_timeout(Duration::from_secs(5))
            .await
            .unwrap();

        let c2 = joined.cache(CACHE).unwrap();
        assert_eq!(c2.stats().entry_count, 100);
        for p in c2.affinity().primary_partitions(2) {
            assert_eq!(c2.partition_state(p), Some(PartitionState::Owning));
        }
    }

    #[tokio::test]
    async fn test_no_preload_leaves_new_owner_empty() {
        let grid = TestGrid::new();
        let config = cache_config().with_preload_mode(PreloadMode::None);
        let nodes = grid.start_nodes(1, config.clone()).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        for key in keys(20) {
            c1.put(key, "v").await.unwrap();
        }

        let joined = grid
            .start_node(NodeConfig::new(2).with_cache(config))
            .await
            .unwrap();
        let c2 = joined.cache(CACHE).unwrap();
        assert_eq!(c2.stats().entry_count, 0);
        assert_eq!(c2.metrics().preloaded.get(), 0);
    }

    #[tokio::test]
    async fn test_writes_after_join_carry_new_topology_version() {
        let grid = TestGrid::new();
        let nodes = grid.start_nodes(3, cache_config()).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        let before_key = key_with_primary(&c1, 1);
        c1.put(before_key.clone(), "v").await.unwrap();
        let before = c1.local_entry(before_key.as_bytes()).unwrap().version;
        assert_eq!(before.topology_version, 3);

        let joined = grid
            .start_node(NodeConfig::new(4).with_cache(cache_config()))
            .await
            .unwrap();
        let key = key_with_primary(&c1, 4);
        c1.put(key.clone(), "v").await.unwrap();

        let version = joined
            .cache(CACHE)
            .unwrap()
            .local_entry(key.as_bytes())
            .unwrap()
            .version;
        assert_eq!(version.topology_version, 4);
        assert_eq!(version.node_order, joined.local().order);
        assert!(version > before);
    }

    #[tokio::test]
    async fn test_join_waits_for_locks_of_older_topology() {
        let grid = Arc::new(TestGrid::new());
        let nodes = grid.start_nodes(2, tx_config()).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        let key = key_with_primary(&c1, 2);

        let tx = c1
            .tx_start(TxConcurrency::Pessimistic, TxIsolation::RepeatableRead)
            .await
            .unwrap();
        tx.put(key.clone(), "held").await.unwrap();

        let g = grid.clone();
        let join = tokio::spawn(async move {
            g.start_node(NodeConfig::new(3).with_cache(tx_config())).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!join.is_finished());

        tx.commit().await.unwrap();
        let joined = join.await.unwrap().unwrap();
        let c3 = joined.cache(CACHE).unwrap();
        assert_eq!(c3.get(key).await.unwrap(), Some(b("held")));
    }

    #[tokio::test]
    async fn test_operations_wait_for_exchange() {
        let grid = Arc::new(TestGrid::new());
        let nodes = grid.start_nodes(2, tx_config()).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        let c2 = nodes[1].cache(CACHE).unwrap();
        let key = key_with_primary(&c1, 1);

        let tx = c1.tx_start_default().await.unwrap();
        tx.put(key.clone(), "held").await.unwrap();

        let g = grid.clone();
        let join = tokio::spawn(async move {
            g.start_node(NodeConfig::new(3).with_cache(tx_config())).await
        });
        // Node 1 is blocked in the exchange until the transaction finishes.
        let blocked = wait_for(
            || !c1.context().gate.is_open(),
            Duration::from_secs(1),
            Duration::from_millis(5),
        )
        .await;
        assert!(blocked);

        let c = c1.clone();
        let read = tokio::spawn(async move { c.get("other").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!read.is_finished());

        tx.commit().await.unwrap();
        join.await.unwrap().unwrap();
        assert_eq!(read.await.unwrap().unwrap(), None);
        assert_eq!(c2.get(key).await.unwrap(), Some(b("held")));
    }

    #[tokio::test]
    async fn test_multi_update_holds_off_join() {
        let grid = Arc::new(TestGrid::new());
        let nodes = grid.start_nodes(2, cache_config()).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();

        let version = c1.begin_multi_update().await.unwrap();
        assert_eq!(version, 2);
        match c1.begin_multi_update().await.unwrap_err() {
            Error::MultiUpdateActive {
                topology_version, ..
            } => assert_eq!(topology_version, 2),
            other => panic!("unexpected error: {other}"),
        }
        c1.put("k", "v").await.unwrap();

        let g = grid.clone();
        let join = tokio::spawn(async move {
            g.start_node(NodeConfig::new(3).with_cache(cache_config())).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!join.is_finished());

        assert!(c1.end_multi_update());
        assert!(!c1.end_multi_update());
        join.await.unwrap().unwrap();
        assert_eq!(c1.affinity().ready_version(), 3);
        assert_eq!(c1.get("k").await.unwrap(), Some(b("v")));
    }

    #[tokio::test]
    async fn test_mismatched_config_rejected() {
        let grid = TestGrid::new();
        grid.start_nodes(1, cache_config()).await.unwrap();

        let err = grid
            .start_node(NodeConfig::new(2).with_cache(cache_config().with_backups(2)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::Mismatch {
                attribute: "backups",
                ..
            })
        ));

        let err = grid
            .start_node(
                NodeConfig::new(2).with_cache(cache_config().with_preload_mode(PreloadMode::Async)),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::Mismatch {
                attribute: "preload_mode",
                ..
            })
        ));
        assert_eq!(grid.discovery().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_node_rejected() {
        let grid = TestGrid::new();
        grid.start_nodes(1, cache_config()).await.unwrap();
        let err = grid
            .start_node(NodeConfig::new(1).with_cache(cache_config()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::DuplicateNode(1))));
    }

    #[tokio::test]
    async fn test_duplicate_cache_name_rejected() {
        let grid = TestGrid::new();
        let err = grid
            .start_node(
                NodeConfig::new(1)
                    .with_cache(cache_config())
                    .with_cache(cache_config()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::DuplicateCache(_))));
        assert!(grid.discovery().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_client_join_keeps_assignment() {
        let grid = TestGrid::new();
        let nodes = grid.start_nodes(2, cache_config()).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        let before = c1.affinity().latest().unwrap();

        let client = grid
            .start_node(
                NodeConfig::new(9)
                    .with_client(true)
                    .with_cache(cache_config().with_distribution_mode(DistributionMode::ClientOnly)),
            )
            .await
            .unwrap();
        let after = c1.affinity().latest().unwrap();
        assert_eq!(after.topology_version(), 3);
        assert_eq!(before.assignment(), after.assignment());

        let cache = client.cache(CACHE).unwrap();
        cache.put("k", "v").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b("v")));
        assert!(cache.local_entry(b"k").is_none());
        assert!(cache.near_peek(b"k").is_none());
    }

    // ==================== Affinity ====================

    #[tokio::test]
    async fn test_affinity_agrees_across_joins_and_leaves() {
        let kinds = [
            AffinityKind::Rendezvous,
            AffinityKind::Fair,
            AffinityKind::ConsistentHash { replicas: 64 },
        ];
        for kind in kinds {
            let grid = TestGrid::new();
            let config = cache_config()
                .with_affinity(AffinityConfig::default().with_kind(kind).with_partitions(64));
            grid.start_nodes(3, config.clone()).await.unwrap();
            let three = agreed_assignment(&grid);

            grid.start_node(NodeConfig::new(4).with_cache(config))
                .await
                .unwrap();
            let four = agreed_assignment(&grid);
            assert_eq!(four.topology_version(), 4);
            assert!(!four.primary_partitions(4).is_empty(), "{} gave node 4 nothing", kind.name());
            if !matches!(kind, AffinityKind::Fair) {
                for p in 0..64 {
                    let moved = three.primary(p) != four.primary(p);
                    assert!(!moved || four.primary(p) == Some(4), "{} moved {p} between old nodes", kind.name());
                }
            }

            grid.stop_node(2).await.unwrap();
            let after = agreed_assignment(&grid);
            assert_eq!(after.topology_version(), 5);
            for p in 0..64 {
                if four.primary(p) != Some(2) {
                    assert_eq!(after.primary(p), four.primary(p), "{} moved {p} on leave", kind.name());
                }
                assert!(!after.nodes(p).contains(&2));
            }
        }
    }

    // ==================== Lock Release ====================

    #[tokio::test]
    async fn test_release_futures_wait_for_older_locks() {
        let grid = TestGrid::new();
        let nodes = grid.start_nodes(2, tx_config()).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        let key = key_with_primary(&c1, 1);
        let partition = c1.affinity().partition(key.as_bytes());
        assert!(c1.lock(key.clone(), Duration::from_secs(1)).await.unwrap());

        let all = c1.partition_release_future(0..c1.affinity().partitions(), 100);
        let by_key = c1.key_release_future([key.clone()], 100);
        assert!(!all.is_done());
        assert!(!by_key.is_done());

        let elsewhere = (0..c1.affinity().partitions()).filter(|p| *p != partition);
        assert!(c1.partition_release_future(elsewhere, 100).is_done());
        assert!(c1.key_release_future(["unlocked"], 100).is_done());
        // The lock was taken on topology 2.
        assert!(c1.partition_release_future([partition], 2).is_done());

        c1.unlock(key).await.unwrap();
        all.wait_timeout(Duration::from_secs(1)).await.unwrap();
        by_key.wait_timeout(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_futures_fail_when_node_stops() {
        let grid = TestGrid::new();
        let nodes = grid.start_nodes(2, tx_config()).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        let key = key_with_primary(&c1, 1);
        assert!(c1.lock(key.clone(), Duration::from_secs(1)).await.unwrap());
        let all = c1.partition_release_future(0..c1.affinity().partitions(), 100);
        let by_key = c1.key_release_future([CacheKey::from(key)], 100);

        grid.stop_node(1).await.unwrap();

        assert!(matches!(all.wait().await.unwrap_err(), Error::NodeStopping(1)));
        assert!(matches!(by_key.wait().await.unwrap_err(), Error::NodeStopping(1)));
        assert!(matches!(
            c1.begin_multi_update().await.unwrap_err(),
            Error::NodeStopping(1)
        ));
    }

    // ==================== Leaves ====================

    #[tokio::test]
    async fn test_stopped_node_rejects_operations() {
        let grid = TestGrid::new();
        let nodes = grid.start_nodes(2, cache_config()).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        let c2 = nodes[1].cache(CACHE).unwrap();
        for key in keys(50) {
            c1.put(key, "v").await.unwrap();
        }

        grid.stop_node(2).await.unwrap();
        assert!(nodes[1].is_stopped());
        assert!(matches!(c2.get("key-1").await.unwrap_err(), Error::NodeStopping(2)));
        assert!(matches!(c2.put("key-1", "x").await.unwrap_err(), Error::NodeStopping(2)));
        assert!(matches!(c2.put_async("key-1", "x").await.unwrap_err(), Error::NodeStopping(2)));

        // The survivor held a backup of every key.
        for key in keys(50) {
            assert_eq!(c1.get(key).await.unwrap(), Some(b("v")));
        }
        assert!(c1.lost_partitions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_node_locks_are_salvaged() {
        let grid = TestGrid::new();
        let nodes = grid.start_nodes(3, tx_config()).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        let c3 = nodes[2].cache(CACHE).unwrap();
        let key = key_with_primary(&c1, 1);

        let tx = c3.tx_start_default().await.unwrap();
        tx.put(key.clone(), "orphan").await.unwrap();
        assert!(c3.lock("explicit", Duration::from_secs(1)).await.unwrap());
        assert!(c1.is_locked(key.clone()).await.unwrap());

        grid.fail_node(3).await.unwrap();

        assert!(!c1.is_locked(key.clone()).await.unwrap());
        assert!(!c1.is_locked("explicit").await.unwrap());
        for node in grid.nodes() {
            assert_eq!(node.cache(CACHE).unwrap().context().mvcc().lock_count(), 0);
        }
        assert_eq!(c1.get(key.clone()).await.unwrap(), None);

        let retry = c1.tx_start_default().await.unwrap();
        retry.put(key.clone(), "recovered").await.unwrap();
        retry.commit().await.unwrap();
        assert_eq!(c1.get(key).await.unwrap(), Some(b("recovered")));
        drop(tx);
    }

    #[tokio::test]
    async fn test_departed_reader_removed_from_entries() {
        let grid = TestGrid::new();
        let config = CacheConfig::new(CACHE).with_distribution_mode(DistributionMode::NearPartitioned);
        let nodes = grid.start_nodes(3, config).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        let c3 = nodes[2].cache(CACHE).unwrap();
        let key = key_with_primary(&c1, 1);
        let cache_key = CacheKey::from(key.clone());

        c1.put(key.clone(), "v").await.unwrap();
        assert_eq!(c3.get(key.clone()).await.unwrap(), Some(b("v")));
        let readers = |cache: &crate::cache::Cache| {
            cache
                .context()
                .entries()
                .with_existing(&cache_key, |e| e.readers().clone())
                .unwrap()
        };
        assert!(readers(&c1).contains(&3));

        grid.fail_node(3).await.unwrap();

        // Node 3 held no lock on the key.
        assert!(readers(&c1).is_empty());
        assert_eq!(c1.get(key).await.unwrap(), Some(b("v")));
    }

    #[tokio::test]
    async fn test_lost_partitions_reported() {
        let grid = TestGrid::new();
        let config = CacheConfig::new(CACHE);
        let nodes = grid.start_nodes(2, config).await.unwrap();
        let c1 = nodes[0].cache(CACHE).unwrap();
        let mut expected = c1.affinity().primary_partitions(2);
        expected.sort_unstable();
        assert!(!expected.is_empty());

        grid.fail_node(2).await.unwrap();

        let mut lost = c1.lost_partitions();
        lost.sort_unstable();
        assert_eq!(lost, expected);
        assert!(c1.affinity().primary_partitions(1).len() as u32 == c1.affinity().partitions());
    }
}
