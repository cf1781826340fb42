//! Basic example of a three-node grid in one process.

use gridcache::types::{AtomicityMode, TxConcurrency, TxIsolation, WriteOrderMode};
use gridcache::{CacheConfig, NodeConfig, TestGrid};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("gridcache=debug,info")
        .init();

    let grid = TestGrid::new();

    let config = CacheConfig::new("accounts")
        .with_atomicity_mode(AtomicityMode::Transactional)
        .with_backups(1)
        .with_tx_timeout(Duration::from_secs(5));

    println!("Starting three grid nodes...");
    let nodes = grid.start_nodes(3, config).await?;
    grid.preload_future().wait().await?;

    let cache = nodes[0].cache("accounts")?;
    println!("Partitions: {}", cache.affinity().partitions());

    // Transfer between two accounts in one pessimistic transaction
    println!("\n--- Transaction ---");
    cache.put("alice", "100").await?;
    cache.put("bob", "50").await?;

    let tx = cache
        .tx_start(TxConcurrency::Pessimistic, TxIsolation::RepeatableRead)
        .await?;
    tx.put("alice", "70").await?;
    tx.put("bob", "80").await?;
    tx.commit().await?;
    println!("Transaction {} is {:?}", tx.xid(), tx.state());

    let other = nodes[2].cache("accounts")?;
    for key in ["alice", "bob"] {
        if let Some(value) = other.get(key).await? {
            println!("{key} = {}", String::from_utf8_lossy(&value));
        }
    }

    // Typed access through the bincode marshaller
    println!("\n--- Typed cache ---");
    let typed = nodes[1].typed_cache::<String, u64>("accounts")?;
    typed.put(&"carol".to_string(), &42).await?;
    println!("carol = {:?}", typed.get(&"carol".to_string()).await?);

    // An atomic cache ordered by the origin clock
    println!("\n--- Atomic cache ---");
    let events = CacheConfig::new("events")
        .with_atomicity_mode(AtomicityMode::Atomic)
        .with_write_order_mode(WriteOrderMode::Clock)
        .with_backups(1);
    let extra = grid.start_node(NodeConfig::new(4).with_cache(events)).await;
    match extra {
        Ok(node) => println!("Node {} joined with caches {:?}", node.id(), node.cache_names()),
        Err(e) => println!("Node 4 rejected: {e}"),
    }

    // Stop one node; its partitions move to the survivors
    println!("\n--- Node stop ---");
    grid.stop_node(nodes[1].id()).await?;
    grid.preload_future().wait().await?;
    println!("alice after stop = {:?}", other.get("alice").await?);

    let stats = other.stats();
    println!("\nCache stats on node {}:", nodes[2].id());
    println!("  Entry count: {}", stats.entry_count);
    println!("  Hits: {}", stats.hits);
    println!("  Misses: {}", stats.misses);

    println!("\nShutting down...");
    grid.shutdown().await;

    Ok(())
}
