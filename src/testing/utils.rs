use crate::cache::Cache;
use crate::types::NodeId;
use std::time::{Duration, Instant};

/// Install a subscriber honouring `RUST_LOG`; later calls are no-ops.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Retry `action` until `predicate` holds or `timeout` passes.
pub(crate) async fn wait_for_result<F, Fut, T, P>(
    mut action: F,
    predicate: P,
    timeout: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(20);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        tokio::time::sleep(interval).await;
    }
    None
}

/// Poll `condition` every `interval` until it holds or `timeout` passes.
pub(crate) async fn wait_for<F>(mut condition: F, timeout: Duration, interval: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    condition()
}

fn find_key(matches: impl Fn(&[u8]) -> bool) -> String {
    (0..100_000)
        .map(|i| format!("key-{i}"))
        .find(|k| matches(k.as_bytes()))
        .expect("no key matched within 100000 candidates")
}

/// A key whose primary is `node`.
pub(crate) fn key_with_primary(cache: &Cache, node: NodeId) -> String {
    find_key(|k| cache.affinity().map_key_to_node(k) == Some(node))
}

/// A key `node` backs up.
pub(crate) fn key_with_backup(cache: &Cache, node: NodeId) -> String {
    find_key(|k| cache.affinity().is_backup(node, k))
}

/// A key `node` neither primaries nor backs up.
pub(crate) fn key_not_owned_by(cache: &Cache, node: NodeId) -> String {
    find_key(|k| {
        !cache
            .affinity()
            .map_key_to_primary_and_backups(k)
            .contains(&node)
    })
}

/// Distinct keys whose primary is `node`.
pub(crate) fn keys_with_primary(cache: &Cache, node: NodeId, count: usize) -> Vec<String> {
    (0..100_000)
        .map(|i| format!("key-{i}"))
        .filter(|k| cache.affinity().map_key_to_node(k.as_bytes()) == Some(node))
        .take(count)
        .collect()
}
