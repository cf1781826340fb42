//! Monotonic counters.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a counter starting at zero.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    /// Metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Add one.
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Add `n`.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to zero.
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Counter partitioned by `N` label values.
///
/// The transport uses `LabeledCounter<2>` keyed by `[sender, message kind]`.
#[derive(Debug)]
pub struct LabeledCounter<const N: usize> {
    name: &'static str,
    help: &'static str,
    label_names: [&'static str; N],
    counters: RwLock<HashMap<[String; N], AtomicU64>>,
}

impl<const N: usize> LabeledCounter<N> {
    /// Create an empty labeled counter.
    pub fn new(name: &'static str, help: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            help,
            label_names,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Label names.
    pub fn label_names(&self) -> &[&'static str; N] {
        &self.label_names
    }

    /// Add one for `labels`.
    pub fn inc(&self, labels: [&str; N]) {
        self.inc_by(labels, 1);
    }

    /// Add `n` for `labels`.
    pub fn inc_by(&self, labels: [&str; N], n: u64) {
        let key = labels.map(str::to_string);
        if let Some(counter) = self.counters.read().get(&key) {
            counter.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Value for `labels`.
    pub fn get(&self, labels: [&str; N]) -> u64 {
        let key = labels.map(str::to_string);
        self.counters
            .read()
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum over every label set whose label at `index` equals `value`.
    pub fn sum_where(&self, index: usize, value: &str) -> u64 {
        self.counters
            .read()
            .iter()
            .filter(|(k, _)| k.get(index).is_some_and(|l| l == value))
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Sum over all label sets.
    pub fn total(&self) -> u64 {
        self.counters
            .read()
            .values()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// All label sets with their values.
    pub fn get_all(&self) -> Vec<([String; N], u64)> {
        self.counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    /// Forget every label set.
    pub fn reset(&self) {
        self.counters.write().clear();
    }
}
