//! Per-cache metrics.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         CacheMetrics                          │
//! │  ┌────────────────┐  ┌─────────────────┐  ┌────────────────┐  │
//! │  │   Counters     │  │     Gauges      │  │   Histograms   │  │
//! │  │ - gets/hits    │  │ - async ops     │  │ - get latency  │  │
//! │  │ - near hits    │  │   in flight     │  │ - put latency  │  │
//! │  │ - tx outcomes  │  │   (with peak)   │  │ - commit time  │  │
//! │  │ - evictions    │  │                 │  │                │  │
//! │  └────────────────┘  └─────────────────┘  └────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Message counts per sender and kind live on the transport, see
//! [`crate::network::LocalTransport::messages`].

mod counters;
mod gauges;
mod histograms;

pub use counters::{Counter, LabeledCounter};
pub use gauges::{Gauge, GaugeGuard};
pub use histograms::{Histogram, HistogramSnapshot, HistogramTimer, CACHE_LATENCY_BUCKETS};

use std::time::Duration;

/// Metrics of one cache on one node.
#[derive(Debug)]
pub struct CacheMetrics {
    /// Reads served.
    pub gets: Counter,
    /// Reads that found a value.
    pub get_hits: Counter,
    /// Reads that found nothing.
    pub get_misses: Counter,
    /// Reads answered by the near cache.
    pub near_hits: Counter,
    /// Near cache lookups that fell through to the primary.
    pub near_misses: Counter,
    /// Writes applied.
    pub puts: Counter,
    /// Removes applied.
    pub removes: Counter,
    /// Transactions committed.
    pub tx_commits: Counter,
    /// Transactions rolled back.
    pub tx_rollbacks: Counter,
    /// Lock requests that had to queue.
    pub lock_waits: Counter,
    /// Lock requests that timed out.
    pub lock_timeouts: Counter,
    /// Invalidations sent to near readers.
    pub invalidations_sent: Counter,
    /// Entries evicted from memory.
    pub evictions: Counter,
    /// Entries moved to swap.
    pub swapped_out: Counter,
    /// Entries read back from swap.
    pub unswapped: Counter,
    /// Entries received through preloading.
    pub preloaded: Counter,
    /// Async operations currently running.
    pub async_in_flight: Gauge,
    /// Read latency.
    pub get_latency: Histogram,
    /// Write latency.
    pub put_latency: Histogram,
    /// Transaction commit latency.
    pub commit_latency: Histogram,
}

impl CacheMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self {
            gets: Counter::new("cache_gets_total", "Reads served"),
            get_hits: Counter::new("cache_get_hits_total", "Reads that found a value"),
            get_misses: Counter::new("cache_get_misses_total", "Reads that found nothing"),
            near_hits: Counter::new("cache_near_hits_total", "Reads answered by the near cache"),
            near_misses: Counter::new("cache_near_misses_total", "Near cache misses"),
            puts: Counter::new("cache_puts_total", "Writes applied"),
            removes: Counter::new("cache_removes_total", "Removes applied"),
            tx_commits: Counter::new("cache_tx_commits_total", "Transactions committed"),
            tx_rollbacks: Counter::new("cache_tx_rollbacks_total", "Transactions rolled back"),
            lock_waits: Counter::new("cache_lock_waits_total", "Lock requests that queued"),
            lock_timeouts: Counter::new("cache_lock_timeouts_total", "Lock requests that timed out"),
            invalidations_sent: Counter::new(
                "cache_invalidations_sent_total",
                "Invalidations sent to near readers",
            ),
            evictions: Counter::new("cache_evictions_total", "Entries evicted from memory"),
            swapped_out: Counter::new("cache_swapped_out_total", "Entries moved to swap"),
            unswapped: Counter::new("cache_unswapped_total", "Entries read back from swap"),
            preloaded: Counter::new("cache_preloaded_total", "Entries received by preloading"),
            async_in_flight: Gauge::new("cache_async_in_flight", "Async operations running"),
            get_latency: Histogram::new("cache_get_latency_seconds", "Read latency"),
            put_latency: Histogram::new("cache_put_latency_seconds", "Write latency"),
            commit_latency: Histogram::new("cache_commit_latency_seconds", "Commit latency"),
        }
    }

    /// Record a read.
    pub fn record_get(&self, hit: bool, latency: Duration) {
        self.gets.inc();
        if hit {
            self.get_hits.inc();
        } else {
            self.get_misses.inc();
        }
        self.get_latency.observe_duration(latency);
    }

    /// Record a near cache lookup.
    pub fn record_near(&self, hit: bool) {
        if hit {
            self.near_hits.inc();
        } else {
            self.near_misses.inc();
        }
    }

    /// Record a write.
    pub fn record_put(&self, latency: Duration) {
        self.puts.inc();
        self.put_latency.observe_duration(latency);
    }

    /// Record a transaction outcome.
    pub fn record_tx(&self, committed: bool, latency: Duration) {
        if committed {
            self.tx_commits.inc();
            self.commit_latency.observe_duration(latency);
        } else {
            self.tx_rollbacks.inc();
        }
    }

    /// Copy of the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            gets: self.gets.get(),
            get_hits: self.get_hits.get(),
            get_misses: self.get_misses.get(),
            near_hits: self.near_hits.get(),
            puts: self.puts.get(),
            removes: self.removes.get(),
            tx_commits: self.tx_commits.get(),
            tx_rollbacks: self.tx_rollbacks.get(),
            lock_timeouts: self.lock_timeouts.get(),
            evictions: self.evictions.get(),
            async_peak: self.async_in_flight.peak(),
            get_latency: self.get_latency.snapshot(),
        }
    }

    /// Render in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        for counter in [
            &self.gets,
            &self.get_hits,
            &self.get_misses,
            &self.near_hits,
            &self.near_misses,
            &self.puts,
            &self.removes,
            &self.tx_commits,
            &self.tx_rollbacks,
            &self.lock_waits,
            &self.lock_timeouts,
            &self.invalidations_sent,
            &self.evictions,
            &self.swapped_out,
            &self.unswapped,
            &self.preloaded,
        ] {
            out.push_str(&format!(
                "# HELP {0} {1}\n# TYPE {0} counter\n{0} {2}\n",
                counter.name(),
                counter.help(),
                counter.get()
            ));
        }
        out.push_str(&format!(
            "# HELP {0} {1}\n# TYPE {0} gauge\n{0} {2}\n",
            self.async_in_flight.name(),
            self.async_in_flight.help(),
            self.async_in_flight.get()
        ));
        for hist in [&self.get_latency, &self.put_latency, &self.commit_latency] {
            out.push_str(&format!(
                "# HELP {0} {1}\n# TYPE {0} histogram\n{0}_sum {2}\n{0}_count {3}\n",
                hist.name(),
                hist.help(),
                hist.sum(),
                hist.count()
            ));
        }
        out
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy of the most used cache metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub gets: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub near_hits: u64,
    pub puts: u64,
    pub removes: u64,
    pub tx_commits: u64,
    pub tx_rollbacks: u64,
    pub lock_timeouts: u64,
    pub evictions: u64,
    pub async_peak: i64,
    pub get_latency: HistogramSnapshot,
}

impl MetricsSnapshot {
    /// Fraction of reads that found a value.
    pub fn hit_rate(&self) -> f64 {
        if self.gets == 0 {
            0.0
        } else {
            self.get_hits as f64 / self.gets as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = CacheMetrics::new();
        metrics.record_get(true, Duration::from_micros(10));
        metrics.record_get(true, Duration::from_micros(20));
        metrics.record_get(false, Duration::from_micros(5));
        metrics.record_put(Duration::from_micros(30));
        metrics.record_tx(true, Duration::from_millis(1));
        metrics.record_tx(false, Duration::ZERO);

        let snap = metrics.snapshot();
        assert_eq!(snap.gets, 3);
        assert_eq!(snap.get_misses, 1);
        assert_eq!(snap.puts, 1);
        assert_eq!(snap.tx_commits, 1);
        assert_eq!(snap.tx_rollbacks, 1);
        assert!((snap.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snap.get_latency.count, 3);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = CacheMetrics::new();
        metrics.record_near(true);
        let out = metrics.to_prometheus();
        assert!(out.contains("# TYPE cache_near_hits_total counter\ncache_near_hits_total 1\n"));
        assert!(out.contains("cache_async_in_flight 0"));
        assert!(out.contains("cache_commit_latency_seconds_count 0"));
    }
}
