//! Selector cache metrics
//!
//! Counters for tracking how effective memoization is for a store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Live counters owned by the cache enhancer
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Selects answered from the cache
    pub hit_count: AtomicU64,

    /// Selects with no cache entry for their arguments
    pub miss_count: AtomicU64,

    /// Selects whose entry was stale because a dependency changed
    pub stale_count: AtomicU64,

    /// Entries dropped to respect the per-selector bound
    pub eviction_count: AtomicU64,

    /// Number of times a compute function ran
    pub execution_count: AtomicU64,

    /// Total time spent in compute functions (nanoseconds)
    pub total_compute_time_ns: AtomicU64,
}

impl CacheMetrics {
    /// All counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a select answered from the cache
    pub fn record_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a select with no entry
    pub fn record_miss(&self) {
        self.miss_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a select whose entry was outdated
    pub fn record_stale(&self) {
        self.stale_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an entry dropped by the bound
    pub fn record_eviction(&self) {
        self.eviction_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one compute function run
    pub fn record_execution(&self, duration: Duration) {
        self.execution_count.fetch_add(1, Ordering::Relaxed);
        self.total_compute_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hit_count.load(Ordering::Relaxed),
            misses: self.miss_count.load(Ordering::Relaxed),
            stale: self.stale_count.load(Ordering::Relaxed),
            evictions: self.eviction_count.load(Ordering::Relaxed),
            executions: self.execution_count.load(Ordering::Relaxed),
            total_time_ns: self.total_compute_time_ns.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`CacheMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    /// Selects answered from the cache
    pub hits: u64,
    /// Selects with no entry
    pub misses: u64,
    /// Selects with an outdated entry
    pub stale: u64,
    /// Entries dropped by the bound
    pub evictions: u64,
    /// Compute function runs
    pub executions: u64,
    /// Total compute time (nanoseconds)
    pub total_time_ns: u64,
}

impl CacheMetricsSnapshot {
    /// Get cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.stale;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Get average compute time
    pub fn avg_execution_time(&self) -> Duration {
        if self.executions == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.total_time_ns / self.executions)
        }
    }
}

impl std::fmt::Display for CacheMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Hits: {} | Misses: {} | Stale: {} | Hit Rate: {:.1}%",
            self.hits,
            self.misses,
            self.stale,
            self.hit_rate() * 100.0
        )?;
        write!(
            f,
            "Executions: {} | Evictions: {}",
            self.executions, self.evictions
        )
    }
}
