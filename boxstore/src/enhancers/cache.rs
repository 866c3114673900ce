//! Selector memoization
//!
//! Results are keyed by (selector identity, argument value). Each entry
//! remembers every box value read while it was computed, directly or through
//! nested selectors. A repeated select is answered from the entry when every
//! recorded box still holds the very same value (pointer equality); otherwise
//! the selector runs again and the entry is replaced.
//!
//! Box reads are attributed to the innermost selector being computed, and a
//! nested selector's dependencies are merged into its caller, so an outer
//! entry is invalidated by changes to boxes it only reads indirectly.

use crate::enhancer::{Enhancer, Next};
use crate::entity::Value;
use crate::error::Result;
use crate::event::{Dependency, Event};
use crate::metrics::{CacheMetrics, CacheMetricsSnapshot};
use crate::options::CacheConfig;
use crate::selector::{ArgsKey, ComputeRequest, Selection, SelectorId};
use crate::snapshot::same_value;
use dashmap::DashMap;
use lru::LruCache;
use std::fmt;
use std::time::Instant;
use tracing::trace;

/// Memoized result of one (selector, arguments) pair
#[derive(Clone)]
struct CacheEntry {
    value: Value,
    dependencies: Vec<Dependency>,
}

impl CacheEntry {
    fn is_fresh(&self, event: &Event<'_>) -> bool {
        let store = event.store();
        self.dependencies.iter().all(|dependency| {
            store
                .peek(&dependency.info)
                .is_some_and(|current| same_value(&current, &dependency.value))
        })
    }
}

enum Lookup {
    Hit(CacheEntry),
    Stale,
    Miss,
}

/// Memoizes computed selections per (selector, arguments)
pub struct CacheEnhancer {
    config: CacheConfig,
    entries: DashMap<SelectorId, LruCache<ArgsKey, CacheEntry>>,
    metrics: CacheMetrics,
}

impl CacheEnhancer {
    /// Empty cache with the given limits
    pub fn new(config: CacheConfig) -> Self {
        CacheEnhancer {
            config,
            entries: DashMap::new(),
            metrics: CacheMetrics::new(),
        }
    }

    /// Current hit/miss counters
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Number of memoized (selector, arguments) pairs
    pub fn len(&self) -> usize {
        self.entries.iter().map(|table| table.len()).sum()
    }

    /// True when nothing is memoized
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every memoized result
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn table(&self) -> LruCache<ArgsKey, CacheEntry> {
        match self.config.max_entries_per_selector {
            Some(max) => LruCache::new(max),
            None => LruCache::unbounded(),
        }
    }

    fn lookup(&self, event: &Event<'_>, request: &ComputeRequest) -> Lookup {
        // Clone out of the table so the shard lock is not held while
        // dependencies are checked.
        let entry = match self.entries.get_mut(&request.selector()) {
            Some(mut table) => table.get(request.args()).cloned(),
            None => None,
        };
        match entry {
            Some(entry) if entry.is_fresh(event) => Lookup::Hit(entry),
            Some(_) => Lookup::Stale,
            None => Lookup::Miss,
        }
    }

    fn store(&self, request: &ComputeRequest, entry: CacheEntry) {
        let args = request.args().clone();
        let mut table = self
            .entries
            .entry(request.selector())
            .or_insert_with(|| self.table());
        if let Some((evicted, _)) = table.push(args.clone(), entry) {
            if evicted != args {
                trace!(selector = %request.selector(), "cache entry evicted");
                self.metrics.record_eviction();
            }
        }
    }

    fn compute(
        &self,
        event: &Event<'_>,
        selection: &Selection,
        request: &ComputeRequest,
        next: Next<'_>,
    ) -> Result<Value> {
        event.push_selecting(selection.label());
        let started = Instant::now();
        let result = next.select(event, selection);
        let dependencies = event.pop_selecting();
        let value = result?;
        self.metrics.record_execution(started.elapsed());

        event.record_dependencies(&dependencies);
        self.store(
            request,
            CacheEntry {
                value: value.clone(),
                dependencies,
            },
        );
        Ok(value)
    }
}

impl Enhancer for CacheEnhancer {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn select(&self, event: &Event<'_>, selection: &Selection, next: Next<'_>) -> Result<Value> {
        let request = match selection {
            Selection::Box(info) => {
                let value = next.select(event, selection)?;
                event.record_dependencies([&Dependency {
                    info: info.clone(),
                    value: value.clone(),
                }]);
                return Ok(value);
            }
            Selection::Computed(request) => request,
        };

        match self.lookup(event, request) {
            Lookup::Hit(entry) => {
                trace!(selector = %selection.label(), "cache hit");
                self.metrics.record_hit();
                event.record_dependencies(&entry.dependencies);
                Ok(entry.value)
            }
            Lookup::Stale => {
                trace!(selector = %selection.label(), "cache stale");
                self.metrics.record_stale();
                self.compute(event, selection, request, next)
            }
            Lookup::Miss => {
                trace!(selector = %selection.label(), "cache miss");
                self.metrics.record_miss();
                self.compute(event, selection, request, next)
            }
        }
    }
}

impl fmt::Debug for CacheEnhancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEnhancer")
            .field("config", &self.config)
            .field("entries", &self.len())
            .field("metrics", &self.metrics())
            .finish()
    }
}
