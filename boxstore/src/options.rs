//! Store configuration
//!
//! [`StoreOptions`] carries the preloaded (persisted) state a store resolves
//! boxes from on first touch, and the [`CacheConfig`] of the selector cache.

use crate::entity::BoxInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

type PreloadFn = dyn Fn(&BoxInfo) -> Option<serde_json::Value> + Send + Sync;

/// Selector cache settings
///
/// By default every (selector, arguments) entry is kept for the lifetime of
/// the store. Selectors parametrized by high-cardinality arguments should set
/// `max_entries_per_selector`, which evicts least-recently-used entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Per-selector entry limit; unbounded when `None`
    #[serde(default)]
    pub max_entries_per_selector: Option<NonZeroUsize>,
}

impl CacheConfig {
    /// Keep at most `max` argument variants per selector
    pub fn bounded(max: NonZeroUsize) -> Self {
        CacheConfig {
            max_entries_per_selector: Some(max),
        }
    }
}

/// Options for building a store
#[derive(Clone, Default)]
pub struct StoreOptions {
    preloaded_state: Option<Arc<HashMap<String, serde_json::Value>>>,
    preloaded_with: Option<Arc<PreloadFn>>,
    /// Selector cache settings
    pub cache: CacheConfig,
}

impl StoreOptions {
    /// Options with no preloaded state and an unbounded cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Persisted state keyed by box key
    pub fn preloaded_state<I>(mut self, state: I) -> Self
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        self.preloaded_state = Some(Arc::new(state.into_iter().collect()));
        self
    }

    /// Resolve persisted state per box; takes precedence over `preloaded_state`
    pub fn preloaded_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&BoxInfo) -> Option<serde_json::Value> + Send + Sync + 'static,
    {
        self.preloaded_with = Some(Arc::new(f));
        self
    }

    /// Replace the selector cache settings
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Portable value preloaded for `info`, if any
    pub(crate) fn preloaded(&self, info: &BoxInfo) -> Option<serde_json::Value> {
        match (&self.preloaded_with, &self.preloaded_state) {
            (Some(getter), _) => getter(info),
            (None, Some(state)) => state.get(info.key()).cloned(),
            (None, None) => None,
        }
    }
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field(
                "preloaded_state",
                &self.preloaded_state.as_ref().map(|state| state.len()),
            )
            .field("preloaded_with", &self.preloaded_with.is_some())
            .field("cache", &self.cache)
            .finish()
    }
}
