//! Store construction and the base dispatch/select engine
//!
//! The base engine routes each task to its handler, applies mutations to the
//! snapshot, computes selectors without memoization and broadcasts after every
//! dispatch. Batching, atomicity and caching are layered on top by the
//! built-in enhancers.
//!
//! Every outermost call on a [`Store`] holds the store's writer lock for its
//! whole duration, so another thread never observes a transaction in flight.
//! The lock is re-entrant: subscribers and nested calls on the same thread
//! proceed without blocking.

use crate::enhancer::{Enhancer, Next};
use crate::enhancers::{CacheEnhancer, RollbackEnhancer, TransactionEnhancer};
use crate::entity::{BoxInfo, StateBox, Value};
use crate::error::{Result, StoreError};
use crate::event::{Event, Reader, Scope};
use crate::metrics::CacheMetricsSnapshot;
use crate::options::{CacheConfig, StoreOptions};
use crate::selector::{downcast_selected, Selectable, Selection};
use crate::snapshot::{Snapshot, SnapshotState};
use crate::task::{ActionTask, Dispatchable, Output, Task};
use parking_lot::{ReentrantMutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Callback notified after every externally visible update
pub type Listener = Arc<dyn Fn() + Send + Sync>;

type ListenerList = RwLock<Vec<(u64, Listener)>>;

/// Names reserved by the built-in enhancers
const BUILTIN_ENHANCERS: [&str; 3] = ["rollback", "transaction", "cache"];

/// Handle returned by `subscribe`; call [`Unsubscribe::unsubscribe`] to detach
#[derive(Debug)]
pub struct Unsubscribe {
    listeners: Weak<ListenerList>,
    id: u64,
}

impl Unsubscribe {
    /// Remove the listener; false if it was already removed
    pub fn unsubscribe(self) -> bool {
        let Some(listeners) = self.listeners.upgrade() else {
            return false;
        };
        let mut listeners = listeners.write();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != self.id);
        listeners.len() != before
    }
}

/// Innermost layer of the chain
pub(crate) struct BaseEngine {
    snapshot: SnapshotState,
    options: StoreOptions,
    listeners: Arc<ListenerList>,
    next_listener: AtomicU64,
}

impl BaseEngine {
    fn new(options: StoreOptions) -> Self {
        BaseEngine {
            snapshot: SnapshotState::new(),
            options,
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_listener: AtomicU64::new(1),
        }
    }

    pub(crate) fn dispatch(&self, event: &Event<'_>, task: Task) -> Result<Output> {
        event.push_dispatching(task.kind());
        let result = self.apply(event, task);
        event.pop_dispatching();
        let output = result?;
        event.store().broadcast_in(event);
        Ok(output)
    }

    fn apply(&self, event: &Event<'_>, task: Task) -> Result<Output> {
        trace!(kind = %task.kind(), task = %task.label(), "dispatch");
        match task {
            Task::Action(action) => action.run(&Scope::new(event)),
            Task::Mutation(mutation) => {
                let info = mutation.target_info().clone();
                let current = self.snapshot.materialize(&info, &self.options)?;
                let next = mutation.apply(&current)?;
                self.snapshot.write(&info, next.clone());
                Ok(Box::new(next))
            }
            Task::Signal(signal) => {
                let scope = Scope::new(event);
                for listener in signal.listeners() {
                    let current = self.snapshot.materialize(&listener.target, &self.options)?;
                    (listener.notify)(&scope, &current, signal.payload())?;
                }
                Ok(signal.into_payload())
            }
        }
    }

    pub(crate) fn select(&self, event: &Event<'_>, selection: &Selection) -> Result<Value> {
        match selection {
            Selection::Box(info) => self.snapshot.materialize(info, &self.options),
            Selection::Computed(request) => request.compute(&Reader::new(event)),
        }
    }

    pub(crate) fn subscribe(&self, listener: Listener) -> Unsubscribe {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        Unsubscribe {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    pub(crate) fn broadcast(&self) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener();
        }
    }
}

struct StoreInner {
    writer: ReentrantMutex<()>,
    base: BaseEngine,
    layers: Vec<Arc<dyn Enhancer>>,
    cache: Arc<CacheEnhancer>,
}

/// Single-writer typed state container
///
/// Cloning a store yields another handle to the same state. Handles may be
/// shared across threads; outermost calls are serialized by a writer lock.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// A store with default options and only the built-in enhancers
    pub fn new() -> Self {
        Self::assemble(StoreOptions::default(), Vec::new())
    }

    /// Start configuring a store
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    fn assemble(options: StoreOptions, enhancers: Vec<Arc<dyn Enhancer>>) -> Self {
        let cache = Arc::new(CacheEnhancer::new(options.cache.clone()));
        let mut layers: Vec<Arc<dyn Enhancer>> = vec![
            Arc::new(RollbackEnhancer),
            Arc::new(TransactionEnhancer),
            cache.clone(),
        ];
        layers.extend(enhancers);
        Store {
            inner: Arc::new(StoreInner {
                writer: ReentrantMutex::new(()),
                base: BaseEngine::new(options),
                layers,
                cache,
            }),
        }
    }

    fn chain(&self) -> Next<'_> {
        Next::new(&self.inner.layers, &self.inner.base)
    }

    /// Dispatch a task as one outermost call
    pub fn dispatch<D: Dispatchable>(&self, task: D) -> Result<D::Output> {
        let _writer = self.inner.writer.lock();
        let event = Event::root(self);
        let output = self.dispatch_in(&event, task.into_task())?;
        D::extract(output)
    }

    /// Dispatch several tasks as one outermost call
    ///
    /// All tasks share a single transaction: subscribers are notified once,
    /// and a failure in any task rolls back the ones before it.
    pub fn dispatch_all<I>(&self, tasks: I) -> Result<Vec<Output>>
    where
        I: IntoIterator<Item = Task>,
    {
        let tasks: Vec<Task> = tasks.into_iter().collect();
        let batch = ActionTask::from_fn(move |scope| {
            tasks
                .into_iter()
                .map(|task| scope.dispatch(task))
                .collect::<Result<Vec<Output>>>()
        });
        self.dispatch(batch.with_type("batch"))
    }

    /// Select a box or a selector call
    pub fn select<S: Selectable>(&self, selectable: &S) -> Result<Arc<S::Output>> {
        let _writer = self.inner.writer.lock();
        let event = Event::root(self);
        let selection = selectable.selection();
        let value = self.select_in(&event, &selection)?;
        downcast_selected(&selection, value)
    }

    /// Register a listener called after every visible update
    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.chain().subscribe(Arc::new(listener))
    }

    /// Notify subscribers without dispatching
    pub fn broadcast(&self) {
        let _writer = self.inner.writer.lock();
        let event = Event::root(self);
        self.broadcast_in(&event);
    }

    /// Read-only copy of the current state
    pub fn snapshot(&self) -> Snapshot {
        let _writer = self.inner.writer.lock();
        self.inner.base.snapshot.view()
    }

    /// Persisted-state layout: box key → portable form
    pub fn portable_state(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let _writer = self.inner.writer.lock();
        self.inner.base.snapshot.portable()
    }

    /// Selector cache counters
    pub fn cache_metrics(&self) -> CacheMetricsSnapshot {
        self.inner.cache.metrics()
    }

    /// Drop every memoized selector result
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Enhancer names, outermost first
    pub fn enhancers(&self) -> Vec<&'static str> {
        self.chain().names()
    }

    pub(crate) fn dispatch_in(&self, event: &Event<'_>, task: Task) -> Result<Output> {
        self.chain().dispatch(event, task)
    }

    pub(crate) fn select_in(&self, event: &Event<'_>, selection: &Selection) -> Result<Value> {
        self.chain().select(event, selection)
    }

    pub(crate) fn broadcast_in(&self, event: &Event<'_>) {
        self.chain().broadcast(event)
    }

    pub(crate) fn peek(&self, info: &BoxInfo) -> Option<Value> {
        self.inner.base.snapshot.peek(info)
    }

    pub(crate) fn restore(&self, info: &Arc<BoxInfo>, value: Option<Value>) {
        self.inner.base.snapshot.restore(info, value)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("enhancers", &self.enhancers())
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Collects options, boxes and enhancers, then validates them
#[derive(Default)]
pub struct StoreBuilder {
    options: StoreOptions,
    boxes: Vec<Arc<BoxInfo>>,
    enhancers: Vec<Arc<dyn Enhancer>>,
}

impl StoreBuilder {
    /// Replace all options at once
    pub fn options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Portable values to materialize boxes from
    pub fn preloaded_state<I>(mut self, state: I) -> Self
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        self.options = self.options.preloaded_state(state);
        self
    }

    /// Look up preloaded values through a callback; wins over the map
    pub fn preloaded_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&BoxInfo) -> Option<serde_json::Value> + Send + Sync + 'static,
    {
        self.options = self.options.preloaded_with(f);
        self
    }

    /// Selector cache limits
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.options = self.options.cache(cache);
        self
    }

    /// Claim a box key up front so collisions fail at build time
    pub fn register<T: Send + Sync + 'static>(mut self, state_box: &StateBox<T>) -> Self {
        self.boxes.push(state_box.info.clone());
        self
    }

    /// Append an application enhancer, inside the built-in ones
    pub fn enhancer<E: Enhancer + 'static>(mut self, enhancer: E) -> Self {
        self.enhancers.push(Arc::new(enhancer));
        self
    }

    /// Validate the enhancer chain, claim registered keys and build the store
    pub fn build(self) -> Result<Store> {
        validate_chain(&self.enhancers)?;
        let store = Store::assemble(self.options, self.enhancers);
        for info in &self.boxes {
            store.inner.base.snapshot.claim(info)?;
        }
        debug!(
            enhancers = ?store.enhancers(),
            boxes = self.boxes.len(),
            "store built"
        );
        Ok(store)
    }
}

impl fmt::Debug for StoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("options", &self.options)
            .field("boxes", &self.boxes)
            .field(
                "enhancers",
                &self.enhancers.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn validate_chain(enhancers: &[Arc<dyn Enhancer>]) -> Result<()> {
    let mut seen = HashSet::new();
    for enhancer in enhancers {
        let name = enhancer.name();
        if BUILTIN_ENHANCERS.contains(&name) {
            return Err(StoreError::MalformedChain(format!(
                "`{name}` is a built-in enhancer and is always installed"
            )));
        }
        if !seen.insert(name) {
            return Err(StoreError::MalformedChain(format!(
                "enhancer `{name}` is listed more than once"
            )));
        }
    }
    Ok(())
}

/// Build a store from options and application enhancers
///
/// The built-in rollback, transaction and cache enhancers are always
/// prepended, in that order.
pub fn create_store(options: StoreOptions, enhancers: Vec<Arc<dyn Enhancer>>) -> Result<Store> {
    validate_chain(&enhancers)?;
    Ok(Store::assemble(options, enhancers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Selector;
    use crate::task::Action;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Named(&'static str);

    impl Enhancer for Named {
        fn name(&self) -> &'static str {
            self.0
        }
    }

    #[test]
    fn test_default_chain_order() {
        let store = Store::new();
        assert_eq!(store.enhancers(), vec!["rollback", "transaction", "cache"]);

        let store = Store::builder()
            .enhancer(Named("logger"))
            .enhancer(Named("devtools"))
            .build()
            .unwrap();
        assert_eq!(
            store.enhancers(),
            vec!["rollback", "transaction", "cache", "logger", "devtools"]
        );
    }

    #[test]
    fn test_malformed_chain_rejected() {
        let err = Store::builder()
            .enhancer(Named("logger"))
            .enhancer(Named("logger"))
            .build()
            .unwrap_err();
        assert!(matches!(err, StoreError::MalformedChain(_)));

        let enhancers: Vec<Arc<dyn Enhancer>> = vec![Arc::new(Named("cache"))];
        let err = create_store(StoreOptions::new(), enhancers).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_duplicate_keys_rejected_at_build() {
        let a = StateBox::new("user", 1u32);
        let b = StateBox::new("user", 2u32);
        let err = Store::builder().register(&a).register(&b).build().unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { ref key } if key == "user"));

        // Registering the same box twice is fine.
        assert!(Store::builder().register(&a).register(&a.clone()).build().is_ok());
    }

    #[test]
    fn test_registered_key_blocks_impostor() {
        let real = StateBox::new("session", 0u8);
        let impostor = StateBox::new("session", 0u8);
        let store = Store::builder().register(&real).build().unwrap();

        let err = store.select(&impostor).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert!(!store.snapshot().contains_key("session"));
    }

    #[test]
    fn test_base_dispatch_kinds() {
        let store = Store::new();
        let counter = StateBox::new("counter", 0i64);
        let increment = counter.mutator("increment", |state, by: i64| state + by);

        let next = store.dispatch(increment.call(5)).unwrap();
        assert_eq!(*next, 5);

        let read = counter.clone();
        let add = Action::new(move |scope, base: i64| {
            let current = scope.select(&read)?;
            Ok(*current + base)
        });
        assert_eq!(store.dispatch(add.call(37)).unwrap(), 42);
    }

    #[test]
    fn test_select_materializes_lazily() {
        let store = Store::new();
        let count = StateBox::new("count", 0i64);
        let double = Selector::new({
            let count = count.clone();
            move |reader, _: &()| Ok(*reader.select(&count)? * 2)
        });

        assert!(store.snapshot().is_empty());
        assert_eq!(*store.select(&double).unwrap(), 0);
        assert_eq!(store.snapshot().keys(), vec!["count"]);
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let store = Store::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handle = store.subscribe(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        store.broadcast();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(handle.unsubscribe());
        store.broadcast();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_all_returns_every_output() {
        let store = Store::new();
        let counter = StateBox::new("counter", 0i64);
        let increment = counter.mutator("increment", |state, by: i64| state + by);

        let outputs = store
            .dispatch_all([increment.call(1).into_task(), increment.call(2).into_task()])
            .unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(*store.select(&counter).unwrap(), 3);
    }

    #[test]
    fn test_portable_state() {
        let store = Store::builder()
            .preloaded_state([("count".to_string(), json!(4))])
            .build()
            .unwrap();
        let count = StateBox::new("count", 0i64);
        assert_eq!(*store.select(&count).unwrap(), 4);
        assert_eq!(store.portable_state().unwrap()["count"], json!(4));
    }
}
