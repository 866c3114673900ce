//! Integration tests for the store engine and its enhancer chain

use boxstore::prelude::*;
use boxstore::{Enhancer, Event, Next, Output, Selection, Task, TaskKind, Value};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn broadcasts(store: &Store) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    store.subscribe(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    calls
}

/// Records every call that reaches it
#[derive(Default)]
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl Enhancer for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn dispatch(&self, event: &Event<'_>, task: Task, next: Next<'_>) -> boxstore::Result<Output> {
        let depth = event.transaction().map(|tx| tx.depth).unwrap_or(0);
        self.log
            .lock()
            .push(format!("dispatch {} {} @{}", task.kind(), task.label(), depth));
        next.dispatch(event, task)
    }

    fn select(
        &self,
        event: &Event<'_>,
        selection: &Selection,
        next: Next<'_>,
    ) -> boxstore::Result<Value> {
        self.log.lock().push(format!("select {}", selection.label()));
        next.select(event, selection)
    }

    fn broadcast(&self, event: &Event<'_>, next: Next<'_>) {
        self.log.lock().push("broadcast".to_string());
        next.broadcast(event)
    }
}

#[test]
fn test_one_broadcast_per_outer_action() {
    let store = Store::new();
    let calls = broadcasts(&store);
    let counter = StateBox::new("counter", 0i64);
    let increment = counter.mutator("increment", |n, by: i64| n + by);

    let bump = Action::new(move |scope: &Scope<'_>, times: usize| {
        for _ in 0..times {
            scope.dispatch(increment.call(1))?;
        }
        Ok(())
    });
    store.dispatch(bump.call(3)).unwrap();
    store.dispatch(bump.call(2)).unwrap();

    assert_eq!(*store.select(&counter).unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_error_restores_snapshot_and_skips_broadcast() {
    init_tracing();
    let store = Store::new();
    let calls = broadcasts(&store);
    let a = StateBox::new("a", 1u32);
    let b = StateBox::new("b", 2u32);
    store.dispatch(a.set(10)).unwrap();
    let before = store.snapshot();

    let failing = ActionTask::<()>::from_fn({
        let (a, b) = (a.clone(), b.clone());
        move |scope| {
            scope.dispatch(a.set(11))?;
            scope.dispatch(b.set(22))?;
            Err(StoreError::msg("boom"))
        }
    });
    let err = store.dispatch(failing).unwrap_err();

    assert_eq!(err.to_string(), "boom");
    assert!(store.snapshot().same_as(&before));
    assert_eq!(store.snapshot().keys(), vec!["a"]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_error_type_reaches_caller_unchanged() {
    #[derive(Debug, thiserror::Error)]
    #[error("quota exceeded by {0}")]
    struct QuotaExceeded(u32);

    let store = Store::new();
    let failing = ActionTask::<()>::from_fn(|_| Err(anyhow::Error::new(QuotaExceeded(3)).into()));
    let err = store.dispatch(failing).unwrap_err();

    let StoreError::Task(inner) = err else {
        panic!("expected a task error");
    };
    assert!(matches!(inner.downcast_ref::<QuotaExceeded>(), Some(QuotaExceeded(3))));
}

#[test]
fn test_selector_identity_until_dependency_changes() {
    let store = Store::new();
    let count = StateBox::new("count", 3i64);
    let runs = Arc::new(AtomicUsize::new(0));
    let double = Selector::new({
        let (count, runs) = (count.clone(), runs.clone());
        move |reader: &Reader<'_>, _: &()| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(*reader.select(&count)? * 2)
        }
    });

    let first = store.select(&double).unwrap();
    let second = store.select(&double).unwrap();
    assert_eq!(*first, 6);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    store.dispatch(count.set(4)).unwrap();
    let third = store.select(&double).unwrap();
    assert_eq!(*third, 8);
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_rolled_back_write_keeps_cache_valid() {
    let store = Store::new();
    let count = StateBox::new("count", 1i64);
    let runs = Arc::new(AtomicUsize::new(0));
    let read = Selector::new({
        let (count, runs) = (count.clone(), runs.clone());
        move |reader: &Reader<'_>, _: &()| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(*reader.select(&count)?)
        }
    });
    store.select(&read).unwrap();

    let failing = ActionTask::<()>::from_fn({
        let (count, read) = (count.clone(), read.clone());
        move |scope| {
            scope.dispatch(count.set(99))?;
            assert_eq!(*scope.select(&read)?, 99);
            Err(StoreError::msg("discard"))
        }
    });
    assert!(store.dispatch(failing).is_err());

    assert_eq!(*store.select(&read).unwrap(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[test]
fn test_materialization_is_idempotent() {
    let store = Store::builder()
        .preloaded_state([("settings".to_string(), json!({ "theme": "dark" }))])
        .build()
        .unwrap();
    let settings = StateBox::new("settings", json!({ "theme": "light" }));

    let first = store.select(&settings).unwrap();
    let second = store.select(&settings).unwrap();
    assert_eq!(first["theme"], "dark");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(store.snapshot().len(), 1);
}

#[test]
fn test_portable_roundtrip_with_hooks() {
    #[derive(Debug, Clone, PartialEq)]
    struct Tags(Vec<String>);

    let tags = StateBox::opaque("tags", Tags(Vec::new())).portable(
        |tags: &Tags| tags.0.join(","),
        |joined: String| Tags(joined.split(',').map(str::to_string).collect()),
    );
    let store = Store::new();
    store
        .dispatch(tags.set(Tags(vec!["a".into(), "b".into()])))
        .unwrap();

    let persisted = store.portable_state().unwrap();
    assert_eq!(persisted["tags"], json!("a,b"));

    let restored = Store::builder().preloaded_state(persisted).build().unwrap();
    assert_eq!(
        *restored.select(&tags).unwrap(),
        Tags(vec!["a".into(), "b".into()])
    );
}

#[test]
fn test_nested_selector_invalidation() {
    let store = Store::new();
    let price = StateBox::new("price", 10u64);
    let quantity = StateBox::new("quantity", 2u64);

    let subtotal = Selector::new({
        let (price, quantity) = (price.clone(), quantity.clone());
        move |reader: &Reader<'_>, _: &()| Ok(*reader.select(&price)? * *reader.select(&quantity)?)
    });
    let with_tax = Selector::new({
        let subtotal = subtotal.clone();
        move |reader: &Reader<'_>, rate: &u64| Ok(*reader.select(&subtotal)? * (100 + rate) / 100)
    });

    assert_eq!(*store.select(&with_tax.call(10)).unwrap(), 22);
    store.dispatch(quantity.set(5)).unwrap();
    assert_eq!(*store.select(&with_tax.call(10)).unwrap(), 55);

    let metrics = store.cache_metrics();
    assert_eq!(metrics.misses, 2);
    assert_eq!(metrics.stale, 2);
}

#[test]
fn test_signal_listeners_run_in_order() {
    let store = Store::new();
    let log = StateBox::new("log", Vec::<String>::new());
    let append = log.mutator("append", |entries, entry: String| {
        let mut entries = entries.clone();
        entries.push(entry);
        entries
    });
    let saved = SignalFactory::<String>::new("saved");
    for name in ["first", "second", "third"] {
        let append = append.clone();
        saved.listen(&log, move |scope: &Scope<'_>, _: &Vec<String>, doc: &String| {
            scope.dispatch(append.call(format!("{name}:{doc}")))?;
            Ok(())
        });
    }

    let calls = broadcasts(&store);
    store.dispatch(saved.emit("readme".to_string())).unwrap();
    assert_eq!(
        *store.select(&log).unwrap(),
        vec!["first:readme", "second:readme", "third:readme"]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dispatch_all_is_atomic() {
    let store = Store::new();
    let calls = broadcasts(&store);
    let count = StateBox::new("count", 0i64);
    let increment = count.mutator("increment", |n, by: i64| n + by);
    let checked = count.try_mutator("checked", |n, limit: i64| {
        if *n > limit {
            Err(StoreError::msg("over limit"))
        } else {
            Ok(*n)
        }
    });

    store
        .dispatch_all([increment.call(1).into_task(), increment.call(2).into_task()])
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let result = store.dispatch_all([
        increment.call(10).into_task(),
        checked.call(5).into_task(),
        increment.call(100).into_task(),
    ]);
    assert!(result.is_err());
    assert_eq!(*store.select(&count).unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_application_enhancer_sees_inner_calls() {
    init_tracing();
    let recorder = Recorder::default();
    let log = recorder.log.clone();
    let store = Store::builder().enhancer(recorder).build().unwrap();
    let count = StateBox::new("count", 1i64);
    let double = Selector::new({
        let count = count.clone();
        move |reader: &Reader<'_>, _: &()| Ok(*reader.select(&count)? * 2)
    })
    .with_type("DOUBLE");

    let action = Action::new({
        let (count, double) = (count.clone(), double.clone());
        move |scope: &Scope<'_>, by: i64| {
            scope.dispatch(count.update(move |n| n + by))?;
            Ok(*scope.select(&double)?)
        }
    })
    .with_type("BUMP_AND_READ");

    assert_eq!(store.dispatch(action.call(2)).unwrap(), 6);
    // Answered by the cache, which sits above the recorder.
    assert_eq!(*store.select(&double).unwrap(), 6);

    let log = log.lock().join("\n");
    insta::assert_snapshot!(log, @r"
    dispatch action BUMP_AND_READ @1
    dispatch mutation count.update @2
    select DOUBLE
    select count
    broadcast
    ");
}

#[test]
fn test_event_reports_in_flight_work() {
    struct Inspect(Arc<Mutex<Vec<(Option<TaskKind>, usize)>>>);

    impl Enhancer for Inspect {
        fn name(&self) -> &'static str {
            "inspect"
        }

        fn dispatch(
            &self,
            event: &Event<'_>,
            task: Task,
            next: Next<'_>,
        ) -> boxstore::Result<Output> {
            self.0.lock().push((event.dispatching(), event.dispatch_depth()));
            next.dispatch(event, task)
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let store = Store::builder()
        .enhancer(Inspect(seen.clone()))
        .build()
        .unwrap();
    let flag = StateBox::new("flag", false);

    store
        .dispatch(ActionTask::from_fn(move |scope| {
            scope.dispatch(flag.set(true)).map(|_| ())
        }))
        .unwrap();

    assert_eq!(
        *seen.lock(),
        vec![(None, 0), (Some(TaskKind::Action), 1)]
    );
}

#[test]
fn test_store_is_shareable_across_threads() {
    let store = Store::new();
    let count = StateBox::new("count", 0i64);
    let increment = count.mutator("increment", |n, by: i64| n + by);

    std::thread::scope(|s| {
        s.spawn(|| store.dispatch(increment.call(1)).unwrap());
    });
    let clone = store.clone();
    assert_eq!(*clone.select(&count).unwrap(), 1);
}

#[test]
fn test_other_threads_wait_for_open_transaction() {
    let store = Store::new();
    let count = StateBox::new("count", 0i64);
    let inside = Arc::new(Barrier::new(2));

    let abandoned = ActionTask::<()>::from_fn({
        let (count, inside) = (count.clone(), inside.clone());
        move |scope| {
            scope.dispatch(count.set(1))?;
            inside.wait();
            Err(StoreError::msg("abandoned"))
        }
    });

    let shared = &store;
    std::thread::scope(|s| {
        let writer = s.spawn(move || shared.dispatch(abandoned));
        inside.wait();
        // Blocks until the other transaction has rolled back.
        assert_eq!(*shared.select(&count).unwrap(), 0);
        shared.dispatch(count.set(50)).unwrap();
        assert!(writer.join().unwrap().is_err());
    });
    assert_eq!(*store.select(&count).unwrap(), 50);
}

#[test]
fn test_listener_receives_current_box_value() {
    let store = Store::new();
    let count = StateBox::new("count", 1i64);
    let increment = count.mutator("increment", |n, by: i64| n + by);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let bumped = SignalFactory::<i64>::new("bumped");
    bumped.listen(&count, {
        let seen = seen.clone();
        move |scope: &Scope<'_>, current: &i64, by: &i64| {
            seen.lock().push(*current);
            scope.dispatch(increment.call(*by))?;
            Ok(())
        }
    });
    bumped.listen(&count, {
        let seen = seen.clone();
        move |_scope: &Scope<'_>, current: &i64, _by: &i64| {
            seen.lock().push(*current);
            Ok(())
        }
    });

    store.dispatch(bumped.emit(10)).unwrap();
    assert_eq!(*seen.lock(), vec![1, 11]);
    assert_eq!(*store.select(&count).unwrap(), 11);
}

#[test]
fn test_plain_box_preloads_and_persists() {
    let count = StateBox::new("count", 0i64);
    let store = Store::builder()
        .preloaded_state([("count".to_string(), json!(7))])
        .build()
        .unwrap();

    assert_eq!(*store.select(&count).unwrap(), 7);
    store.dispatch(count.set(8)).unwrap();
    assert_eq!(store.portable_state().unwrap()["count"], json!(8));
}

#[test]
fn test_opaque_box_stays_out_of_persisted_state() {
    let started = StateBox::opaque("started", Instant::now());
    let store = Store::new();
    store.select(&started).unwrap();
    assert!(store.portable_state().unwrap().is_empty());

    let preloaded = Store::builder()
        .preloaded_state([("started".to_string(), json!(0))])
        .build()
        .unwrap();
    let err = preloaded.select(&started).unwrap_err();
    assert!(matches!(err, StoreError::NotPortable { ref key } if key == "started"));
}
