//! Execution context threaded through every chain call
//!
//! An [`Event`] is created for each outermost `dispatch`, `select` or
//! `broadcast` made on a [`Store`]. Nested calls made by actors, listeners and
//! selectors reuse it through the [`Scope`] and [`Reader`] handles, which is
//! how enhancers tell a re-entrant call from a fresh one.

use crate::entity::{BoxId, BoxInfo, Value};
use crate::error::Result;
use crate::selector::{downcast_selected, Selectable};
use crate::store::Store;
use crate::task::{Dispatchable, TaskKind};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one outermost dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    pub(crate) fn next() -> Self {
        TransactionId(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// The transaction currently open on an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    /// Identity of the transaction
    pub id: TransactionId,
    /// Number of dispatch calls currently inside it (1 = outermost only)
    pub depth: usize,
}

/// A box value observed while computing a selector
#[derive(Clone)]
pub(crate) struct Dependency {
    pub(crate) info: Arc<BoxInfo>,
    pub(crate) value: Value,
}

/// Pre-transaction value of a box, `None` if it was not materialized yet
pub(crate) struct RestorePoint {
    pub(crate) info: Arc<BoxInfo>,
    pub(crate) value: Option<Value>,
}

struct SelectFrame {
    label: String,
    dependencies: Vec<Dependency>,
}

/// Per-call execution context
pub struct Event<'s> {
    store: &'s Store,
    transaction: Cell<Option<Transaction>>,
    restore_points: RefCell<Option<HashMap<BoxId, RestorePoint>>>,
    selecting: RefCell<Vec<SelectFrame>>,
    dispatching: RefCell<Vec<TaskKind>>,
}

impl<'s> Event<'s> {
    pub(crate) fn root(store: &'s Store) -> Self {
        Event {
            store,
            transaction: Cell::new(None),
            restore_points: RefCell::new(None),
            selecting: RefCell::new(Vec::new()),
            dispatching: RefCell::new(Vec::new()),
        }
    }

    /// The store this event runs against
    pub fn store(&self) -> &'s Store {
        self.store
    }

    /// The transaction in flight, if any
    pub fn transaction(&self) -> Option<Transaction> {
        self.transaction.get()
    }

    /// Kind of the innermost task being dispatched
    pub fn dispatching(&self) -> Option<TaskKind> {
        self.dispatching.borrow().last().copied()
    }

    /// Number of nested dispatches in flight
    pub fn dispatch_depth(&self) -> usize {
        self.dispatching.borrow().len()
    }

    /// Label of the innermost selector being computed
    pub fn selecting(&self) -> Option<String> {
        self.selecting.borrow().last().map(|frame| frame.label.clone())
    }

    /// Number of nested selector computations in flight
    pub fn selection_depth(&self) -> usize {
        self.selecting.borrow().len()
    }

    pub(crate) fn set_transaction(&self, transaction: Option<Transaction>) {
        self.transaction.set(transaction);
    }

    pub(crate) fn push_dispatching(&self, kind: TaskKind) {
        self.dispatching.borrow_mut().push(kind);
    }

    pub(crate) fn pop_dispatching(&self) {
        self.dispatching.borrow_mut().pop();
    }

    /// Start recording restore points; false if already recording
    pub(crate) fn begin_restore_points(&self) -> bool {
        let mut points = self.restore_points.borrow_mut();
        if points.is_some() {
            return false;
        }
        *points = Some(HashMap::new());
        true
    }

    /// Record the pre-transaction value of a box once
    pub(crate) fn record_restore_point(&self, info: &Arc<BoxInfo>) {
        let mut points = self.restore_points.borrow_mut();
        if let Some(points) = points.as_mut() {
            points.entry(info.id()).or_insert_with(|| RestorePoint {
                info: info.clone(),
                value: self.store.peek(info),
            });
        }
    }

    pub(crate) fn take_restore_points(&self) -> Vec<RestorePoint> {
        self.restore_points
            .borrow_mut()
            .take()
            .map(|points| points.into_values().collect())
            .unwrap_or_default()
    }

    pub(crate) fn push_selecting(&self, label: String) {
        self.selecting.borrow_mut().push(SelectFrame {
            label,
            dependencies: Vec::new(),
        });
    }

    pub(crate) fn pop_selecting(&self) -> Vec<Dependency> {
        self.selecting
            .borrow_mut()
            .pop()
            .map(|frame| frame.dependencies)
            .unwrap_or_default()
    }

    /// Attribute box reads to the innermost selector being computed
    pub(crate) fn record_dependencies<'a, I>(&self, dependencies: I)
    where
        I: IntoIterator<Item = &'a Dependency>,
    {
        let mut frames = self.selecting.borrow_mut();
        let Some(frame) = frames.last_mut() else {
            return;
        };
        for dependency in dependencies {
            let seen = frame
                .dependencies
                .iter()
                .any(|d| d.info.id() == dependency.info.id());
            if !seen {
                frame.dependencies.push(dependency.clone());
            }
        }
    }
}

impl fmt::Debug for Event<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("transaction", &self.transaction.get())
            .field("dispatching", &self.dispatching.borrow())
            .field("selecting", &self.selecting())
            .finish()
    }
}

/// Handle given to actors and signal listeners
///
/// Dispatches and selects made through a scope join the event that invoked
/// the actor, so they take part in its transaction.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    event: &'a Event<'a>,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(event: &'a Event<'a>) -> Self {
        Scope { event }
    }

    /// Dispatch a nested task
    pub fn dispatch<D: Dispatchable>(&self, task: D) -> Result<D::Output> {
        let output = self.event.store().dispatch_in(self.event, task.into_task())?;
        D::extract(output)
    }

    /// Select a value
    pub fn select<S: Selectable>(&self, selectable: &S) -> Result<Arc<S::Output>> {
        let selection = selectable.selection();
        let value = self.event.store().select_in(self.event, &selection)?;
        downcast_selected(&selection, value)
    }

    /// The surrounding event
    pub fn event(&self) -> &'a Event<'a> {
        self.event
    }
}

impl fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Scope").field(self.event).finish()
    }
}

/// Read-only handle given to selectors
#[derive(Clone, Copy)]
pub struct Reader<'a> {
    event: &'a Event<'a>,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(event: &'a Event<'a>) -> Self {
        Reader { event }
    }

    /// Select a value, recording it as a dependency of the caller
    pub fn select<S: Selectable>(&self, selectable: &S) -> Result<Arc<S::Output>> {
        let selection = selectable.selection();
        let value = self.event.store().select_in(self.event, &selection)?;
        downcast_selected(&selection, value)
    }

    /// The surrounding event
    pub fn event(&self) -> &'a Event<'a> {
        self.event
    }
}

impl fmt::Debug for Reader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reader").field(self.event).finish()
    }
}
