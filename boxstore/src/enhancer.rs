//! Enhancer chain
//!
//! An [`Enhancer`] wraps the base engine and may intercept dispatch, select,
//! subscribe and broadcast calls. The chain is an ordered list composed once
//! when the store is built:
//!
//! ```text
//! rollback → transaction → cache → application enhancers… → base engine
//! ```
//!
//! Each method receives a [`Next`] pointing at the remainder of the chain.
//! Every method defaults to plain delegation, so an enhancer only overrides
//! what it cares about.

use crate::entity::Value;
use crate::error::Result;
use crate::event::Event;
use crate::selector::Selection;
use crate::store::{BaseEngine, Listener, Unsubscribe};
use crate::task::{Output, Task};
use std::fmt;
use std::sync::Arc;

/// Middleware around the base store engine
pub trait Enhancer: Send + Sync {
    /// Unique name within a chain
    fn name(&self) -> &'static str;

    /// Intercept a dispatch; delegates by default
    fn dispatch(&self, event: &Event<'_>, task: Task, next: Next<'_>) -> Result<Output> {
        next.dispatch(event, task)
    }

    /// Intercept a select; delegates by default
    fn select(&self, event: &Event<'_>, selection: &Selection, next: Next<'_>) -> Result<Value> {
        next.select(event, selection)
    }

    /// Intercept listener registration; delegates by default
    fn subscribe(&self, listener: Listener, next: Next<'_>) -> Unsubscribe {
        next.subscribe(listener)
    }

    /// Intercept a broadcast; delegates by default
    fn broadcast(&self, event: &Event<'_>, next: Next<'_>) {
        next.broadcast(event)
    }
}

/// The remainder of the chain below an enhancer
#[derive(Clone, Copy)]
pub struct Next<'a> {
    layers: &'a [Arc<dyn Enhancer>],
    base: &'a BaseEngine,
}

impl<'a> Next<'a> {
    pub(crate) fn new(layers: &'a [Arc<dyn Enhancer>], base: &'a BaseEngine) -> Self {
        Next { layers, base }
    }

    fn split(self) -> Option<(&'a Arc<dyn Enhancer>, Next<'a>)> {
        self.layers.split_first().map(|(layer, rest)| {
            (
                layer,
                Next {
                    layers: rest,
                    base: self.base,
                },
            )
        })
    }

    /// Hand a dispatch to the next layer
    pub fn dispatch(self, event: &Event<'_>, task: Task) -> Result<Output> {
        match self.split() {
            Some((layer, next)) => layer.dispatch(event, task, next),
            None => self.base.dispatch(event, task),
        }
    }

    /// Hand a select to the next layer
    pub fn select(self, event: &Event<'_>, selection: &Selection) -> Result<Value> {
        match self.split() {
            Some((layer, next)) => layer.select(event, selection, next),
            None => self.base.select(event, selection),
        }
    }

    /// Hand a subscription to the next layer
    pub fn subscribe(self, listener: Listener) -> Unsubscribe {
        match self.split() {
            Some((layer, next)) => layer.subscribe(listener, next),
            None => self.base.subscribe(listener),
        }
    }

    /// Hand a broadcast to the next layer
    pub fn broadcast(self, event: &Event<'_>) {
        match self.split() {
            Some((layer, next)) => layer.broadcast(event, next),
            None => self.base.broadcast(),
        }
    }

    /// Names of the remaining enhancers, outermost first
    pub fn names(self) -> Vec<&'static str> {
        self.layers.iter().map(|layer| layer.name()).collect()
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("layers", &self.names()).finish()
    }
}
