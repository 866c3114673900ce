//! Boxstore: a single-writer typed state container
//!
//! Application state lives in **boxes**, addressable units of typed state
//! that are declared once and materialized lazily by each store. State
//! changes go through **dispatch**, reads go through **select**.
//!
//! # Architecture
//!
//! A store is a base engine wrapped by an ordered chain of enhancers:
//!
//! ```text
//! rollback → transaction → cache → application enhancers… → base engine
//! ```
//!
//! - The base engine routes tasks (actions, mutations, signals) and selections
//!   (boxes, selector calls), and broadcasts after every dispatch.
//! - The transaction enhancer folds every dispatch nested under one outer call
//!   into a single broadcast.
//! - The rollback enhancer restores every box touched by a failing outer call.
//! - The cache enhancer memoizes selector results against the exact box values
//!   they read.
//!
//! ## Key Features
//!
//! - **Lazy materialization**: a box gets its value on first touch, from
//!   preloaded portable state or from its initial value
//! - **Atomic dispatch**: an outer call either applies entirely or not at all
//! - **Batched notification**: one broadcast per successful outer call
//! - **Memoized selectors**: keyed by (selector, arguments), validated by
//!   reference equality of every box value read
//!
//! # Example
//!
//! ```rust,ignore
//! use boxstore::prelude::*;
//!
//! let count = StateBox::new("count", 0i64);
//! let increment = count.mutator("increment", |n, by: i64| n + by);
//! let double = Selector::new({
//!     let count = count.clone();
//!     move |reader, _: &()| Ok(*reader.select(&count)? * 2)
//! });
//!
//! let store = Store::new();
//! store.dispatch(increment.call(3))?;
//! assert_eq!(*store.select(&double)?, 6);
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

// Core modules
pub mod entity;
pub mod error;
pub mod event;
pub mod options;
pub mod selector;
pub mod snapshot;
pub mod store;
pub mod task;

// Enhancer chain
pub mod enhancer;
pub mod enhancers;
pub mod metrics;

// Re-export main types
pub use enhancer::{Enhancer, Next};
pub use enhancers::{CacheEnhancer, RollbackEnhancer, TransactionEnhancer};
pub use entity::{BoxId, BoxInfo, StateBox, Value};
pub use error::{Result, StoreError};
pub use event::{Event, Reader, Scope, Transaction, TransactionId};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use options::{CacheConfig, StoreOptions};
pub use selector::{
    hash_value, ArgsKey, ComputeRequest, Selectable, Selection, Selector, SelectorCall, SelectorId,
};
pub use snapshot::Snapshot;
pub use store::{create_store, Listener, Store, StoreBuilder, Unsubscribe};
pub use task::{
    Action, ActionInvocation, ActionTask, Dispatchable, MutationInvocation, MutationTask, Mutator,
    Output, SignalFactory, SignalInvocation, SignalTask, Task, TaskKind,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::entity::StateBox;
    pub use crate::error::{Result, StoreError};
    pub use crate::event::{Reader, Scope};
    pub use crate::options::{CacheConfig, StoreOptions};
    pub use crate::selector::Selector;
    pub use crate::store::{create_store, Store};
    pub use crate::task::{Action, ActionTask, Dispatchable, SignalFactory};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_basic_usage() {
        let count = StateBox::new("count", 0i64);
        let increment = count.mutator("increment", |n, by: i64| n + by);
        let double = Selector::new({
            let count = count.clone();
            move |reader: &Reader<'_>, _: &()| Ok(*reader.select(&count)? * 2)
        });

        let store = Store::new();
        store.dispatch(increment.call(3)).unwrap();
        assert_eq!(*store.select(&double).unwrap(), 6);
        assert_eq!(store.enhancers(), vec!["rollback", "transaction", "cache"]);
    }
}
