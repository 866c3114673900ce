//! Transactional batching
//!
//! The outermost dispatch on an event opens a transaction; every dispatch
//! reached while it is open joins it. Broadcasts requested inside the
//! transaction are swallowed and a single broadcast is issued when the
//! outermost call returns successfully. A failing transaction broadcasts
//! nothing.

use crate::enhancer::{Enhancer, Next};
use crate::error::Result;
use crate::event::{Event, Transaction, TransactionId};
use crate::task::{Output, Task};
use tracing::{debug, trace};

/// Batches nested dispatches into one broadcast
#[derive(Debug, Default, Clone, Copy)]
pub struct TransactionEnhancer;

impl Enhancer for TransactionEnhancer {
    fn name(&self) -> &'static str {
        "transaction"
    }

    fn dispatch(&self, event: &Event<'_>, task: Task, next: Next<'_>) -> Result<Output> {
        if let Some(open) = event.transaction() {
            event.set_transaction(Some(Transaction {
                depth: open.depth + 1,
                ..open
            }));
            let result = next.dispatch(event, task);
            event.set_transaction(Some(open));
            return result;
        }

        let transaction = Transaction {
            id: TransactionId::next(),
            depth: 1,
        };
        debug!(transaction = %transaction.id, task = %task.label(), "transaction opened");
        event.set_transaction(Some(transaction));
        let result = next.dispatch(event, task);
        event.set_transaction(None);

        match &result {
            Ok(_) => {
                debug!(transaction = %transaction.id, "transaction committed");
                next.broadcast(event);
            }
            Err(err) => {
                debug!(transaction = %transaction.id, error = %err, "transaction failed");
            }
        }
        result
    }

    fn broadcast(&self, event: &Event<'_>, next: Next<'_>) {
        match event.transaction() {
            Some(open) => trace!(transaction = %open.id, "broadcast deferred"),
            None => next.broadcast(event),
        }
    }
}
