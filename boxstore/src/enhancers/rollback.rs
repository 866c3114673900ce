//! All-or-nothing dispatch
//!
//! While an outermost dispatch runs, the first mutation of each box records
//! the value the box held before it. If the outermost dispatch fails, every
//! recorded box is put back; boxes that were untouched go back to untouched.

use crate::enhancer::{Enhancer, Next};
use crate::error::Result;
use crate::event::Event;
use crate::task::{Output, Task};
use tracing::{debug, trace};

/// Restores touched boxes when an outermost dispatch fails
#[derive(Debug, Default, Clone, Copy)]
pub struct RollbackEnhancer;

impl Enhancer for RollbackEnhancer {
    fn name(&self) -> &'static str {
        "rollback"
    }

    fn dispatch(&self, event: &Event<'_>, task: Task, next: Next<'_>) -> Result<Output> {
        let outermost = event.begin_restore_points();

        if let Task::Mutation(mutation) = &task {
            event.record_restore_point(mutation.target_info());
        }

        let result = next.dispatch(event, task);
        if !outermost {
            return result;
        }

        let points = event.take_restore_points();
        if let Err(err) = &result {
            let store = event.store();
            for point in points {
                trace!(key = point.info.key(), "restoring box");
                store.restore(&point.info, point.value);
            }
            debug!(error = %err, "dispatch failed, state rolled back");
        }
        result
    }
}
