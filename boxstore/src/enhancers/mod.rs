//! Built-in enhancers
//!
//! Every store installs these three, outermost first:
//!
//! - [`RollbackEnhancer`]: restores touched boxes when an outermost dispatch fails
//! - [`TransactionEnhancer`]: folds nested dispatches into one broadcast
//! - [`CacheEnhancer`]: memoizes selector results against their box dependencies

pub mod cache;
pub mod rollback;
pub mod transaction;

pub use cache::CacheEnhancer;
pub use rollback::RollbackEnhancer;
pub use transaction::TransactionEnhancer;
