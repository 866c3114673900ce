//! Error types for the store engine
//!
//! Configuration errors are raised while a store is being built. Execution
//! errors are raised by user code (actors, mutators, listeners, selectors) or
//! by a box codec, and always reach the caller of `dispatch`/`select`
//! unchanged.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Errors surfaced by a [`Store`](crate::Store)
#[derive(Error, Debug)]
pub enum StoreError {
    /// Two distinct boxes claim the same key
    #[error("box key `{key}` is declared by more than one box")]
    DuplicateKey {
        /// The contested key
        key: String,
    },

    /// The enhancer list handed to the builder cannot be composed
    #[error("malformed enhancer chain: {0}")]
    MalformedChain(String),

    /// A box codec failed to convert to or from the portable form
    #[error("portable form of box `{key}` is invalid: {source}")]
    Portable {
        /// Key of the box whose codec failed
        key: String,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },

    /// Preloaded state names a box that has no portable form
    #[error("box `{key}` is opaque and cannot be preloaded")]
    NotPortable {
        /// Key of the opaque box
        key: String,
    },

    /// A value did not have the type its handle declares
    #[error("`{key}` does not hold a value of type `{expected}`")]
    TypeMismatch {
        /// Box key, selector tag or task label involved
        key: String,
        /// Type name the handle expected
        expected: &'static str,
    },

    /// An actor, mutator, listener or selector failed
    #[error(transparent)]
    Task(#[from] anyhow::Error),
}

impl StoreError {
    /// Build a task error from a plain message
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        StoreError::Task(anyhow::Error::msg(message))
    }

    /// True for errors that can only happen while building a store
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StoreError::DuplicateKey { .. } | StoreError::MalformedChain(_)
        )
    }

    pub(crate) fn mismatch<T>(key: impl Into<String>) -> Self {
        StoreError::TypeMismatch {
            key: key.into(),
            expected: std::any::type_name::<T>(),
        }
    }
}
