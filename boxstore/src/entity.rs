//! Boxes: addressable units of mutable state
//!
//! A [`StateBox`] is declared once and shared by every store that touches it.
//! Each store materializes the box lazily on first access, either from a
//! preloaded portable value or from the declared initial value.

use crate::error::{Result, StoreError};
use crate::task::{Mutator, MutationTask};
use serde::{de::DeserializeOwned, Serialize};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Type-erased state value as stored in a snapshot
pub type Value = Arc<dyn Any + Send + Sync>;

static NEXT_BOX_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a declared box
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoxId(u64);

impl BoxId {
    fn next() -> Self {
        BoxId(NEXT_BOX_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BoxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "box#{}", self.0)
    }
}

/// Conversion between a box value and its persisted JSON form
pub(crate) trait PortableCodec: Send + Sync {
    fn encode(&self, key: &str, value: &Value) -> Result<serde_json::Value>;
    fn decode(&self, key: &str, portable: serde_json::Value) -> Result<Value>;
}

/// Serializes the value as-is
struct SerdeCodec<T>(PhantomData<fn() -> T>);

impl<T> PortableCodec for SerdeCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, key: &str, value: &Value) -> Result<serde_json::Value> {
        let typed = value
            .downcast_ref::<T>()
            .ok_or_else(|| StoreError::mismatch::<T>(key))?;
        serde_json::to_value(typed).map_err(|source| StoreError::Portable {
            key: key.to_string(),
            source,
        })
    }

    fn decode(&self, key: &str, portable: serde_json::Value) -> Result<Value> {
        let typed: T = serde_json::from_value(portable).map_err(|source| StoreError::Portable {
            key: key.to_string(),
            source,
        })?;
        Ok(Arc::new(typed))
    }
}

/// Routes the value through user hooks and an intermediate serde type
struct HookCodec<T, J> {
    to: Arc<dyn Fn(&T) -> J + Send + Sync>,
    from: Arc<dyn Fn(J) -> T + Send + Sync>,
}

impl<T, J> PortableCodec for HookCodec<T, J>
where
    T: Send + Sync + 'static,
    J: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, key: &str, value: &Value) -> Result<serde_json::Value> {
        let typed = value
            .downcast_ref::<T>()
            .ok_or_else(|| StoreError::mismatch::<T>(key))?;
        serde_json::to_value((self.to)(typed)).map_err(|source| StoreError::Portable {
            key: key.to_string(),
            source,
        })
    }

    fn decode(&self, key: &str, portable: serde_json::Value) -> Result<Value> {
        let form: J = serde_json::from_value(portable).map_err(|source| StoreError::Portable {
            key: key.to_string(),
            source,
        })?;
        Ok(Arc::new((self.from)(form)))
    }
}

/// Untyped description of a declared box
#[derive(Clone)]
pub struct BoxInfo {
    id: BoxId,
    key: String,
    type_name: &'static str,
    pub(crate) initial: Value,
    pub(crate) codec: Option<Arc<dyn PortableCodec>>,
}

impl BoxInfo {
    /// Identity of the box
    pub fn id(&self) -> BoxId {
        self.id
    }

    /// Registry-wide key of the box
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Rust type name of the box value
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether the box takes part in persistence
    pub fn is_portable(&self) -> bool {
        self.codec.is_some()
    }
}

impl fmt::Debug for BoxInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxInfo")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("type_name", &self.type_name)
            .field("portable", &self.is_portable())
            .finish()
    }
}

/// Typed handle to a unit of state
///
/// Cloning the handle is cheap and keeps the same identity.
pub struct StateBox<T> {
    pub(crate) info: Arc<BoxInfo>,
    initial: Arc<T>,
}

impl<T> StateBox<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Declare a box with a key and an initial value
    ///
    /// The value is persisted as-is through serde unless [`StateBox::portable`]
    /// installs custom hooks.
    pub fn new(key: impl Into<String>, initial: T) -> Self {
        Self::declare(key.into(), initial, Some(Arc::new(SerdeCodec::<T>(PhantomData))))
    }
}

impl<T> StateBox<T>
where
    T: Send + Sync + 'static,
{
    /// Declare a box whose value never leaves the process
    ///
    /// Opaque boxes are left out of the persisted state, and a preloaded
    /// value under their key is rejected on first touch.
    pub fn opaque(key: impl Into<String>, initial: T) -> Self {
        Self::declare(key.into(), initial, None)
    }

    fn declare(key: String, initial: T, codec: Option<Arc<dyn PortableCodec>>) -> Self {
        let initial = Arc::new(initial);
        let erased: Value = initial.clone();
        StateBox {
            info: Arc::new(BoxInfo {
                id: BoxId::next(),
                key,
                type_name: std::any::type_name::<T>(),
                initial: erased,
                codec,
            }),
            initial,
        }
    }

    /// Persist the value through custom to/from portable-form hooks
    pub fn portable<J, To, From>(self, to: To, from: From) -> Self
    where
        J: Serialize + DeserializeOwned + 'static,
        To: Fn(&T) -> J + Send + Sync + 'static,
        From: Fn(J) -> T + Send + Sync + 'static,
    {
        self.with_codec(Arc::new(HookCodec {
            to: Arc::new(to),
            from: Arc::new(from),
        }))
    }

    fn with_codec(mut self, codec: Arc<dyn PortableCodec>) -> Self {
        Arc::make_mut(&mut self.info).codec = Some(codec);
        self
    }

    /// Key of the box
    pub fn key(&self) -> &str {
        self.info.key()
    }

    /// Identity of the box
    pub fn id(&self) -> BoxId {
        self.info.id()
    }

    /// Untyped description of the box
    pub fn info(&self) -> &BoxInfo {
        &self.info
    }

    /// The declared initial value
    pub fn initial(&self) -> Arc<T> {
        self.initial.clone()
    }

    /// Declare a named mutator
    pub fn mutator<A, F>(&self, name: &'static str, f: F) -> Mutator<T, A>
    where
        A: Send + 'static,
        F: Fn(&T, A) -> T + Send + Sync + 'static,
    {
        Mutator::new(self.clone(), name, Arc::new(move |state: &T, args: A| Ok(f(state, args))))
    }

    /// Declare a named mutator that may reject its input
    pub fn try_mutator<A, F>(&self, name: &'static str, f: F) -> Mutator<T, A>
    where
        A: Send + 'static,
        F: Fn(&T, A) -> Result<T> + Send + Sync + 'static,
    {
        Mutator::new(self.clone(), name, Arc::new(f))
    }

    /// Replace the value outright
    pub fn set(&self, value: T) -> MutationTask<T> {
        MutationTask::new(self.clone(), "set", move |_| Ok(value))
    }

    /// Derive the next value from the current one
    pub fn update<F>(&self, f: F) -> MutationTask<T>
    where
        F: FnOnce(&T) -> T + Send + 'static,
    {
        MutationTask::new(self.clone(), "update", move |state| Ok(f(state)))
    }
}

impl<T> Clone for StateBox<T> {
    fn clone(&self) -> Self {
        StateBox {
            info: self.info.clone(),
            initial: self.initial.clone(),
        }
    }
}

impl<T> fmt::Debug for StateBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateBox").field(&self.info.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_box_identity() {
        let a = StateBox::new("a", 1u32);
        let b = StateBox::new("a", 1u32);
        assert_eq!(a.id(), a.clone().id());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.key(), "a");
        assert_eq!(*a.initial(), 1);
    }

    #[test]
    fn test_serde_codec_roundtrip() {
        let b = StateBox::new("names", vec!["x".to_string()]);
        let codec = b.info().codec.clone().unwrap();
        let encoded = codec.encode("names", &b.info().initial).unwrap();
        assert_eq!(encoded, serde_json::json!(["x"]));

        let decoded = codec.decode("names", serde_json::json!(["y", "z"])).unwrap();
        assert_eq!(
            decoded.downcast_ref::<Vec<String>>().unwrap(),
            &vec!["y".to_string(), "z".to_string()]
        );
    }

    #[test]
    fn test_hook_codec() {
        #[derive(Debug, PartialEq)]
        struct Celsius(f64);
        #[derive(Serialize, Deserialize)]
        struct Portable {
            c: f64,
        }

        let b = StateBox::opaque("temp", Celsius(20.0))
            .portable(|t: &Celsius| Portable { c: t.0 }, |p: Portable| Celsius(p.c));
        assert!(b.info().is_portable());

        let codec = b.info().codec.clone().unwrap();
        let encoded = codec.encode("temp", &b.info().initial).unwrap();
        assert_eq!(encoded, serde_json::json!({ "c": 20.0 }));

        let err = codec.decode("temp", serde_json::json!("nope")).err().unwrap();
        assert!(matches!(err, StoreError::Portable { ref key, .. } if key == "temp"));
    }

    #[test]
    fn test_plain_box_is_portable_opaque_is_not() {
        let plain = StateBox::new("plain", 0u8);
        assert!(plain.info().is_portable());
        assert!(plain.info().type_name().contains("u8"));

        let opaque = StateBox::opaque("opaque", std::time::Instant::now());
        assert!(!opaque.info().is_portable());
    }
}
