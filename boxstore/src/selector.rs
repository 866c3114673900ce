//! Selectors and the select protocol
//!
//! A [`Selector`] is a pure computation over boxes and other selectors. Binding
//! it to concrete arguments yields a [`SelectorCall`]; the pair
//! (selector identity, argument value) is what the cache layer keys on.

use crate::entity::{BoxInfo, StateBox, Value};
use crate::error::{Result, StoreError};
use crate::event::Reader;
use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type ComputeFn<A, V> = dyn Fn(&Reader<'_>, &A) -> Result<V> + Send + Sync;
type ErasedComputeFn = dyn Fn(&Reader<'_>) -> Result<Value> + Send + Sync;

static NEXT_SELECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a selector factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SelectorId(u64);

impl fmt::Display for SelectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "selector#{}", self.0)
    }
}

/// Helper for computing hash values
pub fn hash_value<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn args_eq<A: PartialEq + 'static>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<A>(), b.downcast_ref::<A>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Type-erased argument tuple compared by value
#[derive(Clone)]
pub struct ArgsKey {
    hash: u64,
    args: Arc<dyn Any + Send + Sync>,
    eq: fn(&dyn Any, &dyn Any) -> bool,
}

impl ArgsKey {
    /// Erase an argument value
    pub fn new<A>(args: A) -> Self
    where
        A: Hash + Eq + Send + Sync + 'static,
    {
        ArgsKey {
            hash: hash_value(&args),
            args: Arc::new(args),
            eq: args_eq::<A>,
        }
    }
}

impl PartialEq for ArgsKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && (self.eq)(&*self.args, &*other.args)
    }
}

impl Eq for ArgsKey {}

impl Hash for ArgsKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Debug for ArgsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArgsKey({:016x})", self.hash)
    }
}

/// A selector bound to arguments, ready to be computed
#[derive(Clone)]
pub struct ComputeRequest {
    selector: SelectorId,
    tag: Option<&'static str>,
    args: ArgsKey,
    compute: Arc<ErasedComputeFn>,
}

impl ComputeRequest {
    /// Identity of the selector factory
    pub fn selector(&self) -> SelectorId {
        self.selector
    }

    /// Type tag of the selector, if any
    pub fn type_tag(&self) -> Option<&'static str> {
        self.tag
    }

    /// Erased argument value
    pub fn args(&self) -> &ArgsKey {
        &self.args
    }

    pub(crate) fn compute(&self, reader: &Reader<'_>) -> Result<Value> {
        (self.compute)(reader)
    }
}

impl fmt::Debug for ComputeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeRequest")
            .field("selector", &self.selector)
            .field("tag", &self.tag)
            .field("args", &self.args)
            .finish()
    }
}

/// The unit passed through the select chain
#[derive(Clone)]
pub enum Selection {
    /// Direct box lookup
    Box(Arc<BoxInfo>),
    /// Selector computation
    Computed(ComputeRequest),
}

impl Selection {
    /// Human-readable label for logs and errors
    pub fn label(&self) -> String {
        match self {
            Selection::Box(info) => info.key().to_string(),
            Selection::Computed(request) => match request.tag {
                Some(tag) => tag.to_string(),
                None => request.selector.to_string(),
            },
        }
    }
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::Box(info) => f.debug_tuple("Box").field(&info.key()).finish(),
            Selection::Computed(request) => f.debug_tuple("Computed").field(request).finish(),
        }
    }
}

/// Anything that can be handed to `select`
pub trait Selectable {
    /// Type of the selected value
    type Output: Send + Sync + 'static;

    /// Erase into the closed selection enum
    fn selection(&self) -> Selection;
}

impl<T> Selectable for StateBox<T>
where
    T: Send + Sync + 'static,
{
    type Output = T;

    fn selection(&self) -> Selection {
        Selection::Box(self.info.clone())
    }
}

pub(crate) fn downcast_selected<T>(selection: &Selection, value: Value) -> Result<Arc<T>>
where
    T: Send + Sync + 'static,
{
    value
        .downcast::<T>()
        .map_err(|_| StoreError::mismatch::<T>(selection.label()))
}

/// Pure derived-value computation
pub struct Selector<A, V> {
    id: SelectorId,
    tag: Option<&'static str>,
    compute: Arc<ComputeFn<A, V>>,
}

impl<A, V> Selector<A, V>
where
    A: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Declare a selector
    ///
    /// The compute function must only depend on values obtained through the
    /// reader and on its arguments; anything else breaks memoization.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn(&Reader<'_>, &A) -> Result<V> + Send + Sync + 'static,
    {
        Selector {
            id: SelectorId(NEXT_SELECTOR_ID.fetch_add(1, Ordering::Relaxed)),
            tag: None,
            compute: Arc::new(compute),
        }
    }

    /// Attach a type tag for tooling
    pub fn with_type(mut self, tag: &'static str) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Identity of this selector
    pub fn id(&self) -> SelectorId {
        self.id
    }

    /// Type tag, if any
    pub fn type_tag(&self) -> Option<&'static str> {
        self.tag
    }

    /// Bind arguments
    pub fn call(&self, args: A) -> SelectorCall<A, V> {
        SelectorCall {
            selector: self.clone(),
            args,
        }
    }

    fn request(&self, args: A) -> ComputeRequest {
        let compute = self.compute.clone();
        let bound = args.clone();
        ComputeRequest {
            selector: self.id,
            tag: self.tag,
            args: ArgsKey::new(args),
            compute: Arc::new(move |reader: &Reader<'_>| {
                compute(reader, &bound).map(|v| Arc::new(v) as Value)
            }),
        }
    }
}

impl<A, V> Clone for Selector<A, V> {
    fn clone(&self) -> Self {
        Selector {
            id: self.id,
            tag: self.tag,
            compute: self.compute.clone(),
        }
    }
}

impl<A, V> fmt::Debug for Selector<A, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .finish()
    }
}

impl<V> Selectable for Selector<(), V>
where
    V: Send + Sync + 'static,
{
    type Output = V;

    fn selection(&self) -> Selection {
        Selection::Computed(self.request(()))
    }
}

/// A selector bound to its arguments
pub struct SelectorCall<A, V> {
    selector: Selector<A, V>,
    args: A,
}

impl<A, V> SelectorCall<A, V> {
    /// The bound arguments
    pub fn args(&self) -> &A {
        &self.args
    }
}

impl<A: Clone, V> Clone for SelectorCall<A, V> {
    fn clone(&self) -> Self {
        SelectorCall {
            selector: self.selector.clone(),
            args: self.args.clone(),
        }
    }
}

impl<A: fmt::Debug, V> fmt::Debug for SelectorCall<A, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorCall")
            .field("selector", &self.selector)
            .field("args", &self.args)
            .finish()
    }
}

impl<A, V> Selectable for SelectorCall<A, V>
where
    A: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    type Output = V;

    fn selection(&self) -> Selection {
        Selection::Computed(self.selector.request(self.args.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_key_equality() {
        assert_eq!(ArgsKey::new(42u32), ArgsKey::new(42u32));
        assert_ne!(ArgsKey::new(42u32), ArgsKey::new(43u32));
        assert_eq!(
            ArgsKey::new(("a".to_string(), 1)),
            ArgsKey::new(("a".to_string(), 1))
        );
    }

    #[test]
    fn test_args_key_distinguishes_types() {
        // Same bit pattern, different types: never equal.
        assert_ne!(ArgsKey::new(1u64), ArgsKey::new(1i64));
    }

    #[test]
    fn test_selector_identity_and_tag() {
        let a = Selector::new(|_reader, n: &u32| Ok(*n)).with_type("ID");
        let b = Selector::new(|_reader, n: &u32| Ok(*n));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
        assert_eq!(a.type_tag(), Some("ID"));

        let call = a.call(5);
        assert_eq!(*call.args(), 5);
        match call.selection() {
            Selection::Computed(request) => {
                assert_eq!(request.selector(), a.id());
                assert_eq!(request.args(), &ArgsKey::new(5u32));
            }
            Selection::Box(_) => panic!("expected computed selection"),
        }
        assert_eq!(call.selection().label(), "ID");
        assert_eq!(b.call(1).selection().label(), b.id().to_string());
    }

    #[test]
    fn test_box_selection() {
        let count = StateBox::new("count", 0i32);
        let selection = count.selection();
        assert_eq!(selection.label(), "count");
        assert_eq!(format!("{:?}", selection), r#"Box("count")"#);
    }
}
