//! Dispatchable units of work
//!
//! Every write to a store goes through one of three task kinds:
//!
//! - **Action**: arbitrary user code receiving a [`Scope`] that can dispatch
//!   further tasks and select values
//! - **Mutation**: one mutator applied to the current value of one box
//! - **Signal**: a payload fanned out to every listener of a signal factory
//!
//! Typed handles ([`ActionTask`], [`MutationTask`], [`SignalTask`]) convert
//! into the closed [`Task`] enum through [`Dispatchable`], which also recovers
//! the typed result from the erased [`Output`].

use crate::entity::{BoxInfo, StateBox, Value};
use crate::error::{Result, StoreError};
use crate::event::Scope;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Type-erased result of a dispatch
pub type Output = Box<dyn Any + Send + Sync>;

type ActorFn<A, R> = dyn Fn(&Scope<'_>, A) -> Result<R> + Send + Sync;
type MutatorFn<T, A> = dyn Fn(&T, A) -> Result<T> + Send + Sync;
type NotifyFn = dyn Fn(&Scope<'_>, &Value, &(dyn Any + Send + Sync + 'static)) -> Result<()> + Send + Sync;

/// Discriminant of a [`Task`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// An actor invocation
    Action,
    /// A mutator applied to a box
    Mutation,
    /// A signal broadcast to listeners
    Signal,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Action => write!(f, "action"),
            TaskKind::Mutation => write!(f, "mutation"),
            TaskKind::Signal => write!(f, "signal"),
        }
    }
}

/// The unit passed through the dispatch chain
pub enum Task {
    /// Run an actor
    Action(ActionInvocation),
    /// Replace a box value
    Mutation(MutationInvocation),
    /// Notify signal listeners
    Signal(SignalInvocation),
}

impl Task {
    /// Kind of this task
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Action(_) => TaskKind::Action,
            Task::Mutation(_) => TaskKind::Mutation,
            Task::Signal(_) => TaskKind::Signal,
        }
    }

    /// Human-readable label for logs
    pub fn label(&self) -> String {
        match self {
            Task::Action(action) => action.label().unwrap_or("anonymous").to_string(),
            Task::Mutation(mutation) => {
                format!("{}.{}", mutation.target().key(), mutation.mutator())
            }
            Task::Signal(signal) => signal.signal().to_string(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind())
            .field("label", &self.label())
            .finish()
    }
}

/// Erased actor call
pub struct ActionInvocation {
    label: Option<&'static str>,
    run: Box<dyn FnOnce(&Scope<'_>) -> Result<Output> + Send>,
}

impl ActionInvocation {
    /// Optional type tag of the action
    pub fn label(&self) -> Option<&'static str> {
        self.label
    }

    pub(crate) fn run(self, scope: &Scope<'_>) -> Result<Output> {
        (self.run)(scope)
    }
}

impl fmt::Debug for ActionInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionInvocation")
            .field("label", &self.label)
            .finish()
    }
}

/// Erased mutator application
pub struct MutationInvocation {
    target: Arc<BoxInfo>,
    mutator: &'static str,
    apply: Box<dyn FnOnce(&Value) -> Result<Value> + Send>,
}

impl MutationInvocation {
    /// The box being mutated
    pub fn target(&self) -> &BoxInfo {
        &self.target
    }

    /// Name of the mutator
    pub fn mutator(&self) -> &'static str {
        self.mutator
    }

    pub(crate) fn target_info(&self) -> &Arc<BoxInfo> {
        &self.target
    }

    pub(crate) fn apply(self, current: &Value) -> Result<Value> {
        (self.apply)(current)
    }
}

impl fmt::Debug for MutationInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MutationInvocation({}.{})", self.target.key(), self.mutator)
    }
}

#[derive(Clone)]
pub(crate) struct SignalListener {
    pub(crate) target: Arc<BoxInfo>,
    pub(crate) notify: Arc<NotifyFn>,
}

/// Erased signal emission
pub struct SignalInvocation {
    signal: &'static str,
    listeners: Arc<RwLock<Vec<SignalListener>>>,
    payload: Box<dyn Any + Send + Sync>,
}

impl SignalInvocation {
    /// Name of the signal factory
    pub fn signal(&self) -> &'static str {
        self.signal
    }

    /// Listeners in registration order, as of now
    pub(crate) fn listeners(&self) -> Vec<SignalListener> {
        self.listeners.read().clone()
    }

    pub(crate) fn payload(&self) -> &(dyn Any + Send + Sync + 'static) {
        &*self.payload
    }

    pub(crate) fn into_payload(self) -> Output {
        self.payload
    }
}

impl fmt::Debug for SignalInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalInvocation")
            .field("signal", &self.signal)
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

/// Anything that can be handed to `dispatch`
pub trait Dispatchable {
    /// Typed result of the dispatch
    type Output;

    /// Erase into the closed task enum
    fn into_task(self) -> Task;

    /// Recover the typed result
    fn extract(output: Output) -> Result<Self::Output>;
}

impl Dispatchable for Task {
    type Output = Output;

    fn into_task(self) -> Task {
        self
    }

    fn extract(output: Output) -> Result<Output> {
        Ok(output)
    }
}

/// Reusable actor, parametrized by its call arguments
pub struct Action<A, R> {
    actor: Arc<ActorFn<A, R>>,
    label: Option<&'static str>,
}

impl<A, R> Action<A, R>
where
    A: Send + 'static,
    R: Send + Sync + 'static,
{
    /// Create an action factory from an actor
    pub fn new<F>(actor: F) -> Self
    where
        F: Fn(&Scope<'_>, A) -> Result<R> + Send + Sync + 'static,
    {
        Action {
            actor: Arc::new(actor),
            label: None,
        }
    }

    /// Attach a type tag used in logs
    pub fn with_type(mut self, label: &'static str) -> Self {
        self.label = Some(label);
        self
    }

    /// Type tag, if any
    pub fn label(&self) -> Option<&'static str> {
        self.label
    }

    /// Bind arguments, producing a dispatchable task
    pub fn call(&self, args: A) -> ActionTask<R> {
        let actor = self.actor.clone();
        ActionTask {
            invocation: ActionInvocation {
                label: self.label,
                run: Box::new(move |scope: &Scope<'_>| {
                    actor(scope, args).map(|r| Box::new(r) as Output)
                }),
            },
            _marker: PhantomData,
        }
    }
}

impl<A, R> Clone for Action<A, R> {
    fn clone(&self) -> Self {
        Action {
            actor: self.actor.clone(),
            label: self.label,
        }
    }
}

impl<A, R> fmt::Debug for Action<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action").field("label", &self.label).finish()
    }
}

/// An action bound to its arguments
pub struct ActionTask<R> {
    invocation: ActionInvocation,
    _marker: PhantomData<fn() -> R>,
}

impl<R> ActionTask<R>
where
    R: Send + Sync + 'static,
{
    /// One-off action from a closure
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce(&Scope<'_>) -> Result<R> + Send + 'static,
    {
        ActionTask {
            invocation: ActionInvocation {
                label: None,
                run: Box::new(move |scope: &Scope<'_>| f(scope).map(|r| Box::new(r) as Output)),
            },
            _marker: PhantomData,
        }
    }

    /// Attach a type tag used in logs
    pub fn with_type(mut self, label: &'static str) -> Self {
        self.invocation.label = Some(label);
        self
    }
}

impl<R> fmt::Debug for ActionTask<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.invocation, f)
    }
}

impl<R> Dispatchable for ActionTask<R>
where
    R: Send + Sync + 'static,
{
    type Output = R;

    fn into_task(self) -> Task {
        Task::Action(self.invocation)
    }

    fn extract(output: Output) -> Result<R> {
        output
            .downcast::<R>()
            .map(|r| *r)
            .map_err(|_| StoreError::mismatch::<R>("action result"))
    }
}

/// Named mutator declared on a box
pub struct Mutator<T, A> {
    target: StateBox<T>,
    name: &'static str,
    f: Arc<MutatorFn<T, A>>,
}

impl<T, A> Mutator<T, A>
where
    T: Send + Sync + 'static,
    A: Send + 'static,
{
    pub(crate) fn new(target: StateBox<T>, name: &'static str, f: Arc<MutatorFn<T, A>>) -> Self {
        Mutator { target, name, f }
    }

    /// Name of the mutator
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bind arguments, producing a dispatchable mutation
    pub fn call(&self, args: A) -> MutationTask<T> {
        let f = self.f.clone();
        MutationTask::new(self.target.clone(), self.name, move |state| f(state, args))
    }
}

impl<T, A> Clone for Mutator<T, A> {
    fn clone(&self) -> Self {
        Mutator {
            target: self.target.clone(),
            name: self.name,
            f: self.f.clone(),
        }
    }
}

impl<T, A> fmt::Debug for Mutator<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mutator({}.{})", self.target.info.key(), self.name)
    }
}

/// A mutator bound to its box and arguments
pub struct MutationTask<T> {
    invocation: MutationInvocation,
    _marker: PhantomData<fn() -> T>,
}

impl<T> MutationTask<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new<F>(target: StateBox<T>, mutator: &'static str, f: F) -> Self
    where
        F: FnOnce(&T) -> Result<T> + Send + 'static,
    {
        let info = target.info.clone();
        let key = info.key().to_string();
        MutationTask {
            invocation: MutationInvocation {
                target: info,
                mutator,
                apply: Box::new(move |current: &Value| {
                    let state = current
                        .downcast_ref::<T>()
                        .ok_or_else(|| StoreError::mismatch::<T>(key))?;
                    let next: Value = Arc::new(f(state)?);
                    Ok(next)
                }),
            },
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for MutationTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.invocation, f)
    }
}

impl<T> Dispatchable for MutationTask<T>
where
    T: Send + Sync + 'static,
{
    type Output = Arc<T>;

    fn into_task(self) -> Task {
        Task::Mutation(self.invocation)
    }

    fn extract(output: Output) -> Result<Arc<T>> {
        let value = output
            .downcast::<Value>()
            .map_err(|_| StoreError::mismatch::<T>("mutation result"))?;
        (*value)
            .downcast::<T>()
            .map_err(|_| StoreError::mismatch::<T>("mutation result"))
    }
}

/// Box-independent broadcast channel
pub struct SignalFactory<P> {
    name: &'static str,
    listeners: Arc<RwLock<Vec<SignalListener>>>,
    _marker: PhantomData<fn(P)>,
}

impl<P> SignalFactory<P>
where
    P: Send + Sync + 'static,
{
    /// Declare a signal
    pub fn new(name: &'static str) -> Self {
        SignalFactory {
            name,
            listeners: Arc::new(RwLock::new(Vec::new())),
            _marker: PhantomData,
        }
    }

    /// Name of the signal
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register a listener bound to a box
    ///
    /// Listeners run in registration order. They see the box value current at
    /// delivery time and may dispatch mutations through the scope.
    pub fn listen<T, F>(&self, target: &StateBox<T>, f: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Scope<'_>, &T, &P) -> Result<()> + Send + Sync + 'static,
    {
        let key = target.key().to_string();
        let signal = self.name;
        let notify = move |scope: &Scope<'_>,
                           value: &Value,
                           payload: &(dyn Any + Send + Sync + 'static)| {
            let state = value
                .downcast_ref::<T>()
                .ok_or_else(|| StoreError::mismatch::<T>(key.as_str()))?;
            let payload = payload
                .downcast_ref::<P>()
                .ok_or_else(|| StoreError::mismatch::<P>(signal))?;
            f(scope, state, payload)
        };
        self.listeners.write().push(SignalListener {
            target: target.info.clone(),
            notify: Arc::new(notify),
        });
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Produce a dispatchable emission of `payload`
    pub fn emit(&self, payload: P) -> SignalTask<P> {
        SignalTask {
            invocation: SignalInvocation {
                signal: self.name,
                listeners: self.listeners.clone(),
                payload: Box::new(payload),
            },
            _marker: PhantomData,
        }
    }
}

impl<P> Clone for SignalFactory<P> {
    fn clone(&self) -> Self {
        SignalFactory {
            name: self.name,
            listeners: self.listeners.clone(),
            _marker: PhantomData,
        }
    }
}

impl<P> fmt::Debug for SignalFactory<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalFactory")
            .field("name", &self.name)
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

/// A signal bound to its payload
pub struct SignalTask<P> {
    invocation: SignalInvocation,
    _marker: PhantomData<fn() -> P>,
}

impl<P> fmt::Debug for SignalTask<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.invocation, f)
    }
}

impl<P> Dispatchable for SignalTask<P>
where
    P: Send + Sync + 'static,
{
    type Output = P;

    fn into_task(self) -> Task {
        Task::Signal(self.invocation)
    }

    fn extract(output: Output) -> Result<P> {
        output
            .downcast::<P>()
            .map(|p| *p)
            .map_err(|_| StoreError::mismatch::<P>("signal payload"))
    }
}
