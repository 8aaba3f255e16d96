//! In-process dispatch of values to handlers registered by type.
//!
//! This module contains:
//! - `Dispatcher` trait: register handlers, dispatch values to them
//! - `Handler` trait and typed adapters (`handler_for`, `handler_for_tag`)
//! - Implementations: `LocalDispatcher`, `ScopedDispatchers`,
//!   `MulticastDispatcher`, `ProxyDispatcher`
//! - `BufferedReceiver`: a handler that buffers values into a stream
//!
//! A value is routed by its [`TypeTag`] and by the tags it declares through
//! [`Dispatchable::supertypes`], so a handler registered for an interface tag
//! sees every value that declares it.

use std::any::{Any, TypeId};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use tokio_util::sync::CancellationToken;

use crate::messenger::{BoxError, HandlerResult};

pub mod local;
pub mod multicast;
pub mod proxy;
pub mod receiver;
pub mod scoped;

pub use local::LocalDispatcher;
pub use multicast::MulticastDispatcher;
pub use proxy::ProxyDispatcher;
pub use receiver::BufferedReceiver;
pub use scoped::{ScopeHandle, ScopedDispatchers};

// ============================================================================
// Errors
// ============================================================================

/// Result type for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors that can occur during dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Every matched handler ran; `failed` of them returned an error.
    #[error("{failed} handler(s) failed: {message}")]
    HandlerFailed { failed: usize, message: String },

    #[error("Register handler is not supported by this dispatcher")]
    RegistrationUnsupported,

    #[error("Dispatcher is not connected")]
    NotConnected,
}

impl DispatchError {
    /// Fold handler outcomes into one result. Reports the first failure.
    pub(crate) fn collect(results: impl IntoIterator<Item = HandlerResult>) -> Result<()> {
        let mut failed = 0;
        let mut first = None;
        for result in results {
            if let Err(e) = result {
                failed += 1;
                first.get_or_insert_with(|| e.to_string());
            }
        }
        match first {
            None => Ok(()),
            Some(message) => Err(DispatchError::HandlerFailed { failed, message }),
        }
    }

    /// Fold dispatcher outcomes into one result, summing handler failures.
    pub(crate) fn merge(results: impl IntoIterator<Item = Result<()>>) -> Result<()> {
        let mut failed = 0;
        let mut first = None;
        for result in results {
            match result {
                Ok(()) => {}
                Err(DispatchError::HandlerFailed { failed: n, message }) => {
                    failed += n;
                    first.get_or_insert(message);
                }
                Err(other) => return Err(other),
            }
        }
        match first {
            None => Ok(()),
            Some(message) => Err(DispatchError::HandlerFailed { failed, message }),
        }
    }
}

// ============================================================================
// Type tags
// ============================================================================

/// Runtime identity of a dispatched type or interface.
#[derive(Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    /// Tag of `T`. Works for trait objects, so `TypeTag::of::<dyn Event>()`
    /// names an interface.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl std::hash::Hash for TypeTag {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypeTag({})", self.name)
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// Upcasting helpers, implemented for every `'static` value.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Tag of the concrete type behind a trait object.
    fn concrete_tag(&self) -> TypeTag;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn concrete_tag(&self) -> TypeTag {
        TypeTag::of::<T>()
    }
}

/// A value that can be dispatched.
///
/// ```
/// use messenger::dispatcher::{Dispatchable, TypeTag};
///
/// trait OrderEvent {}
///
/// struct OrderPlaced;
/// impl OrderEvent for OrderPlaced {}
/// impl Dispatchable for OrderPlaced {
///     fn supertypes(&self) -> Vec<TypeTag> {
///         vec![TypeTag::of::<dyn OrderEvent>()]
///     }
/// }
/// ```
pub trait Dispatchable: AsAny {
    /// Interface or supertype tags this value is also routed under.
    fn supertypes(&self) -> Vec<TypeTag> {
        Vec::new()
    }
}

/// Every tag a value is routed under: its own first, then its declared supertypes.
pub fn assignable_tags(value: &dyn Dispatchable) -> Vec<TypeTag> {
    let own = value.concrete_tag();
    let mut tags = vec![own];
    for tag in value.supertypes() {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

// ============================================================================
// Handlers
// ============================================================================

/// Logic run on dispatched values of one type tag.
pub trait Handler: Send + Sync {
    fn type_tag(&self) -> TypeTag;

    fn handle(
        &self,
        value: Arc<dyn Dispatchable>,
        token: CancellationToken,
    ) -> BoxFuture<'static, HandlerResult>;
}

/// Pointer identity of a handler, used to deduplicate registrations.
pub(crate) fn same_handler(a: &Arc<dyn Handler>, b: &Arc<dyn Handler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

struct TypedHandler<T, F> {
    f: F,
    _value: PhantomData<fn(Arc<T>)>,
}

impl<T, F, Fut> Handler for TypedHandler<T, F>
where
    T: Dispatchable,
    F: Fn(Arc<T>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn type_tag(&self) -> TypeTag {
        TypeTag::of::<T>()
    }

    fn handle(
        &self,
        value: Arc<dyn Dispatchable>,
        token: CancellationToken,
    ) -> BoxFuture<'static, HandlerResult> {
        match value.into_any_arc().downcast::<T>() {
            Ok(value) => Box::pin((self.f)(value, token)),
            Err(_) => {
                let message = format!("handler for {} received another type", TypeTag::of::<T>());
                Box::pin(async move { Err(BoxError::from(message)) })
            }
        }
    }
}

/// Handler for values of concrete type `T`.
pub fn handler_for<T, F, Fut>(f: F) -> Arc<dyn Handler>
where
    T: Dispatchable,
    F: Fn(Arc<T>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(TypedHandler {
        f,
        _value: PhantomData,
    })
}

struct TaggedHandler<F> {
    tag: TypeTag,
    f: F,
}

impl<F, Fut> Handler for TaggedHandler<F>
where
    F: Fn(Arc<dyn Dispatchable>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn type_tag(&self) -> TypeTag {
        self.tag
    }

    fn handle(
        &self,
        value: Arc<dyn Dispatchable>,
        token: CancellationToken,
    ) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.f)(value, token))
    }
}

/// Handler for every value routed under `tag`, typically an interface tag.
pub fn handler_for_tag<F, Fut>(tag: TypeTag, f: F) -> Arc<dyn Handler>
where
    F: Fn(Arc<dyn Dispatchable>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(TaggedHandler { tag, f })
}

// ============================================================================
// Registration
// ============================================================================

/// Keeps a handler registered. Dropping it deregisters the handler.
#[must_use = "dropping a Registration deregisters the handler"]
pub struct Registration {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Registration {
    pub(crate) fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Deregister now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").finish_non_exhaustive()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Executes registered handlers on dispatched values.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// True when at least one handler is registered under `tag`.
    fn has_handler(&self, tag: TypeTag) -> bool;

    /// Run every handler matching `value` concurrently and wait for all of them.
    async fn dispatch(&self, value: Arc<dyn Dispatchable>, token: CancellationToken) -> Result<()>;

    /// Dispatch each value concurrently.
    async fn dispatch_all(
        &self,
        values: Vec<Arc<dyn Dispatchable>>,
        token: CancellationToken,
    ) -> Result<()> {
        let results = join_all(
            values
                .into_iter()
                .map(|value| self.dispatch(value, token.clone())),
        )
        .await;
        DispatchError::merge(results)
    }

    fn register(&self, handler: Arc<dyn Handler>) -> Result<Registration>;
}
