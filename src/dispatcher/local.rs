//! Dispatcher over an in-process handler registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use super::{
    assignable_tags, same_handler, DispatchError, Dispatchable, Dispatcher, Handler,
    Registration, Result, TypeTag,
};

#[derive(Default)]
struct Registry {
    handlers: Mutex<HashMap<TypeTag, Vec<Arc<dyn Handler>>>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<TypeTag, Vec<Arc<dyn Handler>>>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, handler: Arc<dyn Handler>) {
        let mut handlers = self.lock();
        let list = handlers.entry(handler.type_tag()).or_default();
        if !list.iter().any(|h| same_handler(h, &handler)) {
            list.push(handler);
        }
    }

    fn remove(&self, handler: &Arc<dyn Handler>) {
        let mut handlers = self.lock();
        let tag = handler.type_tag();
        if let Some(list) = handlers.get_mut(&tag) {
            list.retain(|h| !same_handler(h, handler));
            if list.is_empty() {
                handlers.remove(&tag);
            }
        }
    }

    /// Point-in-time copy of the handlers matching any of `tags`.
    fn snapshot(&self, tags: &[TypeTag]) -> Vec<Arc<dyn Handler>> {
        let handlers = self.lock();
        tags.iter()
            .filter_map(|tag| handlers.get(tag))
            .flat_map(|list| list.iter().cloned())
            .collect()
    }
}

/// Dispatches values to handlers registered in this process.
///
/// Registration is safe during dispatch: each dispatch runs against a
/// snapshot of the registry taken when it starts.
#[derive(Clone, Default)]
pub struct LocalDispatcher {
    registry: Arc<Registry>,
}

impl LocalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with an initial set of handlers, registered permanently.
    pub fn with_handlers(handlers: impl IntoIterator<Item = Arc<dyn Handler>>) -> Self {
        let dispatcher = Self::default();
        for handler in handlers {
            dispatcher.registry.add(handler);
        }
        dispatcher
    }

    /// Number of handlers registered under exactly `tag`.
    pub fn handler_count(&self, tag: TypeTag) -> usize {
        self.registry.lock().get(&tag).map_or(0, Vec::len)
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    fn has_handler(&self, tag: TypeTag) -> bool {
        !self.registry.snapshot(&[tag]).is_empty()
    }

    async fn dispatch(&self, value: Arc<dyn Dispatchable>, token: CancellationToken) -> Result<()> {
        let tags = assignable_tags(&*value);
        let type_name = tags[0].name();
        let handlers = self.registry.snapshot(&tags);
        if handlers.is_empty() {
            debug!(value_type = type_name, "No handler for dispatched value");
            return Ok(());
        }

        let span = tracing::debug_span!("dispatch", value_type = type_name, handlers = handlers.len());
        let results = join_all(
            handlers
                .iter()
                .map(|handler| handler.handle(Arc::clone(&value), token.clone())),
        )
        .instrument(span)
        .await;

        DispatchError::collect(results)
    }

    fn register(&self, handler: Arc<dyn Handler>) -> Result<Registration> {
        self.registry.add(Arc::clone(&handler));
        let registry: Weak<Registry> = Arc::downgrade(&self.registry);
        Ok(Registration::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&handler);
            }
        }))
    }
}

impl std::fmt::Debug for LocalDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.registry.lock();
        f.debug_struct("LocalDispatcher")
            .field("types", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
