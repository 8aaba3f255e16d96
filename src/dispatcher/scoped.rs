//! Keyed dispatchers that live while they have registrations.
//!
//! `ScopedDispatchers::get(key)` returns a handle that resolves the scope on
//! every call. A scope enters the table with its first registration and
//! leaves it when the last registration is released, so dispatching to a key
//! nobody listens on reaches only the handle's initial handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Dispatchable, Dispatcher, Handler, LocalDispatcher, Registration, Result, TypeTag};

struct Scope {
    dispatcher: LocalDispatcher,
    refs: AtomicUsize,
}

impl Scope {
    fn new(handlers: &[Arc<dyn Handler>]) -> Arc<Self> {
        Arc::new(Self {
            dispatcher: LocalDispatcher::with_handlers(handlers.iter().cloned()),
            refs: AtomicUsize::new(0),
        })
    }
}

#[derive(Default)]
struct ScopeTable {
    scopes: Mutex<HashMap<String, Arc<Scope>>>,
}

impl ScopeTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Scope>>> {
        self.scopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Factory and registry of keyed dispatchers.
#[derive(Clone, Default)]
pub struct ScopedDispatchers {
    table: Arc<ScopeTable>,
}

impl ScopedDispatchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher bound to `key`.
    pub fn get(&self, key: impl Into<String>) -> ScopeHandle {
        self.get_with(key, Vec::new())
    }

    /// Dispatcher bound to `key`; `handlers` seed the scope if this handle creates it.
    pub fn get_with(&self, key: impl Into<String>, handlers: Vec<Arc<dyn Handler>>) -> ScopeHandle {
        ScopeHandle {
            key: key.into(),
            handlers,
            table: Arc::clone(&self.table),
        }
    }

    /// Keys with at least one live registration.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.table.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop every scope. Outstanding registrations release into nothing.
    pub fn clear(&self) {
        self.table.lock().clear();
    }
}

/// Deferred dispatcher for one key of a [`ScopedDispatchers`].
#[derive(Clone)]
pub struct ScopeHandle {
    key: String,
    handlers: Vec<Arc<dyn Handler>>,
    table: Arc<ScopeTable>,
}

impl ScopeHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Live scope for the key, or a detached one seeded with this handle's handlers.
    fn resolve(&self, scopes: &HashMap<String, Arc<Scope>>) -> Arc<Scope> {
        scopes
            .get(&self.key)
            .cloned()
            .unwrap_or_else(|| Scope::new(&self.handlers))
    }
}

#[async_trait]
impl Dispatcher for ScopeHandle {
    fn has_handler(&self, tag: TypeTag) -> bool {
        let scope = self.resolve(&self.table.lock());
        scope.dispatcher.has_handler(tag)
    }

    async fn dispatch(&self, value: Arc<dyn Dispatchable>, token: CancellationToken) -> Result<()> {
        let scope = self.resolve(&self.table.lock());
        scope.dispatcher.dispatch(value, token).await
    }

    fn register(&self, handler: Arc<dyn Handler>) -> Result<Registration> {
        let mut scopes = self.table.lock();
        let scope = self.resolve(&scopes);
        let inner = scope.dispatcher.register(handler)?;

        if scope.refs.fetch_add(1, Ordering::AcqRel) == 0 {
            debug!(key = %self.key, "Scope opened");
            scopes.insert(self.key.clone(), Arc::clone(&scope));
        }
        drop(scopes);

        let table: Weak<ScopeTable> = Arc::downgrade(&self.table);
        let key = self.key.clone();
        Ok(Registration::new(move || {
            drop(inner);
            let Some(table) = table.upgrade() else {
                return;
            };
            let mut scopes = table.lock();
            if scope.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                let current = scopes.get(&key).is_some_and(|s| Arc::ptr_eq(s, &scope));
                if current {
                    scopes.remove(&key);
                    debug!(key = %key, "Scope closed");
                }
            }
        }))
    }
}

impl std::fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeHandle").field("key", &self.key).finish()
    }
}
