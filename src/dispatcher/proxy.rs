//! Late-bound dispatcher.
//!
//! Handlers that dispatch further values need a dispatcher at construction,
//! but the dispatcher needs the handlers. Build a `ProxyDispatcher` first,
//! hand it to the handlers, then `connect` it to the real dispatcher. Or
//! pass `from_provider` a function that builds the target on first use.

use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{DispatchError, Dispatchable, Dispatcher, Handler, Registration, Result, TypeTag};

type Provider = Box<dyn FnOnce() -> Arc<dyn Dispatcher> + Send>;

/// Forwards every call to a target connected after construction.
#[derive(Clone, Default)]
pub struct ProxyDispatcher {
    inner: Arc<ProxyInner>,
}

#[derive(Default)]
struct ProxyInner {
    target: OnceLock<Arc<dyn Dispatcher>>,
    provider: Mutex<Option<Provider>>,
}

impl ProxyDispatcher {
    /// Unconnected proxy. Calls fail with `NotConnected` until `connect`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Proxy whose target is built by `provider` on first use.
    ///
    /// `provider` runs at most once, outside any lock. Calls it makes back into
    /// this proxy see it unconnected.
    pub fn from_provider<F>(provider: F) -> Self
    where
        F: FnOnce() -> Arc<dyn Dispatcher> + Send + 'static,
    {
        let proxy = Self::new();
        *proxy.provider() = Some(Box::new(provider));
        proxy
    }

    /// Bind the target. Returns false if the proxy was already connected.
    pub fn connect(&self, target: Arc<dyn Dispatcher>) -> bool {
        let connected = self.inner.target.set(target).is_ok();
        if !connected {
            warn!("Proxy dispatcher already connected; ignoring new target");
        }
        connected
    }

    pub fn is_connected(&self) -> bool {
        self.inner.target.get().is_some()
    }

    fn provider(&self) -> std::sync::MutexGuard<'_, Option<Provider>> {
        self.inner
            .provider
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn target(&self) -> Result<Arc<dyn Dispatcher>> {
        if let Some(target) = self.inner.target.get() {
            return Ok(Arc::clone(target));
        }
        let build = self.provider().take();
        if let Some(build) = build {
            let _ = self.inner.target.set(build());
        }
        self.inner
            .target
            .get()
            .cloned()
            .ok_or(DispatchError::NotConnected)
    }
}

#[async_trait]
impl Dispatcher for ProxyDispatcher {
    fn has_handler(&self, tag: TypeTag) -> bool {
        self.target().is_ok_and(|target| target.has_handler(tag))
    }

    async fn dispatch(&self, value: Arc<dyn Dispatchable>, token: CancellationToken) -> Result<()> {
        self.target()?.dispatch(value, token).await
    }

    async fn dispatch_all(
        &self,
        values: Vec<Arc<dyn Dispatchable>>,
        token: CancellationToken,
    ) -> Result<()> {
        self.target()?.dispatch_all(values, token).await
    }

    fn register(&self, handler: Arc<dyn Handler>) -> Result<Registration> {
        self.target()?.register(handler)
    }
}

impl std::fmt::Debug for ProxyDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyDispatcher")
            .field("connected", &self.is_connected())
            .finish()
    }
}
