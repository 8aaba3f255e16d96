//! Fan-out over several dispatchers.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::{DispatchError, Dispatchable, Dispatcher, Handler, Registration, Result, TypeTag};

/// Dispatches every value to all inner dispatchers concurrently.
///
/// Handlers are registered on the inner dispatchers; registering here fails.
#[derive(Clone)]
pub struct MulticastDispatcher {
    dispatchers: Vec<Arc<dyn Dispatcher>>,
}

impl MulticastDispatcher {
    pub fn new(dispatchers: Vec<Arc<dyn Dispatcher>>) -> Self {
        Self { dispatchers }
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }
}

#[async_trait]
impl Dispatcher for MulticastDispatcher {
    fn has_handler(&self, tag: TypeTag) -> bool {
        self.dispatchers.iter().any(|d| d.has_handler(tag))
    }

    async fn dispatch(&self, value: Arc<dyn Dispatchable>, token: CancellationToken) -> Result<()> {
        let results = join_all(
            self.dispatchers
                .iter()
                .map(|d| d.dispatch(Arc::clone(&value), token.clone())),
        )
        .await;
        DispatchError::merge(results)
    }

    async fn dispatch_all(
        &self,
        values: Vec<Arc<dyn Dispatchable>>,
        token: CancellationToken,
    ) -> Result<()> {
        let token = &token;
        let results = join_all(values.iter().flat_map(|value| {
            self.dispatchers
                .iter()
                .map(move |d| d.dispatch(Arc::clone(value), token.clone()))
        }))
        .await;
        DispatchError::merge(results)
    }

    fn register(&self, _handler: Arc<dyn Handler>) -> Result<Registration> {
        Err(DispatchError::RegistrationUnsupported)
    }
}
