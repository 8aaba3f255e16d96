//! Handler that buffers dispatched values for a consumer to read as a stream.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{Dispatchable, Handler, TypeTag};
use crate::messenger::{BoxError, HandlerResult};

/// Buffers every dispatched `T` into an unbounded channel.
///
/// Register it like any handler, then read the values with
/// [`BufferedReceiver::observe`]. The stream ends after [`BufferedReceiver::stop`]
/// once the buffered values are drained.
pub struct BufferedReceiver<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<Arc<T>>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Arc<T>>>>,
    _value: PhantomData<fn(Arc<T>)>,
}

impl<T: Dispatchable> BufferedReceiver<T> {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            _value: PhantomData,
        })
    }

    /// Take the stream of buffered values. Only the first call gets it.
    pub fn observe(&self) -> Option<UnboundedReceiverStream<Arc<T>>> {
        lock(&self.receiver).take().map(UnboundedReceiverStream::new)
    }

    /// Stop buffering. Returns false if already stopped.
    pub fn stop(&self) -> bool {
        lock(&self.sender).take().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.sender).is_none()
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Dispatchable> Handler for BufferedReceiver<T> {
    fn type_tag(&self) -> TypeTag {
        TypeTag::of::<T>()
    }

    fn handle(
        &self,
        value: Arc<dyn Dispatchable>,
        _token: CancellationToken,
    ) -> BoxFuture<'static, HandlerResult> {
        let result = match value.into_any_arc().downcast::<T>() {
            Ok(value) => {
                // Values arriving after stop, or after the stream was dropped, are discarded.
                if let Some(sender) = lock(&self.sender).as_ref() {
                    let _ = sender.send(value);
                }
                Ok(())
            }
            Err(_) => Err(BoxError::from(format!(
                "buffered receiver for {} received another type",
                TypeTag::of::<T>()
            ))),
        };
        Box::pin(async move { result })
    }
}
