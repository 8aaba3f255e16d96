//! Test utilities: recording handlers and polling helpers.
//!
//! Enabled for unit tests and, through feature `test-utils`, for downstream
//! crates exercising their own handlers against the in-memory backends.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::messenger::{handler_fn, BoxError, Message, MessageHandler};

/// Shared list of messages seen by a handler.
pub type Received = Arc<Mutex<Vec<Message>>>;

/// Handler that records every message it receives.
pub fn collecting_handler() -> (Arc<dyn MessageHandler>, Received) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let handler = handler_fn(move |message: Message, _token: CancellationToken| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock()
                .map_err(|_| BoxError::from("poisoned"))?
                .push(message);
            Ok::<(), BoxError>(())
        }
    });
    (handler, received)
}

/// Handler that records every message and fails those whose payload matches.
pub fn failing_handler<F>(fails: F) -> (Arc<dyn MessageHandler>, Received)
where
    F: Fn(&Message) -> bool + Send + Sync + 'static,
{
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let handler = handler_fn(move |message: Message, _token: CancellationToken| {
        let failed = fails(&message);
        let sink = Arc::clone(&sink);
        async move {
            sink.lock()
                .map_err(|_| BoxError::from("poisoned"))?
                .push(message);
            if failed {
                return Err(BoxError::from("handler rejected message"));
            }
            Ok::<(), BoxError>(())
        }
    });
    (handler, received)
}

/// Poll `condition` every 10ms until it holds, panicking after 5s.
pub async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `received` holds at least `count` messages.
pub async fn wait_for_count(received: &Received, count: usize) {
    wait_until(|| received.lock().map(|r| r.len() >= count).unwrap_or(false)).await;
}

/// Payloads of the received messages, in arrival order.
pub fn payloads(received: &Received) -> Vec<String> {
    received
        .lock()
        .map(|r| r.iter().map(|m| m.payload().to_string()).collect())
        .unwrap_or_default()
}
