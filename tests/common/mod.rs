//! Shared helpers for messenger integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use messenger::messenger::{handler_fn, BoxError, MessageHandler};
use messenger::Message;
use tokio_util::sync::CancellationToken;

pub type Received = Arc<Mutex<Vec<Message>>>;

/// Handler that records every message, failing those `fails` selects.
pub fn recording_handler<F>(fails: F) -> (Arc<dyn MessageHandler>, Received)
where
    F: Fn(&Message) -> bool + Send + Sync + 'static,
{
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let handler = handler_fn(move |message: Message, _token: CancellationToken| {
        let failed = fails(&message);
        sink.lock().unwrap().push(message);
        async move {
            if failed {
                return Err(BoxError::from("rejected by test handler"));
            }
            Ok::<(), BoxError>(())
        }
    });
    (handler, received)
}

/// Handler that records every message and always succeeds.
pub fn collecting_handler() -> (Arc<dyn MessageHandler>, Received) {
    recording_handler(|_| false)
}

/// Poll `condition` until it holds, panicking after `limit`.
pub async fn wait_until<F>(limit: Duration, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", limit);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_count(received: &Received, count: usize) {
    wait_until(Duration::from_secs(5), || received.lock().unwrap().len() >= count).await;
}

pub fn payloads(received: &Received) -> Vec<String> {
    received
        .lock()
        .unwrap()
        .iter()
        .map(|m| m.payload().to_string())
        .collect()
}
