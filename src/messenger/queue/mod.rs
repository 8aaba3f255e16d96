//! Storage queue sender and polling receiver.
//!
//! Payloads are JSON documents. A subscription fans out into `concurrency`
//! independent loops, each polling, processing and deleting one message at a
//! time. Received messages stay invisible to other loops for the visibility
//! timeout, so each message is handled by one loop at a time.
//!
//! Failed handlers requeue their message: it becomes visible again after the
//! requeue delay and is retried by whichever loop picks it up next.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use super::consumer::{spawn_loops, LoopConfig};
use super::{
    publish_span, record_publish, Backend, FailurePolicy, MessageHandler, MessengerError,
    Receiver, Result, Subscription,
};

pub mod memory;

pub use memory::InMemoryQueue;

/// Message as returned by a receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    /// Proof of the current receive; required to delete or update the message.
    pub pop_receipt: String,
    pub text: String,
    pub dequeue_count: u32,
}

/// Queue client capabilities used by [`StorageQueue`].
#[async_trait]
pub trait QueueClient: Send + Sync {
    fn queue_name(&self) -> &str;

    /// Best-effort message count, including messages currently invisible.
    async fn approximate_message_count(&self) -> Result<usize>;

    async fn send_message(&self, text: String) -> Result<()>;

    /// Take the next visible message and hide it for `visibility_timeout`.
    async fn receive_message(&self, visibility_timeout: Duration) -> Result<Option<QueueMessage>>;

    async fn delete_message(&self, message_id: &str, pop_receipt: &str) -> Result<()>;

    /// Hide the message for `visibility_timeout` from now. Returns the new pop receipt.
    async fn update_visibility(
        &self,
        message_id: &str,
        pop_receipt: &str,
        visibility_timeout: Duration,
    ) -> Result<String>;
}

/// Receive loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Number of independent receive loops.
    pub concurrency: usize,
    /// How long a received message stays hidden from other loops.
    pub visibility_timeout: Duration,
    /// Pause before re-checking an empty queue.
    pub idle_interval: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            visibility_timeout: Duration::from_secs(60),
            idle_interval: Duration::from_secs(2),
            failure_policy: FailurePolicy::RequeueWithDelay(Duration::from_secs(60)),
        }
    }
}

impl ReceiveOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// JSON message queue over a [`QueueClient`].
#[derive(Clone)]
pub struct StorageQueue {
    client: Arc<dyn QueueClient>,
}

impl StorageQueue {
    pub fn new(client: Arc<dyn QueueClient>) -> Self {
        Self { client }
    }

    pub fn name(&self) -> &str {
        self.client.queue_name()
    }

    /// Serialize `contents` as JSON and enqueue it.
    pub async fn send<T: Serialize + ?Sized>(&self, contents: &T) -> Result<()> {
        let span = publish_span(Backend::StorageQueue, self.name(), None);
        let started = Instant::now();

        let result = async {
            let text = serde_json::to_string(contents)?;
            self.client.send_message(text).await
        }
        .instrument(span.clone())
        .await;

        record_publish(&span, Backend::StorageQueue, self.name(), started, &result);
        result
    }

    /// Enqueue each item in order, stopping at the first failure.
    pub async fn send_all<T, I>(&self, contents: I) -> Result<()>
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        for item in contents {
            self.send(&item).await?;
        }
        Ok(())
    }

    /// Start `options.concurrency` receive loops decoding payloads as `T`.
    pub async fn receive<T>(
        &self,
        handler: Arc<dyn MessageHandler<T>>,
        options: ReceiveOptions,
    ) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.receive_until(handler, options, &CancellationToken::new())
            .await
    }

    /// Like [`StorageQueue::receive`], stopping when `parent` is cancelled.
    pub async fn receive_until<T>(
        &self,
        handler: Arc<dyn MessageHandler<T>>,
        options: ReceiveOptions,
        parent: &CancellationToken,
    ) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let concurrency = options.concurrency.max(1);
        let receivers = (0..concurrency)
            .map(|_| QueueReceiver::<T> {
                client: Arc::clone(&self.client),
                visibility_timeout: options.visibility_timeout,
                idle_interval: options.idle_interval,
                _item: PhantomData,
            })
            .collect();
        let config = LoopConfig {
            backend: Backend::StorageQueue,
            topic: self.name().to_string(),
            policy: options.failure_policy,
            handler,
        };

        debug!(queue = %self.name(), concurrency, "Receiving from storage queue");
        Ok(spawn_loops(config, receivers, parent))
    }
}

struct QueueReceiver<T> {
    client: Arc<dyn QueueClient>,
    visibility_timeout: Duration,
    idle_interval: Duration,
    _item: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T> Receiver for QueueReceiver<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Delivery = QueueMessage;
    type Item = T;

    async fn receive(&mut self) -> Result<Option<QueueMessage>> {
        if self.client.approximate_message_count().await? == 0 {
            tokio::time::sleep(self.idle_interval).await;
            return Ok(None);
        }
        let message = self.client.receive_message(self.visibility_timeout).await?;
        if message.is_none() {
            // Counted messages are all invisible: held by another loop or requeued.
            tokio::time::sleep(self.idle_interval).await;
        }
        Ok(message)
    }

    fn decode(&self, message: &QueueMessage) -> Result<T> {
        serde_json::from_str(&message.text)
            .map_err(|e| MessengerError::Decode(format!("message {}: {}", message.message_id, e)))
    }

    fn key<'a>(&self, _message: &'a QueueMessage) -> Option<&'a str> {
        None
    }

    fn parent_context(&self, _message: &QueueMessage) -> Context {
        Context::new()
    }

    async fn ack(&mut self, message: QueueMessage) -> Result<()> {
        self.client
            .delete_message(&message.message_id, &message.pop_receipt)
            .await
    }

    async fn requeue(&mut self, message: QueueMessage, delay: Duration) -> Result<()> {
        self.client
            .update_visibility(&message.message_id, &message.pop_receipt, delay)
            .await
            .map(|_| ())
    }
}
