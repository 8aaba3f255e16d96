//! Multi-backend publish/subscribe messenger.
//!
//! This module contains:
//! - `Messenger` trait: topic-bound factory for producers and consumers
//! - `Producer` / `Consumer` traits: publish one message, subscribe a handler
//! - `Message` envelope and trace context propagation
//! - Implementations: Local (in-process channels), Kafka, Event Hub, storage queue

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{MessengerConfig, MessengerType};
use crate::utils::metrics::{
    backend_attr, outcome_attr, topic_attr, PUBLISH_DURATION, PUBLISH_TOTAL,
};

pub mod batch;
pub mod consumer;
pub mod eventhub;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod local;
pub mod message;
pub mod propagation;
pub mod queue;

pub use consumer::{
    handler_fn, FailurePolicy, MessageHandler, Receiver, Subscription, SubscriptionState,
};
pub use eventhub::{EventHubConnector, HubMessenger, InMemoryEventHubs};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaMessenger, KafkaMessengerConfig};
pub use local::LocalMessenger;
pub use message::{Message, Properties};
pub use propagation::TracePropagator;
pub use queue::{InMemoryQueue, QueueClient, ReceiveOptions, StorageQueue};

// ============================================================================
// Errors
// ============================================================================

/// Result type for messenger operations.
pub type Result<T> = std::result::Result<T, MessengerError>;

/// Boxed error returned by subscription handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a subscription handler.
pub type HandlerResult = std::result::Result<(), BoxError>;

/// Errors that can occur during messenger operations.
#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Messenger is closed")]
    Closed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MessengerError {
    /// True when a handler error signals cooperative shutdown.
    pub fn is_cancellation(error: &BoxError) -> bool {
        matches!(
            error.downcast_ref::<MessengerError>(),
            Some(MessengerError::Cancelled)
        )
    }
}

// ============================================================================
// Client properties
// ============================================================================

/// Per-call client settings passed to `produce` / `consume`.
pub type ClientProperties = HashMap<String, String>;

/// Consumer group property key.
pub const GROUP_ID: &str = "groupID";
/// Starting position property key (`earliest` or `latest`).
pub const AUTO_OFFSET_RESET: &str = "auto.offset.reset";

/// Where a consumer without a committed position starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
}

impl OffsetReset {
    /// Parse the `auto.offset.reset` property. Anything but `earliest` is latest.
    pub fn from_properties(properties: Option<&ClientProperties>) -> Self {
        properties
            .and_then(|p| p.get(AUTO_OFFSET_RESET))
            .map(|value| Self::parse(value))
            .unwrap_or_default()
    }

    /// Parse a setting value. Anything but `earliest` is latest.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("earliest") {
            OffsetReset::Earliest
        } else {
            OffsetReset::Latest
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// Backend identifier used in spans, metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Local,
    Kafka,
    EventHub,
    StorageQueue,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Local => "local",
            Backend::Kafka => "kafka",
            Backend::EventHub => "eventhub",
            Backend::StorageQueue => "storage_queue",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Publishes messages to one topic.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Topic this producer is bound to (lower-cased).
    fn topic(&self) -> &str;

    /// Publish one message.
    ///
    /// Returns once the backend has accepted the message. Dropping the
    /// returned future abandons the publish. Backend errors are returned
    /// as-is; nothing is retried at this layer.
    async fn publish(&self, message: Message) -> Result<()>;

    /// Publish several messages, in order.
    async fn publish_batch(&self, messages: Vec<Message>) -> Result<()> {
        for message in messages {
            self.publish(message).await?;
        }
        Ok(())
    }
}

/// Subscribes handlers to one topic.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Topic this consumer is bound to (lower-cased).
    fn topic(&self) -> &str;

    /// Start a receive loop whose token is a child of `parent`.
    ///
    /// Cancelling `parent` or shutting down the returned handle stops the loop.
    async fn subscribe_until(
        &self,
        handler: Arc<dyn MessageHandler>,
        parent: &CancellationToken,
    ) -> Result<Subscription>;

    /// Start a receive loop with its own cancellation token.
    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<Subscription> {
        self.subscribe_until(handler, &CancellationToken::new())
            .await
    }
}

/// Topic-bound factory for producers and consumers over one backend connection.
///
/// Implementations:
/// - `LocalMessenger`: in-process channels
/// - `KafkaMessenger`: Kafka via rdkafka (feature `kafka`)
/// - `HubMessenger`: Event Hubs via an `EventHubConnector`
#[async_trait]
pub trait Messenger: Send + Sync {
    fn backend(&self) -> Backend;

    /// Declared topics, lower-cased.
    fn topics(&self) -> &[String];

    /// Producer bound to `topic` (case-insensitive).
    fn produce(
        &self,
        topic: &str,
        properties: Option<&ClientProperties>,
    ) -> Result<Arc<dyn Producer>>;

    /// Consumer bound to `topic` (case-insensitive).
    fn consume(
        &self,
        topic: &str,
        properties: Option<&ClientProperties>,
    ) -> Result<Arc<dyn Consumer>>;

    /// Flush and release all backend clients. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Shared plumbing
// ============================================================================

/// Topic name to backend client lookup, built once and read-only afterwards.
///
/// Names are lower-cased, so names differing only in case share one entry.
#[derive(Debug)]
pub struct TopicMap<T> {
    names: Vec<String>,
    entries: HashMap<String, T>,
}

impl<T> TopicMap<T> {
    /// Build the map, creating one entry per distinct lower-cased topic.
    pub fn build<I, S, F>(topics: I, mut make: F) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnMut(&str) -> Result<T>,
    {
        let mut names = Vec::new();
        let mut entries = HashMap::new();
        for topic in topics {
            let name = normalize_topic(topic.as_ref());
            if entries.contains_key(&name) {
                continue;
            }
            entries.insert(name.clone(), make(&name)?);
            names.push(name);
        }
        Ok(Self { names, entries })
    }

    /// Look up a topic case-insensitively.
    pub fn get(&self, topic: &str) -> Result<&T> {
        self.entries
            .get(&normalize_topic(topic))
            .ok_or_else(|| MessengerError::UnknownTopic(topic.to_string()))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }
}

/// Lower-case a topic name for lookup.
pub fn normalize_topic(topic: &str) -> String {
    topic.trim().to_lowercase()
}

/// One-shot close flag shared by a messenger and its producers.
#[derive(Debug, Default)]
pub struct CloseFlag(AtomicBool);

impl CloseFlag {
    /// Mark closed. Returns true only for the first caller.
    pub fn close(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(MessengerError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Span for one publish call.
pub(crate) fn publish_span(backend: Backend, topic: &str, key: Option<&str>) -> tracing::Span {
    let span = tracing::info_span!(
        "messenger.publish",
        messaging.system = backend.as_str(),
        messaging.destination = %topic,
        message.key = tracing::field::Empty,
        otel.kind = "producer",
        otel.status_code = tracing::field::Empty,
    );
    if let Some(key) = key {
        span.record("message.key", key);
    }
    span
}

/// Record publish metrics and mark the span on failure.
pub(crate) fn record_publish<T>(
    span: &tracing::Span,
    backend: Backend,
    topic: &str,
    started: Instant,
    result: &Result<T>,
) {
    let outcome = if result.is_ok() { "ok" } else { "error" };
    if result.is_err() {
        span.record("otel.status_code", "ERROR");
    }
    let attrs = [
        backend_attr(backend.as_str()),
        topic_attr(topic),
        outcome_attr(outcome),
    ];
    PUBLISH_TOTAL.add(1, &attrs);
    PUBLISH_DURATION.record(started.elapsed().as_secs_f64(), &attrs);
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a messenger based on configuration.
///
/// Returns the implementation selected by `messenger_type`:
/// - Local: always available
/// - Kafka: requires `--features kafka`
/// - Event Hub: requires a `connector` wrapping the Event Hubs client
pub async fn init_messenger(
    config: &MessengerConfig,
    connector: Option<Arc<dyn EventHubConnector>>,
) -> Result<Arc<dyn Messenger>> {
    match config.messenger_type {
        MessengerType::Local => {
            let messenger = match config.local.capacity {
                Some(capacity) => LocalMessenger::with_capacity(&config.topics, capacity)?,
                None => LocalMessenger::new(&config.topics)?,
            };
            info!(messenger_type = "local", topics = ?config.topics, "Messenger initialized");
            Ok(Arc::new(messenger))
        }
        MessengerType::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let mut kafka_config = KafkaMessengerConfig::from(&config.kafka);
                for (key, value) in &config.properties {
                    kafka_config
                        .properties
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
                let messenger = KafkaMessenger::new(kafka_config, &config.topics)?;
                info!(messenger_type = "kafka", topics = ?config.topics, "Messenger initialized");
                Ok(Arc::new(messenger))
            }

            #[cfg(not(feature = "kafka"))]
            {
                Err(MessengerError::Config(
                    "Kafka support requires the 'kafka' feature. Rebuild with --features kafka"
                        .to_string(),
                ))
            }
        }
        MessengerType::EventHub => {
            let connector = connector.ok_or_else(|| {
                MessengerError::Config(
                    "Event Hub messenger requires an EventHubConnector".to_string(),
                )
            })?;
            let mut hub_config = config.eventhub.clone();
            for (key, value) in &config.properties {
                hub_config
                    .properties
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
            let messenger = HubMessenger::connect(hub_config, &config.topics, connector).await?;
            info!(messenger_type = "eventhub", topics = ?config.topics, "Messenger initialized");
            Ok(Arc::new(messenger))
        }
    }
}
