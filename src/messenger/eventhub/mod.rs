//! Event Hubs messenger.
//!
//! One sender per declared hub, created at connect time and shared by every
//! producer of that topic. Each subscription gets its own processor client
//! in the configured consumer group, checkpointing after every message.
//!
//! Failed handlers are suppressed and checkpointed: the handler is expected
//! to own its retries, and a poison message must not stall a partition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backon::Retryable;
use bytes::Bytes;
use opentelemetry::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::batch::pack;
use super::consumer::{spawn_loops, LoopConfig};
use super::{
    publish_span, record_publish, Backend, ClientProperties, CloseFlag, Consumer,
    FailurePolicy, Message, MessageHandler, Messenger, MessengerError, OffsetReset, Producer,
    Receiver, Result, Subscription, TopicMap, TracePropagator, GROUP_ID,
};
use crate::config::EventHubConfig;
use crate::utils::retry::connection_backoff;

pub mod client;
pub mod memory;

pub use client::{
    CheckpointStore, EventData, EventHubConnector, EventHubSender, EventProcessorClient,
    ReceivedEvent, StartPosition,
};
pub use memory::{InMemoryCheckpointStore, InMemoryEventHubs};

/// Consumer group used when `groupID` is not set.
pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

struct Shared {
    closed: CloseFlag,
    propagator: TracePropagator,
}

/// Messenger over Event Hubs.
pub struct HubMessenger {
    senders: TopicMap<Arc<dyn EventHubSender>>,
    connector: Arc<dyn EventHubConnector>,
    properties: ClientProperties,
    shared: Arc<Shared>,
    policy: FailurePolicy,
}

impl HubMessenger {
    /// Create one sender per topic through `connector`.
    ///
    /// `config.properties` are the defaults merged under per-call properties;
    /// `config.consumer_group` is used when neither sets `groupID`.
    pub async fn connect<S: AsRef<str>>(
        config: EventHubConfig,
        topics: &[S],
        connector: Arc<dyn EventHubConnector>,
    ) -> Result<Self> {
        let mut created = HashMap::new();
        for topic in topics {
            let name = super::normalize_topic(topic.as_ref());
            if created.contains_key(&name) {
                continue;
            }
            let sender = (|| connector.sender(&name))
                .retry(connection_backoff())
                .when(|e| matches!(e, MessengerError::Connection(_)))
                .notify(|err: &MessengerError, dur: Duration| {
                    warn!(hub = %name, error = %err, delay = ?dur, "Sender connection failed, retrying");
                })
                .await?;
            created.insert(name, sender);
        }
        let senders = TopicMap::build(topics, |name| {
            created
                .remove(name)
                .ok_or_else(|| MessengerError::UnknownTopic(name.to_string()))
        })?;

        let mut properties = config.properties.clone();
        if let Some(group) = &config.consumer_group {
            properties
                .entry(GROUP_ID.to_string())
                .or_insert_with(|| group.clone());
        }

        info!(
            endpoint = config.endpoint().unwrap_or("<unset>"),
            checkpoint_container = %config.blob_container_name,
            topics = ?senders.names(),
            "Event Hub messenger connected"
        );

        Ok(Self {
            senders,
            connector,
            properties,
            shared: Arc::new(Shared {
                closed: CloseFlag::default(),
                propagator: TracePropagator::new(),
            }),
            policy: FailurePolicy::SuppressAndAck,
        })
    }

    /// Replace the failure policy applied by consumers created afterwards.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn merged_properties(&self, properties: Option<&ClientProperties>) -> ClientProperties {
        let mut merged = self.properties.clone();
        if let Some(properties) = properties {
            merged.extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }
}

#[async_trait]
impl Messenger for HubMessenger {
    fn backend(&self) -> Backend {
        Backend::EventHub
    }

    fn topics(&self) -> &[String] {
        self.senders.names()
    }

    fn produce(
        &self,
        topic: &str,
        _properties: Option<&ClientProperties>,
    ) -> Result<Arc<dyn Producer>> {
        self.shared.closed.ensure_open()?;
        let sender = Arc::clone(self.senders.get(topic)?);
        Ok(Arc::new(HubProducer {
            topic: super::normalize_topic(topic),
            sender,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn consume(
        &self,
        topic: &str,
        properties: Option<&ClientProperties>,
    ) -> Result<Arc<dyn Consumer>> {
        self.shared.closed.ensure_open()?;
        self.senders.get(topic)?;
        let topic = super::normalize_topic(topic);
        let properties = self.merged_properties(properties);
        let consumer_group = properties
            .get(GROUP_ID)
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string());
        let start = match OffsetReset::from_properties(Some(&properties)) {
            OffsetReset::Earliest => StartPosition::Earliest,
            OffsetReset::Latest => StartPosition::Latest,
        };

        Ok(Arc::new(HubConsumer {
            topic,
            consumer_group,
            start,
            connector: Arc::clone(&self.connector),
            shared: Arc::clone(&self.shared),
            policy: self.policy,
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.shared.closed.close() {
            return Ok(());
        }
        for sender in self.senders.values() {
            if let Err(e) = sender.close().await {
                warn!(event_hub = %sender.event_hub_name(), error = %e, "Failed to close sender");
            }
        }
        info!("Event Hub messenger closed");
        Ok(())
    }
}

// ============================================================================
// Producer
// ============================================================================

struct HubProducer {
    topic: String,
    sender: Arc<dyn EventHubSender>,
    shared: Arc<Shared>,
}

impl HubProducer {
    /// Inject the current trace context and map the message onto event data.
    fn to_event(&self, message: Message) -> EventData {
        let (payload, key, _timestamp, mut properties) = message.into_parts();
        self.shared.propagator.prepare_current(&mut properties);
        EventData {
            body: Bytes::from(payload),
            partition_key: key,
            properties,
        }
    }
}

#[async_trait]
impl Producer for HubProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, message: Message) -> Result<()> {
        self.shared.closed.ensure_open()?;

        let span = publish_span(Backend::EventHub, &self.topic, message.key());
        let started = Instant::now();

        let result = async {
            let event = self.to_event(message);
            self.sender.send(vec![event]).await
        }
        .instrument(span.clone())
        .await;

        record_publish(&span, Backend::EventHub, &self.topic, started, &result);
        result
    }

    async fn publish_batch(&self, messages: Vec<Message>) -> Result<()> {
        self.shared.closed.ensure_open()?;

        let span = publish_span(Backend::EventHub, &self.topic, None);
        let started = Instant::now();

        let result = async {
            for batch in pack(messages, self.sender.max_batch_bytes()) {
                debug!(count = batch.len(), bytes = batch.size_bytes(), "Sending event batch");
                let events = batch
                    .into_messages()
                    .into_iter()
                    .map(|m| self.to_event(m))
                    .collect();
                self.sender.send(events).await?;
            }
            Ok(())
        }
        .instrument(span.clone())
        .await;

        record_publish(&span, Backend::EventHub, &self.topic, started, &result);
        result
    }
}

// ============================================================================
// Consumer
// ============================================================================

struct HubConsumer {
    topic: String,
    consumer_group: String,
    start: StartPosition,
    connector: Arc<dyn EventHubConnector>,
    shared: Arc<Shared>,
    policy: FailurePolicy,
}

#[async_trait]
impl Consumer for HubConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn subscribe_until(
        &self,
        handler: Arc<dyn MessageHandler>,
        parent: &CancellationToken,
    ) -> Result<Subscription> {
        self.shared.closed.ensure_open()?;

        let mut processor = self
            .connector
            .processor(&self.topic, &self.consumer_group)
            .await?;
        processor.start(self.start).await?;

        debug!(
            topic = %self.topic,
            consumer_group = %self.consumer_group,
            start = ?self.start,
            "Subscribed to event hub"
        );

        let receiver = HubReceiver {
            topic: self.topic.clone(),
            processor,
            shared: Arc::clone(&self.shared),
        };
        let config = LoopConfig {
            backend: Backend::EventHub,
            topic: self.topic.clone(),
            policy: self.policy,
            handler,
        };
        Ok(spawn_loops(config, vec![receiver], parent))
    }
}

struct HubReceiver {
    topic: String,
    processor: Box<dyn EventProcessorClient>,
    shared: Arc<Shared>,
}

#[async_trait]
impl Receiver for HubReceiver {
    type Delivery = ReceivedEvent;
    type Item = Message;

    async fn receive(&mut self) -> Result<Option<ReceivedEvent>> {
        self.processor.next_event().await
    }

    fn decode(&self, event: &ReceivedEvent) -> Result<Message> {
        let payload = std::str::from_utf8(&event.data.body).map_err(|e| {
            MessengerError::Decode(format!(
                "partition {} sequence {}: {}",
                event.partition_id, event.sequence_number, e
            ))
        })?;
        let mut message = Message::new(payload)
            .with_timestamp(event.enqueued_time)
            .with_properties(event.data.properties.clone());
        if let Some(key) = &event.data.partition_key {
            message = message.with_key(key.clone());
        }
        Ok(message)
    }

    fn key<'a>(&self, event: &'a ReceivedEvent) -> Option<&'a str> {
        event.data.partition_key.as_deref()
    }

    fn parent_context(&self, event: &ReceivedEvent) -> Context {
        self.shared.propagator.resume(&event.data.properties)
    }

    async fn ack(&mut self, event: ReceivedEvent) -> Result<()> {
        self.processor.update_checkpoint(&event).await
    }

    /// Skip the checkpoint; the event is read again once the partition is
    /// reprocessed from its last checkpoint.
    async fn requeue(&mut self, event: ReceivedEvent, _delay: Duration) -> Result<()> {
        debug!(
            topic = %self.topic,
            partition = %event.partition_id,
            sequence = event.sequence_number,
            "Leaving event un-checkpointed"
        );
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.processor.stop().await {
            warn!(topic = %self.topic, error = %e, "Failed to stop event processor");
        }
    }
}

#[cfg(test)]
mod tests;
