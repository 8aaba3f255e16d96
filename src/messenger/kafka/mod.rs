//! Kafka messenger.
//!
//! One `FutureProducer` per messenger, shared by every topic. Each
//! subscription creates its own `StreamConsumer` in the configured consumer
//! group and commits manually after every message.
//!
//! Message properties travel as headers, each value JSON-encoded. Headers
//! written by other clients that are not valid JSON are read back as strings.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use opentelemetry::Context;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{CommitMode, Consumer as _, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers, Message as KafkaMessage, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::batch::pack;
use super::consumer::{spawn_loops, LoopConfig};
use super::{
    publish_span, record_publish, Backend, ClientProperties, CloseFlag, Consumer,
    FailurePolicy, Message, MessageHandler, Messenger, MessengerError, OffsetReset, Producer,
    Properties, Receiver, Result, Subscription, TopicMap, TracePropagator, GROUP_ID,
};
use crate::config::KafkaConfig;

/// Default upper bound for one `publish_batch` round.
pub const DEFAULT_BATCH_BYTES: usize = 1024 * 1024;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for Kafka connection.
#[derive(Clone, Debug)]
pub struct KafkaMessengerConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Consumer group ID. A `groupID` client property overrides it per consumer.
    pub group_id: Option<String>,
    /// Client ID reported to the brokers.
    pub client_id: Option<String>,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
    /// Where a group without committed offsets starts reading.
    pub auto_offset_reset: OffsetReset,
    /// Delivery timeout for one produced message.
    pub message_timeout: Duration,
    /// Upper bound in bytes for one `publish_batch` round.
    pub batch_bytes: usize,
    /// Raw librdkafka settings applied to producers and consumers.
    pub properties: ClientProperties,
}

impl KafkaMessengerConfig {
    /// Create config for a plaintext cluster.
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            group_id: None,
            client_id: None,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
            auto_offset_reset: OffsetReset::Latest,
            message_timeout: Duration::from_secs(5),
            batch_bytes: DEFAULT_BATCH_BYTES,
            properties: ClientProperties::new(),
        }
    }

    /// SASL/PLAIN over SSL with a consumer group and a fresh client id.
    pub fn sasl_plain(
        uri: impl Into<String>,
        group_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(uri)
            .with_group_id(group_id)
            .with_client_id(uuid::Uuid::new_v4().to_string())
            .with_sasl(username, password, "PLAIN")
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    /// Set security protocol.
    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// Set SSL CA certificate location.
    pub fn with_ssl_ca(mut self, ca_location: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(ca_location.into());
        self
    }

    pub fn with_auto_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.auto_offset_reset = reset;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_batch_bytes(mut self, batch_bytes: usize) -> Self {
        self.batch_bytes = batch_bytes.max(1);
        self
    }

    /// Set a raw librdkafka property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Build a ClientConfig for producers.
    fn build_producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        self.apply_properties(&mut config, &self.properties);
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set(
            "message.timeout.ms",
            self.message_timeout.as_millis().to_string(),
        );
        config.set("acks", "all");
        config.set("enable.idempotence", "true");

        if let Some(ref client_id) = self.client_id {
            config.set("client.id", client_id);
        }

        self.apply_security_config(&mut config);
        config
    }

    /// Build a ClientConfig for one consumer.
    ///
    /// `overrides` are the per-consumer client properties; `groupID` maps to
    /// `group.id`, everything else is passed through.
    fn build_consumer_config(&self, overrides: &ClientProperties) -> Result<ClientConfig> {
        let mut config = ClientConfig::new();
        self.apply_properties(&mut config, &self.properties);
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", self.auto_offset_reset.as_str());

        self.apply_security_config(&mut config);
        self.apply_properties(&mut config, overrides);

        let group_id = overrides
            .get(GROUP_ID)
            .or(self.properties.get(GROUP_ID))
            .or(self.group_id.as_ref())
            .ok_or_else(|| {
                MessengerError::Subscribe(
                    "Kafka consumer requires a group id (groupID property or group_id)"
                        .to_string(),
                )
            })?;
        config.set("group.id", group_id);

        if let Some(ref client_id) = self.client_id {
            config.set("client.id", client_id);
        }
        Ok(config)
    }

    /// Copy raw properties, skipping the portable group key.
    fn apply_properties(&self, config: &mut ClientConfig, properties: &ClientProperties) {
        for (key, value) in properties {
            if key != GROUP_ID {
                config.set(key, value);
            }
        }
    }

    /// Apply security settings to a ClientConfig.
    fn apply_security_config(&self, config: &mut ClientConfig) {
        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }

        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }

        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }

        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }

        if let Some(ref ca_location) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }
    }
}

impl From<&KafkaConfig> for KafkaMessengerConfig {
    fn from(config: &KafkaConfig) -> Self {
        let mut built = Self::new(config.bootstrap_servers.clone())
            .with_auto_offset_reset(OffsetReset::parse(&config.auto_offset_reset))
            .with_message_timeout(Duration::from_millis(config.message_timeout_ms))
            .with_batch_bytes(config.batch_bytes);
        built.group_id = config.group_id.clone();
        built.client_id = config.client_id.clone();
        built.sasl_username = config.sasl_username.clone();
        built.sasl_password = config.sasl_password.clone();
        built.sasl_mechanism = config.sasl_mechanism.clone();
        built.security_protocol = config.security_protocol.clone();
        built.ssl_ca_location = config.ssl_ca_location.clone();
        built.properties = config.properties.clone();
        built
    }
}

// ============================================================================
// Client context
// ============================================================================

/// Forwards librdkafka logs and errors into `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingContext;

impl ClientContext for LoggingContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => error!(facility = fac, "{}", log_message),
            RDKafkaLogLevel::Warning => warn!(facility = fac, "{}", log_message),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!(facility = fac, "{}", log_message)
            }
            RDKafkaLogLevel::Debug => debug!(facility = fac, "{}", log_message),
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(code = ?error.rdkafka_error_code(), reason, "Kafka client error");
    }
}

impl ConsumerContext for LoggingContext {}

// ============================================================================
// Messenger
// ============================================================================

struct Shared {
    closed: CloseFlag,
    shutdown: CancellationToken,
    propagator: TracePropagator,
}

/// Kafka messenger.
///
/// Topics are used as-is after lower-casing. Message keys become Kafka keys,
/// so ordering holds per key within a partition.
pub struct KafkaMessenger {
    config: Arc<KafkaMessengerConfig>,
    producer: FutureProducer<LoggingContext>,
    topics: TopicMap<String>,
    shared: Arc<Shared>,
    policy: FailurePolicy,
}

impl KafkaMessenger {
    /// Create the shared producer. No broker round-trip happens here.
    pub fn new<S: AsRef<str>>(config: KafkaMessengerConfig, topics: &[S]) -> Result<Self> {
        let producer: FutureProducer<LoggingContext> = config
            .build_producer_config()
            .create_with_context(LoggingContext)
            .map_err(|e| {
                MessengerError::Connection(format!("Failed to create Kafka producer: {}", e))
            })?;
        let topics = TopicMap::build(topics, |name| Ok(name.to_string()))?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            topics = ?topics.names(),
            "Kafka messenger initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            producer,
            topics,
            shared: Arc::new(Shared {
                closed: CloseFlag::default(),
                shutdown: CancellationToken::new(),
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

    pub fn config(&self) -> &KafkaMessengerConfig {
        &self.config
    }

    fn topic(&self, topic: &str) -> Result<String> {
        self.shared.closed.ensure_open()?;
        self.topics.get(topic).cloned()
    }
}

#[async_trait]
impl Messenger for KafkaMessenger {
    fn backend(&self) -> Backend {
        Backend::Kafka
    }

    fn topics(&self) -> &[String] {
        self.topics.names()
    }

    fn produce(
        &self,
        topic: &str,
        _properties: Option<&ClientProperties>,
    ) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(KafkaProducer {
            topic: self.topic(topic)?,
            producer: self.producer.clone(),
            shared: Arc::clone(&self.shared),
            message_timeout: self.config.message_timeout,
            batch_bytes: self.config.batch_bytes,
        }))
    }

    fn consume(
        &self,
        topic: &str,
        properties: Option<&ClientProperties>,
    ) -> Result<Arc<dyn Consumer>> {
        Ok(Arc::new(KafkaConsumer {
            topic: self.topic(topic)?,
            config: Arc::clone(&self.config),
            properties: properties.cloned().unwrap_or_default(),
            shared: Arc::clone(&self.shared),
            policy: self.policy,
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.shared.closed.close() {
            return Ok(());
        }
        self.shared.shutdown.cancel();

        let producer = self.producer.clone();
        let timeout = self.config.message_timeout;
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| MessengerError::Connection(format!("Flush task failed: {}", e)))?
            .map_err(|e| MessengerError::Publish(format!("Failed to flush producer: {}", e)))?;

        info!("Kafka messenger closed");
        Ok(())
    }
}

// ============================================================================
// Producer
// ============================================================================

struct KafkaProducer {
    topic: String,
    producer: FutureProducer<LoggingContext>,
    shared: Arc<Shared>,
    message_timeout: Duration,
    batch_bytes: usize,
}

#[async_trait]
impl Producer for KafkaProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, message: Message) -> Result<()> {
        self.shared.closed.ensure_open()?;

        let span = publish_span(Backend::Kafka, &self.topic, message.key());
        let started = Instant::now();

        let result = async {
            let (payload, key, timestamp, mut properties) = message.into_parts();
            self.shared.propagator.prepare_current(&mut properties);
            let headers = encode_headers(&properties)?;

            let mut record: FutureRecord<'_, str, str> = FutureRecord::to(&self.topic)
                .payload(payload.as_str())
                .headers(headers)
                .timestamp(timestamp.timestamp_millis());
            if let Some(ref k) = key {
                record = record.key(k.as_str());
            }

            self.producer
                .send(record, self.message_timeout)
                .await
                .map_err(|(e, _)| MessengerError::Publish(format!("Failed to publish: {}", e)))?;

            debug!(topic = %self.topic, key = ?key, "Published message to Kafka");
            Ok::<(), MessengerError>(())
        }
        .instrument(span.clone())
        .await;

        record_publish(&span, Backend::Kafka, &self.topic, started, &result);
        result
    }

    /// Publish in size-bounded rounds; messages of one round are in flight together.
    async fn publish_batch(&self, messages: Vec<Message>) -> Result<()> {
        for batch in pack(messages, self.batch_bytes) {
            try_join_all(batch.into_messages().into_iter().map(|m| self.publish(m))).await?;
        }
        Ok(())
    }
}

/// JSON-encode each property into a header.
fn encode_headers(properties: &Properties) -> Result<OwnedHeaders> {
    let mut headers = OwnedHeaders::new_with_capacity(properties.len());
    for (name, value) in properties {
        let encoded = serde_json::to_vec(value)?;
        headers = headers.insert(Header {
            key: name.as_str(),
            value: Some(&encoded),
        });
    }
    Ok(headers)
}

/// Read headers back into properties. Non-JSON values become strings.
fn decode_headers<H: Headers>(headers: Option<&H>) -> Properties {
    let mut properties = Properties::new();
    let Some(headers) = headers else {
        return properties;
    };
    for header in headers.iter() {
        let value = match header.value {
            Some(bytes) => serde_json::from_slice(bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
            None => Value::Null,
        };
        properties.insert(header.key.to_string(), value);
    }
    properties
}

// ============================================================================
// Consumer
// ============================================================================

struct KafkaConsumer {
    topic: String,
    config: Arc<KafkaMessengerConfig>,
    properties: ClientProperties,
    shared: Arc<Shared>,
    policy: FailurePolicy,
}

#[async_trait]
impl Consumer for KafkaConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn subscribe_until(
        &self,
        handler: Arc<dyn MessageHandler>,
        parent: &CancellationToken,
    ) -> Result<Subscription> {
        self.shared.closed.ensure_open()?;

        let consumer: StreamConsumer<LoggingContext> = self
            .config
            .build_consumer_config(&self.properties)?
            .create_with_context(LoggingContext)
            .map_err(|e| {
                MessengerError::Subscribe(format!("Failed to create Kafka consumer: {}", e))
            })?;
        consumer.subscribe(&[self.topic.as_str()]).map_err(|e| {
            MessengerError::Subscribe(format!("Failed to subscribe to {}: {}", self.topic, e))
        })?;

        info!(topic = %self.topic, "Subscribed to Kafka topic");

        let receiver = KafkaReceiver {
            consumer,
            shared: Arc::clone(&self.shared),
        };
        let config = LoopConfig {
            backend: Backend::Kafka,
            topic: self.topic.clone(),
            policy: self.policy,
            handler,
        };
        Ok(spawn_loops(config, vec![receiver], parent))
    }
}

/// Detached record plus its decoded headers.
struct KafkaDelivery {
    record: OwnedMessage,
    properties: Properties,
}

impl KafkaDelivery {
    fn new(record: OwnedMessage) -> Self {
        let properties = decode_headers(record.headers());
        Self { record, properties }
    }

    fn to_message(&self) -> Result<Message> {
        let payload = match self.record.payload_view::<str>() {
            None => "",
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                return Err(MessengerError::Decode(format!(
                    "{}[{}]@{}: payload is not UTF-8: {}",
                    self.record.topic(),
                    self.record.partition(),
                    self.record.offset(),
                    e
                )))
            }
        };
        let timestamp = self
            .record
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        let mut message = Message::new(payload)
            .with_timestamp(timestamp)
            .with_properties(self.properties.clone());
        if let Some(key) = self.key() {
            message = message.with_key(key);
        }
        Ok(message)
    }

    fn key(&self) -> Option<&str> {
        self.record.key_view::<str>().and_then(|k| k.ok())
    }
}

struct KafkaReceiver {
    consumer: StreamConsumer<LoggingContext>,
    shared: Arc<Shared>,
}

impl KafkaReceiver {
    fn commit(&self, record: &OwnedMessage, offset: i64) -> Result<()> {
        let mut positions = TopicPartitionList::new();
        positions
            .add_partition_offset(record.topic(), record.partition(), Offset::Offset(offset))
            .map_err(|e| MessengerError::Acknowledge(e.to_string()))?;
        self.consumer
            .commit(&positions, CommitMode::Async)
            .map_err(|e| MessengerError::Acknowledge(format!("Failed to commit offset: {}", e)))
    }
}

#[async_trait]
impl Receiver for KafkaReceiver {
    type Delivery = KafkaDelivery;
    type Item = Message;

    async fn receive(&mut self) -> Result<Option<KafkaDelivery>> {
        tokio::select! {
            _ = self.shared.shutdown.cancelled() => Err(MessengerError::Closed),
            result = self.consumer.recv() => match result {
                Ok(record) => Ok(Some(KafkaDelivery::new(record.detach()))),
                Err(e) => Err(MessengerError::Connection(format!("Kafka consumer error: {}", e))),
            },
        }
    }

    fn decode(&self, delivery: &KafkaDelivery) -> Result<Message> {
        delivery.to_message()
    }

    fn key<'a>(&self, delivery: &'a KafkaDelivery) -> Option<&'a str> {
        delivery.key()
    }

    fn parent_context(&self, delivery: &KafkaDelivery) -> Context {
        self.shared.propagator.resume(&delivery.properties)
    }

    async fn ack(&mut self, delivery: KafkaDelivery) -> Result<()> {
        self.commit(&delivery.record, delivery.record.offset() + 1)
    }

    /// Rewind the partition to the failed record once the delay has passed.
    async fn requeue(&mut self, delivery: KafkaDelivery, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = self.shared.shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
        let record = &delivery.record;
        self.consumer
            .seek(
                record.topic(),
                record.partition(),
                Offset::Offset(record.offset()),
                Duration::from_secs(5),
            )
            .map_err(|e| MessengerError::Acknowledge(format!("Failed to seek: {}", e)))
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
        debug!("Kafka consumer unsubscribed");
    }
}
