//! Messenger backend configuration types.

use serde::Deserialize;

use crate::messenger::ClientProperties;

/// Messenger type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessengerType {
    /// In-process channels (no external broker).
    #[default]
    Local,
    /// Kafka via rdkafka.
    Kafka,
    /// Azure Event Hubs.
    #[serde(rename = "eventhub")]
    EventHub,
}

/// Messenger configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// Messenger type discriminator.
    #[serde(rename = "type")]
    pub messenger_type: MessengerType,
    /// Topics declared up front. Names are case-insensitive.
    pub topics: Vec<String>,
    /// Client properties applied to every producer and consumer.
    pub properties: ClientProperties,
    /// Local-specific configuration.
    pub local: LocalConfig,
    /// Kafka-specific configuration.
    pub kafka: KafkaConfig,
    /// Event Hub-specific configuration.
    pub eventhub: EventHubConfig,
}

/// Local-specific configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Per-topic channel capacity. Unbounded when unset.
    pub capacity: Option<usize>,
}

/// Kafka-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Consumer group ID.
    pub group_id: Option<String>,
    /// Client ID reported to the brokers.
    pub client_id: Option<String>,
    /// SASL username (optional).
    pub sasl_username: Option<String>,
    /// SASL password (optional).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path.
    pub ssl_ca_location: Option<String>,
    /// `earliest` or `latest`.
    pub auto_offset_reset: String,
    /// Delivery timeout for one produced message, in milliseconds.
    pub message_timeout_ms: u64,
    /// Upper bound in bytes for one batch publish round.
    pub batch_bytes: usize,
    /// Raw librdkafka settings.
    pub properties: ClientProperties,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: None,
            client_id: None,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
            auto_offset_reset: "latest".to_string(),
            message_timeout_ms: 5000,
            batch_bytes: 1024 * 1024,
            properties: ClientProperties::new(),
        }
    }
}

/// Event Hub-specific configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventHubConfig {
    /// Namespace connection string (`Endpoint=sb://...;SharedAccessKeyName=...`).
    pub connection_string: String,
    /// Blob storage connection string for checkpoints.
    pub blob_connection_string: String,
    /// Blob container holding checkpoints.
    pub blob_container_name: String,
    /// Consumer group used when a consumer sets no `groupID`.
    pub consumer_group: Option<String>,
    /// Client properties applied to every consumer.
    pub properties: ClientProperties,
}

impl EventHubConfig {
    /// `Endpoint` value of the connection string, if present.
    pub fn endpoint(&self) -> Option<&str> {
        self.connection_string
            .split(';')
            .filter_map(|part| part.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("endpoint"))
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
    }
}
