//! Message envelope exchanged between producers and consumers.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form property bag carried alongside the payload.
///
/// Used for trace propagation headers and application-defined metadata.
pub type Properties = HashMap<String, serde_json::Value>;

/// Immutable message envelope.
///
/// A message is never mutated once built. Producers derive stamped copies
/// (server timestamp, trace headers) through the `with_*` methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    payload: String,
    #[serde(default)]
    key: Option<String>,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    properties: Properties,
}

impl Message {
    /// Create a message with the given payload, no key, and the current time.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            key: None,
            timestamp: Utc::now(),
            properties: Properties::new(),
        }
    }

    /// Create a message with a partition/ordering key.
    pub fn keyed(key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(payload).with_key(key)
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Look up a property rendered as a string (JSON strings are unquoted).
    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(|v| v.as_str())
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Split the envelope into its parts.
    pub fn into_parts(self) -> (String, Option<String>, DateTime<Utc>, Properties) {
        (self.payload, self.key, self.timestamp, self.properties)
    }

    /// Approximate wire size, used for batch packing.
    pub fn encoded_len(&self) -> usize {
        let properties: usize = self
            .properties
            .iter()
            .map(|(k, v)| k.len() + v.to_string().len())
            .sum();
        self.payload.len() + self.key.as_ref().map_or(0, String::len) + properties
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}
