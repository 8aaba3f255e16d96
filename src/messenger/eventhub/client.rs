//! Event Hubs client capabilities.
//!
//! The messenger only needs a handful of operations from the Event Hubs and
//! blob checkpoint SDKs. They are expressed as traits so any client (the
//! Azure SDK, an emulator, [`super::InMemoryEventHubs`]) can be plugged in.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::messenger::{Properties, Result};

/// Event as handed to a sender.
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub body: Bytes,
    pub partition_key: Option<String>,
    pub properties: Properties,
}

impl EventData {
    /// Approximate encoded size, used to fill batches.
    pub fn size_bytes(&self) -> usize {
        let properties: usize = self
            .properties
            .iter()
            .map(|(k, v)| k.len() + v.to_string().len())
            .sum();
        self.body.len() + self.partition_key.as_ref().map_or(0, String::len) + properties
    }
}

/// Event as delivered to a processor.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    pub partition_id: String,
    pub sequence_number: i64,
    pub enqueued_time: DateTime<Utc>,
    pub data: EventData,
}

/// Where a partition without a checkpoint starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Earliest,
    Latest,
}

/// Producer client bound to one event hub.
#[async_trait]
pub trait EventHubSender: Send + Sync {
    fn event_hub_name(&self) -> &str;

    /// Largest batch the hub accepts, in bytes.
    fn max_batch_bytes(&self) -> usize;

    /// Send events as one batch.
    async fn send(&self, events: Vec<EventData>) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Processor client bound to one event hub and consumer group.
///
/// Owns the partitions it claims and reads them from the last checkpoint, or
/// from the start position when a partition has none.
#[async_trait]
pub trait EventProcessorClient: Send {
    async fn start(&mut self, position: StartPosition) -> Result<()>;

    /// Wait for the next event of any owned partition.
    async fn next_event(&mut self) -> Result<Option<ReceivedEvent>>;

    /// Record `event` as the last processed position of its partition.
    async fn update_checkpoint(&mut self, event: &ReceivedEvent) -> Result<()>;

    /// Release owned partitions.
    async fn stop(&mut self) -> Result<()>;
}

/// Durable per-partition checkpoints (blob container in production).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn checkpoint(
        &self,
        event_hub: &str,
        consumer_group: &str,
        partition_id: &str,
    ) -> Result<Option<i64>>;

    async fn update_checkpoint(
        &self,
        event_hub: &str,
        consumer_group: &str,
        partition_id: &str,
        sequence_number: i64,
    ) -> Result<()>;
}

/// Builds clients for an Event Hubs namespace.
#[async_trait]
pub trait EventHubConnector: Send + Sync {
    async fn sender(&self, event_hub: &str) -> Result<Arc<dyn EventHubSender>>;

    async fn processor(
        &self,
        event_hub: &str,
        consumer_group: &str,
    ) -> Result<Box<dyn EventProcessorClient>>;
}
