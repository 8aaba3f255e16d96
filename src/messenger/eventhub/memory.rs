//! In-memory Event Hubs namespace.
//!
//! Partitioned append-only logs with consumer-group checkpoints. Partition
//! ownership is exclusive per consumer group: a processor claims every
//! partition not already owned by another processor of its group.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::debug;

use super::client::{
    CheckpointStore, EventData, EventHubConnector, EventHubSender, EventProcessorClient,
    ReceivedEvent, StartPosition,
};
use crate::messenger::{MessengerError, Result};

const DEFAULT_PARTITIONS: usize = 4;
const DEFAULT_MAX_BATCH_BYTES: usize = 1024 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| MessengerError::Connection("in-memory hub lock poisoned".to_string()))
}

// ============================================================================
// Checkpoints
// ============================================================================

type CheckpointKey = (String, String, String);

/// Checkpoint store keeping positions in a map.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<HashMap<CheckpointKey, i64>>,
    updates: AtomicUsize,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoint updates recorded so far.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn checkpoint(
        &self,
        event_hub: &str,
        consumer_group: &str,
        partition_id: &str,
    ) -> Result<Option<i64>> {
        let key = (
            event_hub.to_string(),
            consumer_group.to_string(),
            partition_id.to_string(),
        );
        Ok(lock(&self.checkpoints)?.get(&key).copied())
    }

    async fn update_checkpoint(
        &self,
        event_hub: &str,
        consumer_group: &str,
        partition_id: &str,
        sequence_number: i64,
    ) -> Result<()> {
        let key = (
            event_hub.to_string(),
            consumer_group.to_string(),
            partition_id.to_string(),
        );
        lock(&self.checkpoints)?.insert(key, sequence_number);
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Hub
// ============================================================================

struct Hub {
    name: String,
    partitions: Vec<Mutex<Vec<ReceivedEvent>>>,
    /// (consumer group, partition index) pairs currently owned by a processor.
    owned: Mutex<HashSet<(String, usize)>>,
    appended: Notify,
    round_robin: AtomicUsize,
}

impl Hub {
    fn new(name: &str, partitions: usize) -> Self {
        Self {
            name: name.to_string(),
            partitions: (0..partitions.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            owned: Mutex::new(HashSet::new()),
            appended: Notify::new(),
            round_robin: AtomicUsize::new(0),
        }
    }

    fn partition_for(&self, key: Option<&str>) -> usize {
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.partitions.len() as u64) as usize
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % self.partitions.len(),
        }
    }

    fn append(&self, events: Vec<EventData>) -> Result<()> {
        for data in events {
            let index = self.partition_for(data.partition_key.as_deref());
            let mut partition = lock(&self.partitions[index])?;
            let sequence_number = partition.len() as i64;
            partition.push(ReceivedEvent {
                partition_id: index.to_string(),
                sequence_number,
                enqueued_time: Utc::now(),
                data,
            });
        }
        self.appended.notify_waiters();
        Ok(())
    }

    fn len(&self, index: usize) -> Result<usize> {
        Ok(lock(&self.partitions[index])?.len())
    }

    fn event_at(&self, index: usize, position: usize) -> Result<Option<ReceivedEvent>> {
        Ok(lock(&self.partitions[index])?.get(position).cloned())
    }
}

// ============================================================================
// Namespace
// ============================================================================

struct Namespace {
    hubs: Mutex<HashMap<String, Arc<Hub>>>,
    partitions: usize,
    max_batch_bytes: usize,
    checkpoints: Arc<dyn CheckpointStore>,
    senders_created: AtomicUsize,
}

impl Namespace {
    fn hub(&self, name: &str) -> Result<Arc<Hub>> {
        let mut hubs = lock(&self.hubs)?;
        Ok(Arc::clone(
            hubs.entry(name.to_string())
                .or_insert_with(|| Arc::new(Hub::new(name, self.partitions))),
        ))
    }
}

/// In-memory Event Hubs namespace implementing [`EventHubConnector`].
///
/// Hubs are created on first use. Cloning shares the namespace.
#[derive(Clone)]
pub struct InMemoryEventHubs {
    namespace: Arc<Namespace>,
}

impl InMemoryEventHubs {
    pub fn new() -> Self {
        Self::with_checkpoint_store(Arc::new(InMemoryCheckpointStore::new()))
    }

    /// Use `checkpoints` for consumer-group positions.
    pub fn with_checkpoint_store(checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            namespace: Arc::new(Namespace {
                hubs: Mutex::new(HashMap::new()),
                partitions: DEFAULT_PARTITIONS,
                max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
                checkpoints,
                senders_created: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of partitions for hubs created afterwards.
    pub fn with_partitions(self, partitions: usize) -> Self {
        self.reconfigure(|ns| ns.partitions = partitions.max(1))
    }

    /// Batch size limit reported by senders.
    pub fn with_max_batch_bytes(self, max_batch_bytes: usize) -> Self {
        self.reconfigure(|ns| ns.max_batch_bytes = max_batch_bytes.max(1))
    }

    fn reconfigure(self, apply: impl FnOnce(&mut Namespace)) -> Self {
        match Arc::try_unwrap(self.namespace) {
            Ok(mut namespace) => {
                apply(&mut namespace);
                Self {
                    namespace: Arc::new(namespace),
                }
            }
            Err(shared) => Self { namespace: shared },
        }
    }

    /// Number of sender clients created by this namespace.
    pub fn senders_created(&self) -> usize {
        self.namespace.senders_created.load(Ordering::SeqCst)
    }

    /// Every event stored in `event_hub`, ordered by partition then sequence.
    pub fn events(&self, event_hub: &str) -> Result<Vec<ReceivedEvent>> {
        let hub = self.namespace.hub(event_hub)?;
        let mut events = Vec::new();
        for partition in &hub.partitions {
            events.extend(lock(partition)?.iter().cloned());
        }
        Ok(events)
    }
}

impl Default for InMemoryEventHubs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventHubConnector for InMemoryEventHubs {
    async fn sender(&self, event_hub: &str) -> Result<Arc<dyn EventHubSender>> {
        let hub = self.namespace.hub(event_hub)?;
        self.namespace.senders_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemorySender {
            hub,
            max_batch_bytes: self.namespace.max_batch_bytes,
        }))
    }

    async fn processor(
        &self,
        event_hub: &str,
        consumer_group: &str,
    ) -> Result<Box<dyn EventProcessorClient>> {
        Ok(Box::new(InMemoryProcessor {
            hub: self.namespace.hub(event_hub)?,
            consumer_group: consumer_group.to_string(),
            checkpoints: Arc::clone(&self.namespace.checkpoints),
            cursors: Vec::new(),
            next_partition: 0,
            running: false,
        }))
    }
}

// ============================================================================
// Clients
// ============================================================================

struct InMemorySender {
    hub: Arc<Hub>,
    max_batch_bytes: usize,
}

#[async_trait]
impl EventHubSender for InMemorySender {
    fn event_hub_name(&self) -> &str {
        &self.hub.name
    }

    fn max_batch_bytes(&self) -> usize {
        self.max_batch_bytes
    }

    async fn send(&self, events: Vec<EventData>) -> Result<()> {
        let size: usize = events.iter().map(EventData::size_bytes).sum();
        if events.len() > 1 && size > self.max_batch_bytes {
            return Err(MessengerError::Publish(format!(
                "batch of {} bytes exceeds limit of {} bytes",
                size, self.max_batch_bytes
            )));
        }
        self.hub.append(events)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Cursor over one owned partition.
struct Cursor {
    partition: usize,
    next: usize,
}

struct InMemoryProcessor {
    hub: Arc<Hub>,
    consumer_group: String,
    checkpoints: Arc<dyn CheckpointStore>,
    cursors: Vec<Cursor>,
    next_partition: usize,
    running: bool,
}

impl InMemoryProcessor {
    fn poll(&mut self) -> Result<Option<ReceivedEvent>> {
        let count = self.cursors.len();
        for step in 0..count {
            let slot = (self.next_partition + step) % count;
            let cursor = &mut self.cursors[slot];
            if let Some(event) = self.hub.event_at(cursor.partition, cursor.next)? {
                cursor.next += 1;
                self.next_partition = (slot + 1) % count;
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl EventProcessorClient for InMemoryProcessor {
    async fn start(&mut self, position: StartPosition) -> Result<()> {
        let claimed: Vec<usize> = {
            let mut owned = lock(&self.hub.owned)?;
            (0..self.hub.partitions.len())
                .filter(|p| owned.insert((self.consumer_group.clone(), *p)))
                .collect()
        };

        let mut cursors = Vec::with_capacity(claimed.len());
        for partition in claimed {
            let checkpoint = self
                .checkpoints
                .checkpoint(&self.hub.name, &self.consumer_group, &partition.to_string())
                .await?;
            let next = match (checkpoint, position) {
                (Some(sequence), _) => (sequence + 1).max(0) as usize,
                (None, StartPosition::Earliest) => 0,
                (None, StartPosition::Latest) => self.hub.len(partition)?,
            };
            cursors.push(Cursor { partition, next });
        }

        debug!(
            event_hub = %self.hub.name,
            consumer_group = %self.consumer_group,
            partitions = cursors.len(),
            "In-memory processor started"
        );
        self.cursors = cursors;
        self.running = true;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<ReceivedEvent>> {
        loop {
            if !self.running {
                return Err(MessengerError::Closed);
            }
            let hub = Arc::clone(&self.hub);
            let appended = hub.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(event) = self.poll()? {
                return Ok(Some(event));
            }
            appended.await;
        }
    }

    async fn update_checkpoint(&mut self, event: &ReceivedEvent) -> Result<()> {
        self.checkpoints
            .update_checkpoint(
                &self.hub.name,
                &self.consumer_group,
                &event.partition_id,
                event.sequence_number,
            )
            .await
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        let mut owned = lock(&self.hub.owned)?;
        for cursor in self.cursors.drain(..) {
            owned.remove(&(self.consumer_group.clone(), cursor.partition));
        }
        Ok(())
    }
}

impl Drop for InMemoryProcessor {
    fn drop(&mut self) {
        if let Ok(mut owned) = self.hub.owned.lock() {
            for cursor in self.cursors.drain(..) {
                owned.remove(&(self.consumer_group.clone(), cursor.partition));
            }
        }
    }
}
