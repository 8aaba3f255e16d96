//! In-memory storage queue with visibility timeouts and pop receipts.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use super::{QueueClient, QueueMessage};
use crate::messenger::{MessengerError, Result};

struct StoredMessage {
    id: String,
    text: String,
    pop_receipt: Option<String>,
    visible_at: Instant,
    dequeue_count: u32,
}

#[derive(Default)]
struct QueueState {
    messages: Vec<StoredMessage>,
    deletes: HashMap<String, usize>,
}

/// Queue held in process memory. Counts deletes per message id.
pub struct InMemoryQueue {
    name: String,
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| MessengerError::Connection("in-memory queue lock poisoned".to_string()))
    }

    /// Messages still stored, visible or not.
    pub fn len(&self) -> usize {
        self.state().map(|s| s.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total successful deletes.
    pub fn deleted_count(&self) -> usize {
        self.state()
            .map(|s| s.deletes.values().sum())
            .unwrap_or(0)
    }

    /// Successful deletes per message id.
    pub fn delete_counts(&self) -> HashMap<String, usize> {
        self.state().map(|s| s.deletes.clone()).unwrap_or_default()
    }

    /// Times the message with `text` has been received, if still stored.
    pub fn dequeue_count(&self, text: &str) -> Option<u32> {
        self.state().ok().and_then(|s| {
            s.messages
                .iter()
                .find(|m| m.text == text)
                .map(|m| m.dequeue_count)
        })
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn approximate_message_count(&self) -> Result<usize> {
        Ok(self.state()?.messages.len())
    }

    async fn send_message(&self, text: String) -> Result<()> {
        self.state()?.messages.push(StoredMessage {
            id: Uuid::new_v4().to_string(),
            text,
            pop_receipt: None,
            visible_at: Instant::now(),
            dequeue_count: 0,
        });
        Ok(())
    }

    async fn receive_message(&self, visibility_timeout: Duration) -> Result<Option<QueueMessage>> {
        let now = Instant::now();
        let mut state = self.state()?;
        let Some(stored) = state.messages.iter_mut().find(|m| m.visible_at <= now) else {
            return Ok(None);
        };

        let receipt = Uuid::new_v4().to_string();
        stored.pop_receipt = Some(receipt.clone());
        stored.visible_at = now + visibility_timeout;
        stored.dequeue_count += 1;

        Ok(Some(QueueMessage {
            message_id: stored.id.clone(),
            pop_receipt: receipt,
            text: stored.text.clone(),
            dequeue_count: stored.dequeue_count,
        }))
    }

    async fn delete_message(&self, message_id: &str, pop_receipt: &str) -> Result<()> {
        let mut state = self.state()?;
        let index = state
            .messages
            .iter()
            .position(|m| m.id == message_id && m.pop_receipt.as_deref() == Some(pop_receipt))
            .ok_or_else(|| {
                MessengerError::Acknowledge(format!(
                    "message {} not found or pop receipt expired",
                    message_id
                ))
            })?;
        state.messages.remove(index);
        *state.deletes.entry(message_id.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn update_visibility(
        &self,
        message_id: &str,
        pop_receipt: &str,
        visibility_timeout: Duration,
    ) -> Result<String> {
        let mut state = self.state()?;
        let stored = state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id && m.pop_receipt.as_deref() == Some(pop_receipt))
            .ok_or_else(|| {
                MessengerError::Acknowledge(format!(
                    "message {} not found or pop receipt expired",
                    message_id
                ))
            })?;

        let receipt = Uuid::new_v4().to_string();
        stored.pop_receipt = Some(receipt.clone());
        stored.visible_at = Instant::now() + visibility_timeout;
        Ok(receipt)
    }
}
