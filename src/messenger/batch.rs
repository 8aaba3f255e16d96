//! Size-bounded batch packing.
//!
//! Mirrors the "try add, send remainder" loop of batching broker clients:
//! messages are added to the current batch until one no longer fits, the
//! batch is sealed, and packing resumes with a fresh batch. Order is kept.

use super::Message;

/// A batch with a byte budget.
#[derive(Debug)]
pub struct MessageBatch {
    max_bytes: usize,
    size: usize,
    messages: Vec<Message>,
}

impl MessageBatch {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            size: 0,
            messages: Vec::new(),
        }
    }

    /// Add `message` if it fits, otherwise hand it back.
    ///
    /// An empty batch always accepts, so a single oversized message still
    /// gets a batch of its own and packing always makes progress.
    pub fn try_add(&mut self, message: Message) -> Result<(), Message> {
        let len = message.encoded_len();
        if !self.messages.is_empty() && self.size + len > self.max_bytes {
            return Err(message);
        }
        self.size += len;
        self.messages.push(message);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

/// Split `messages` into consecutive batches of at most `max_bytes` each.
pub fn pack(messages: Vec<Message>, max_bytes: usize) -> Vec<MessageBatch> {
    let mut batches = Vec::new();
    let mut current = MessageBatch::new(max_bytes);

    for message in messages {
        if let Err(rejected) = current.try_add(message) {
            batches.push(std::mem::replace(&mut current, MessageBatch::new(max_bytes)));
            // Cannot fail: the fresh batch is empty.
            let _ = current.try_add(rejected);
        }
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
