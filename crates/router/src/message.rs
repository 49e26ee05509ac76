//! The routable message value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// A message travelling through the bus.
///
/// Ids are unique within the process; the timestamp is milliseconds
/// since the Unix epoch, taken at construction.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub id: u64,
    pub sender: String,
    pub receiver: String,
    pub topic: String,
    pub content: Vec<u8>,
    pub priority: u8,
    pub timestamp_ms: u64,
    pub metadata: HashMap<String, String>,
}

impl ChannelMessage {
    pub fn new(topic: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        ChannelMessage {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1,
            sender: String::new(),
            receiver: String::new(),
            topic: topic.into(),
            content: content.into(),
            priority: 0,
            timestamp_ms: now_ms(),
            metadata: HashMap::new(),
        }
    }

    pub fn set_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn set_receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = receiver.into();
        self
    }

    pub fn set_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn set_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
