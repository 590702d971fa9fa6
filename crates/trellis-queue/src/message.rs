use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use trellis_common::{Metadata, MessageId, Payload};

static MESSAGE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique message id: upper 32 bits from the wall clock,
/// lower 32 bits from a monotonically increasing counter, so ids stay unique
/// across rapid consecutive publishes.
pub(crate) fn next_message_id() -> MessageId {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let counter = MESSAGE_ID_COUNTER.fetch_add(1, Ordering::SeqCst);

    (timestamp & 0xFFFFFFFF00000000) | (counter & 0xFFFFFFFF)
}

/// Per-publish options; unset fields fall back to the queue's configuration.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Initial delivery delay
    pub delay: Option<Duration>,
    /// Delivery attempts before the message is dead-lettered
    pub max_retries: Option<u32>,
    pub metadata: Option<Metadata>,
}

/// A message owned by the queue from publish until it is delivered, dropped
/// by retention, or parked in a topic's dead-letter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: MessageId,
    pub topic: String,
    pub payload: Payload,
    pub enqueued_at: SystemTime,
    /// Delivery attempts so far; starts at 0
    pub attempts: u32,
    pub max_retries: u32,
    /// Not a delivery candidate before this deadline (publish delay or
    /// retry backoff). Process-local, so it is not persisted.
    #[serde(skip)]
    pub not_before: Option<Instant>,
    pub metadata: Metadata,
}

impl QueueMessage {
    /// Whether the message may be handed to subscribers at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |deadline| deadline <= now)
    }

    /// Whether the message fell out of the retention window at `now`.
    pub fn is_stale(&self, retention: Duration, now: SystemTime) -> bool {
        now.duration_since(self.enqueued_at)
            .map(|age| age > retention)
            .unwrap_or(false)
    }
}
