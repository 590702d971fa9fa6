use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use trellis_common::{EventBus, KeyValueStore, MeshEvent, MessageId, Payload, Result};

use crate::message::{next_message_id, PublishOptions, QueueMessage};

/// Identifies one subscription, for targeted unsubscription.
pub type HandlerId = u64;

/// Delivery callback for a topic. All handlers registered on a topic must
/// succeed for a message to count as delivered.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: QueueMessage) -> Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: QueueMessage) -> Result<()> {
        (self)(message).await
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Delivery loop tick
    pub tick_interval: Duration,
    /// Messages older than this are dropped regardless of delivery outcome
    pub retention: Duration,
    /// How often the retention sweeper runs
    pub retention_sweep_interval: Duration,
    /// Attempts before dead-lettering when the publish does not say
    pub default_max_retries: u32,
    /// First retry backoff; doubles per attempt
    pub retry_base_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            retention: Duration::from_secs(60 * 60),
            retention_sweep_interval: Duration::from_secs(60),
            default_max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Per-topic message counts reported by [`MessageQueue::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TopicStats {
    /// Pending messages that have never failed
    pub pending: usize,
    /// Pending messages waiting out a retry backoff
    pub retrying: usize,
    pub dead_lettered: usize,
}

#[derive(Default)]
struct TopicState {
    pending: Vec<QueueMessage>,
    dead: Vec<QueueMessage>,
}

struct Subscription {
    id: HandlerId,
    handler: Arc<dyn MessageHandler>,
}

/// Topic-addressed asynchronous delivery with retry, exponential backoff and
/// dead-lettering. Messages live in memory; the optional store holds
/// best-effort copies under the retention TTL.
pub struct MessageQueue {
    config: QueueConfig,
    topics: RwLock<HashMap<String, TopicState>>,
    handlers: RwLock<HashMap<String, Vec<Subscription>>>,
    next_handler_id: AtomicU64,
    store: Option<Arc<dyn KeyValueStore>>,
    events: EventBus,
}

impl MessageQueue {
    pub fn new(config: QueueConfig, events: EventBus) -> Self {
        Self {
            config,
            topics: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            next_handler_id: AtomicU64::new(0),
            store: None,
            events,
        }
    }

    pub fn with_store(
        config: QueueConfig,
        events: EventBus,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            store: Some(store),
            ..Self::new(config, events)
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue a message onto `topic` and return its id.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Payload,
        options: PublishOptions,
    ) -> MessageId {
        let message = QueueMessage {
            id: next_message_id(),
            topic: topic.to_string(),
            payload,
            enqueued_at: SystemTime::now(),
            attempts: 0,
            max_retries: options
                .max_retries
                .unwrap_or(self.config.default_max_retries),
            not_before: options.delay.map(|delay| Instant::now() + delay),
            metadata: options.metadata.unwrap_or_default(),
        };
        let id = message.id;

        self.persist(&message).await;
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .pending
            .push(message);

        debug!("published message {} to {}", id, topic);
        self.events.emit(MeshEvent::MessagePublished {
            id,
            topic: topic.to_string(),
        });
        id
    }

    /// Register a delivery handler for `topic`.
    pub async fn subscribe<H>(&self, topic: &str, handler: H) -> HandlerId
    where
        H: MessageHandler + 'static,
    {
        self.subscribe_arc(topic, Arc::new(handler)).await
    }

    pub async fn subscribe_arc(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> HandlerId {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(Subscription { id, handler });
        info!("subscribed handler {} to {}", id, topic);
        id
    }

    /// Remove one handler by id, or every handler of the topic when `id` is
    /// `None`. Returns whether anything was removed.
    pub async fn unsubscribe(&self, topic: &str, id: Option<HandlerId>) -> bool {
        let mut handlers = self.handlers.write().await;
        let Some(subscriptions) = handlers.get_mut(topic) else {
            return false;
        };
        let before = subscriptions.len();
        match id {
            Some(id) => subscriptions.retain(|s| s.id != id),
            None => subscriptions.clear(),
        }
        let removed = before != subscriptions.len();
        if subscriptions.is_empty() {
            handlers.remove(topic);
        }
        removed
    }

    /// One delivery pass: hand every due message of every subscribed topic
    /// to all of the topic's handlers. Called by the delivery loop each
    /// tick; exposed so tests can drive delivery deterministically.
    pub async fn deliver_due(&self) {
        let now = Instant::now();

        let subscribed: Vec<(String, Vec<Arc<dyn MessageHandler>>)> = {
            let handlers = self.handlers.read().await;
            handlers
                .iter()
                .filter(|(_, subs)| !subs.is_empty())
                .map(|(topic, subs)| {
                    (
                        topic.clone(),
                        subs.iter().map(|s| s.handler.clone()).collect(),
                    )
                })
                .collect()
        };

        for (topic, handler_list) in subscribed {
            // pull due messages out of pending; they are re-filed once the
            // outcome is known, so a message is never in two lists at once
            let due: Vec<QueueMessage> = {
                let mut topics = self.topics.write().await;
                let Some(state) = topics.get_mut(&topic) else {
                    continue;
                };
                let (due, kept) = state
                    .pending
                    .drain(..)
                    .partition(|message| message.is_due(now));
                state.pending = kept;
                due
            };
            if due.is_empty() {
                continue;
            }

            let deliveries = due.into_iter().map(|message| {
                let handler_list = handler_list.clone();
                async move {
                    let results = futures::future::join_all(
                        handler_list
                            .iter()
                            .map(|handler| handler.handle(message.clone())),
                    )
                    .await;
                    let failure = results.into_iter().find_map(|r| r.err());
                    (message, failure)
                }
            });
            let outcomes = futures::future::join_all(deliveries).await;

            for (message, failure) in outcomes {
                match failure {
                    None => self.complete(message).await,
                    Some(error) => self.reschedule_or_dead_letter(message, &error).await,
                }
            }
        }
    }

    async fn complete(&self, message: QueueMessage) {
        self.unpersist(&message).await;
        debug!("message {} on {} delivered", message.id, message.topic);
        self.events.emit(MeshEvent::MessageProcessed {
            id: message.id,
            topic: message.topic,
        });
    }

    async fn reschedule_or_dead_letter(&self, mut message: QueueMessage, error: &trellis_common::MeshError) {
        message.attempts += 1;

        if message.attempts >= message.max_retries {
            warn!(
                "message {} on {} dead-lettered after {} attempts: {}",
                message.id, message.topic, message.attempts, error
            );
            let (id, topic) = (message.id, message.topic.clone());
            self.topics
                .write()
                .await
                .entry(topic.clone())
                .or_default()
                .dead
                .push(message);
            self.events.emit(MeshEvent::MessageDeadLettered { id, topic });
        } else {
            let backoff = self.config.retry_base_delay * 2u32.pow(message.attempts - 1);
            message.not_before = Some(Instant::now() + backoff);
            debug!(
                "message {} on {} failed attempt {}: {}, retrying in {:?}",
                message.id, message.topic, message.attempts, error, backoff
            );
            let (id, topic, attempts) = (message.id, message.topic.clone(), message.attempts);
            self.topics
                .write()
                .await
                .entry(topic.clone())
                .or_default()
                .pending
                .push(message);
            self.events.emit(MeshEvent::MessageRetried { id, topic, attempts });
        }
    }

    /// Move a dead-lettered message back to its topic's pending list with a
    /// reset retry budget. Returns `false` when the id is not dead-lettered.
    pub async fn reprocess_dead_letter(&self, id: MessageId) -> bool {
        let mut topics = self.topics.write().await;
        for state in topics.values_mut() {
            if let Some(position) = state.dead.iter().position(|m| m.id == id) {
                let mut message = state.dead.remove(position);
                message.attempts = 0;
                message.not_before = None;
                info!("reprocessing dead-lettered message {} on {}", id, message.topic);
                state.pending.push(message);
                return true;
            }
        }
        false
    }

    /// Per-topic counts of first-attempt pending, retrying and dead-lettered
    /// messages.
    pub async fn stats(&self) -> HashMap<String, TopicStats> {
        let topics = self.topics.read().await;
        topics
            .iter()
            .map(|(topic, state)| {
                let retrying = state.pending.iter().filter(|m| m.attempts > 0).count();
                (
                    topic.clone(),
                    TopicStats {
                        pending: state.pending.len() - retrying,
                        retrying,
                        dead_lettered: state.dead.len(),
                    },
                )
            })
            .collect()
    }

    /// Drop messages older than the retention window, pending and
    /// dead-lettered alike. Bounds memory even for topics with no handlers.
    pub async fn sweep_retention(&self) {
        let now = SystemTime::now();
        let retention = self.config.retention;
        let mut dropped = Vec::new();
        {
            let mut topics = self.topics.write().await;
            for (topic, state) in topics.iter_mut() {
                for list in [&mut state.pending, &mut state.dead] {
                    list.retain(|message| {
                        let stale = message.is_stale(retention, now);
                        if stale {
                            dropped.push((topic.clone(), message.id));
                        }
                        !stale
                    });
                }
            }
            topics.retain(|_, state| !state.pending.is_empty() || !state.dead.is_empty());
        }

        for (topic, id) in &dropped {
            self.delete_persisted(topic, *id).await;
        }
        if !dropped.is_empty() {
            info!("retention sweep dropped {} expired messages", dropped.len());
        }
    }

    fn store_key(topic: &str, id: MessageId) -> String {
        format!("trellis/queue/{}/{}", topic, id)
    }

    async fn persist(&self, message: &QueueMessage) {
        let Some(store) = &self.store else { return };
        let key = Self::store_key(&message.topic, message.id);
        match serde_json::to_string(message) {
            Ok(value) => {
                if let Err(e) = store.set(&key, value, Some(self.config.retention)).await {
                    warn!("failed to persist message {}: {}", message.id, e);
                }
            }
            Err(e) => warn!("failed to encode message {} for store: {}", message.id, e),
        }
    }

    async fn unpersist(&self, message: &QueueMessage) {
        self.delete_persisted(&message.topic, message.id).await;
    }

    async fn delete_persisted(&self, topic: &str, id: MessageId) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.delete(&Self::store_key(topic, id)).await {
            warn!("failed to remove persisted message {}: {}", id, e);
        }
    }
}
