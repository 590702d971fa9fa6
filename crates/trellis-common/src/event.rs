//! Mesh notifications.
//!
//! The registry, queue and orchestrator emit a closed set of events that any
//! observer (metrics, logging, dashboards) can consume without the emitting
//! component knowing who listens. Events are fanned out over a broadcast
//! channel; emitting with no subscribers is not an error, and a slow
//! subscriber only lags its own receiver.

use tokio::sync::broadcast;

use crate::MessageId;

/// Default capacity of the broadcast channel backing an [`EventBus`].
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Everything the mesh announces about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    ServiceRegistered { id: String, name: String },
    ServiceDeregistered { id: String, name: String },
    ServiceUnhealthy { id: String, name: String },
    MessagePublished { id: MessageId, topic: String },
    MessageProcessed { id: MessageId, topic: String },
    MessageRetried { id: MessageId, topic: String, attempts: u32 },
    MessageDeadLettered { id: MessageId, topic: String },
}

/// Cloneable handle to the mesh-wide event channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MeshEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event. A send with no live receivers is silently dropped;
    /// emission must never fail the operation that produced the event.
    pub fn emit(&self, event: MeshEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
