use std::collections::HashMap;

use serde::Serialize;

use trellis_common::BreakerSnapshot;
use trellis_queue::TopicStats;
use trellis_registry::ServiceInstance;

/// Read-only snapshot of the whole mesh: every registry instance, per-topic
/// queue counts, and the state of every circuit breaker created so far.
/// Taking a snapshot never mutates anything.
#[derive(Debug, Clone, Serialize)]
pub struct MeshStatus {
    pub services: Vec<ServiceInstance>,
    pub queues: HashMap<String, TopicStats>,
    pub breakers: HashMap<String, BreakerSnapshot>,
}

impl MeshStatus {
    /// Instances currently registered under `name`.
    pub fn instances_of<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a ServiceInstance> + 'a {
        self.services.iter().filter(move |i| i.name == name)
    }
}
