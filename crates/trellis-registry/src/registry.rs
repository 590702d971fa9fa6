use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::sync::RwLock;
use tracing::{info, warn};

use trellis_common::{EventBus, KeyValueStore, MeshEvent};

use crate::instance::{HealthStatus, LoadMetricsUpdate, ServiceInstance};

/// How `select` picks among the healthy instances of a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancingStrategy {
    /// Deterministic rotation driven by a per-name counter
    #[default]
    RoundRobin,
    /// Instance with the fewest open connections
    LeastConnections,
    /// Probability proportional to available cpu and memory headroom
    Weighted,
    /// Uniform pick
    Random,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Selection strategy, fixed at construction
    pub strategy: LoadBalancingStrategy,
    /// How often the health sweeper runs
    pub sweep_interval: Duration,
    /// Heartbeat age past which an instance is marked unhealthy
    pub service_timeout: Duration,
    /// TTL on store entries, so a crashed process's records self-expire
    pub store_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            sweep_interval: Duration::from_secs(5),
            service_timeout: Duration::from_secs(30),
            store_ttl: Duration::from_secs(60),
        }
    }
}

/// Tracks known service instances and their health. The in-memory map is
/// authoritative; the external store, when present, is a best-effort mirror
/// for cross-process visibility.
pub struct ServiceRegistry {
    config: RegistryConfig,
    instances: RwLock<HashMap<String, ServiceInstance>>,
    rr_counters: RwLock<HashMap<String, u64>>,
    next_seen: AtomicU64,
    store: Option<Arc<dyn KeyValueStore>>,
    events: EventBus,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig, events: EventBus) -> Self {
        Self {
            config,
            instances: RwLock::new(HashMap::new()),
            rr_counters: RwLock::new(HashMap::new()),
            next_seen: AtomicU64::new(0),
            store: None,
            events,
        }
    }

    pub fn with_store(
        config: RegistryConfig,
        events: EventBus,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            store: Some(store),
            ..Self::new(config, events)
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Insert or overwrite an instance by id. Registration stamps the
    /// timestamps and resets status to `Unknown`; a re-registered id keeps
    /// its first-seen position.
    pub async fn register(&self, mut instance: ServiceInstance) {
        let now = SystemTime::now();
        instance.registered_at = now;
        instance.last_heartbeat = now;
        instance.status = HealthStatus::Unknown;

        let (id, name) = (instance.id.clone(), instance.name.clone());
        {
            let mut instances = self.instances.write().await;
            instance.seen = match instances.get(&id) {
                Some(existing) => existing.seen,
                None => self.next_seen.fetch_add(1, Ordering::Relaxed),
            };
            instances.insert(id.clone(), instance.clone());
        }

        self.persist(&instance).await;
        info!("registered service instance {} for {}", id, name);
        self.events.emit(MeshEvent::ServiceRegistered { id, name });
    }

    /// Remove an instance and its store entry. Unknown ids are a no-op;
    /// returns whether anything was removed.
    pub async fn deregister(&self, id: &str) -> bool {
        let removed = self.instances.write().await.remove(id);
        let Some(instance) = removed else {
            return false;
        };

        self.unpersist(&instance).await;
        info!(
            "deregistered service instance {} for {}",
            instance.id, instance.name
        );
        self.events.emit(MeshEvent::ServiceDeregistered {
            id: instance.id,
            name: instance.name,
        });
        true
    }

    /// Heartbeat: refresh `last_heartbeat`, merge the provided load metrics
    /// and optionally set the status. Unknown ids are a no-op; returns
    /// whether the instance was found.
    pub async fn update_health(
        &self,
        id: &str,
        metrics: LoadMetricsUpdate,
        status: Option<HealthStatus>,
    ) -> bool {
        let updated = {
            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(id) else {
                return false;
            };
            instance.last_heartbeat = SystemTime::now();
            metrics.apply(&mut instance.load);
            if let Some(status) = status {
                instance.status = status;
            }
            instance.clone()
        };

        // a heartbeat also refreshes the store TTL
        self.persist(&updated).await;
        true
    }

    /// Pick one healthy, non-expired instance of `name` according to the
    /// configured strategy, or `None` when nothing is eligible. Ties in the
    /// deterministic strategies break toward the first-seen instance.
    pub async fn select(&self, name: &str) -> Option<ServiceInstance> {
        let now = SystemTime::now();
        let instances = self.instances.read().await;
        let mut healthy: Vec<&ServiceInstance> = instances
            .values()
            .filter(|i| i.name == name && i.is_selectable(self.config.service_timeout, now))
            .collect();
        if healthy.is_empty() {
            return None;
        }
        healthy.sort_by_key(|i| i.seen);

        let chosen = match self.config.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let mut counters = self.rr_counters.write().await;
                let counter = counters.entry(name.to_string()).or_insert(0);
                let index = (*counter % healthy.len() as u64) as usize;
                *counter = counter.wrapping_add(1);
                healthy[index]
            }
            LoadBalancingStrategy::LeastConnections => {
                let mut best = healthy[0];
                for candidate in &healthy[1..] {
                    if candidate.load.open_connections < best.load.open_connections {
                        best = *candidate;
                    }
                }
                best
            }
            LoadBalancingStrategy::Weighted => Self::weighted_pick(&healthy),
            LoadBalancingStrategy::Random => {
                healthy[rand::thread_rng().gen_range(0..healthy.len())]
            }
        };

        Some(chosen.clone())
    }

    fn weight(instance: &ServiceInstance) -> f64 {
        // floor each factor so a saturated instance keeps a residual chance
        let cpu = (1.0 - instance.load.cpu / 100.0).max(0.1);
        let memory = (1.0 - instance.load.memory / 100.0).max(0.1);
        cpu * memory
    }

    fn weighted_pick<'a>(healthy: &[&'a ServiceInstance]) -> &'a ServiceInstance {
        let total: f64 = healthy.iter().map(|i| Self::weight(i)).sum();
        let mut remaining = rand::thread_rng().gen::<f64>() * total;
        for instance in healthy {
            remaining -= Self::weight(instance);
            if remaining <= 0.0 {
                return *instance;
            }
        }
        healthy[healthy.len() - 1]
    }

    /// Snapshot of every known instance in first-seen order.
    pub async fn instances(&self) -> Vec<ServiceInstance> {
        let instances = self.instances.read().await;
        let mut all: Vec<ServiceInstance> = instances.values().cloned().collect();
        all.sort_by_key(|i| i.seen);
        all
    }

    /// Snapshot of the instances registered under `name`.
    pub async fn instances_of(&self, name: &str) -> Vec<ServiceInstance> {
        let instances = self.instances.read().await;
        let mut matching: Vec<ServiceInstance> = instances
            .values()
            .filter(|i| i.name == name)
            .cloned()
            .collect();
        matching.sort_by_key(|i| i.seen);
        matching
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// One health-sweep pass: flag instances whose heartbeat exceeded the
    /// service timeout. The transition fires its notification exactly once;
    /// an already-unhealthy instance is left alone.
    pub async fn sweep(&self) {
        let now = SystemTime::now();
        let mut transitioned = Vec::new();
        {
            let mut instances = self.instances.write().await;
            for instance in instances.values_mut() {
                if instance.status != HealthStatus::Unhealthy
                    && instance.is_expired(self.config.service_timeout, now)
                {
                    instance.status = HealthStatus::Unhealthy;
                    transitioned.push((instance.id.clone(), instance.name.clone()));
                }
            }
        }

        for (id, name) in transitioned {
            warn!("service instance {} for {} missed its heartbeat deadline", id, name);
            self.events.emit(MeshEvent::ServiceUnhealthy { id, name });
        }
    }

    fn store_key(name: &str, id: &str) -> String {
        format!("trellis/registry/{}/{}", name, id)
    }

    async fn persist(&self, instance: &ServiceInstance) {
        let Some(store) = &self.store else { return };
        let key = Self::store_key(&instance.name, &instance.id);
        match serde_json::to_string(instance) {
            Ok(value) => {
                if let Err(e) = store.set(&key, value, Some(self.config.store_ttl)).await {
                    warn!("failed to propagate {} to store: {}", instance.id, e);
                }
            }
            Err(e) => warn!("failed to encode {} for store: {}", instance.id, e),
        }
    }

    async fn unpersist(&self, instance: &ServiceInstance) {
        let Some(store) = &self.store else { return };
        let key = Self::store_key(&instance.name, &instance.id);
        if let Err(e) = store.delete(&key).await {
            warn!("failed to remove {} from store: {}", instance.id, e);
        }
    }
}
