use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use trellis_common::{
    BreakerConfig, CircuitBreaker, EventBus, KeyValueStore, MeshError, MeshEvent, MessageId,
    Payload, RateLimit, RateLimitResult, RateLimiter, RemoteCaller, Result, TaskHandle,
};
use trellis_queue::{
    DeliveryLoop, HandlerId, MessageHandler, MessageQueue, PublishOptions, QueueConfig,
    RetentionSweeper,
};
use trellis_registry::{
    HealthStatus, HealthSweeper, LoadMetricsUpdate, RegistryConfig, ServiceInstance,
    ServiceRegistry,
};

use crate::status::MeshStatus;

/// Backoff shape for opt-in retries of transient call failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// First retry waits this long
    pub initial_backoff: Duration,
    /// Exponential backoff is capped at this value
    pub max_backoff: Duration,
    /// Each retry waits `previous * multiplier`
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// Construction-time mesh configuration; immutable afterwards.
#[derive(Debug, Clone, Default)]
pub struct MeshConfig {
    pub registry: RegistryConfig,
    pub queue: QueueConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    /// Window applied to every call that does not carry its own limit
    pub default_rate_limit: Option<RateLimit>,
}

/// Per-call options for [`ServiceMesh::call_service`].
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Outbound deadline; exceeding it cancels the call
    pub timeout: Duration,
    /// Extra attempts for transient failures. Breaker and rate-limit
    /// rejections are never retried.
    pub retries: u32,
    pub use_circuit_breaker: bool,
    pub rate_limit: Option<RateLimit>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 0,
            use_circuit_breaker: true,
            rate_limit: None,
        }
    }
}

/// The mesh entry point: mediates every outbound call through instance
/// selection, rate limiting and circuit breaking, and fronts the message
/// queue for event flows.
///
/// One mesh is constructed per process and shared by handle; there is no
/// implicit global instance.
pub struct ServiceMesh {
    config: MeshConfig,
    registry: Arc<ServiceRegistry>,
    queue: Arc<MessageQueue>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    rate_limiter: RateLimiter,
    caller: Arc<dyn RemoteCaller>,
    events: EventBus,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl ServiceMesh {
    pub fn new(config: MeshConfig, caller: Arc<dyn RemoteCaller>) -> Self {
        Self::build(config, caller, None)
    }

    pub fn with_store(
        config: MeshConfig,
        caller: Arc<dyn RemoteCaller>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self::build(config, caller, Some(store))
    }

    fn build(
        config: MeshConfig,
        caller: Arc<dyn RemoteCaller>,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Self {
        let events = EventBus::default();
        let (registry, queue) = match store {
            Some(store) => (
                ServiceRegistry::with_store(config.registry.clone(), events.clone(), store.clone()),
                MessageQueue::with_store(config.queue.clone(), events.clone(), store),
            ),
            None => (
                ServiceRegistry::new(config.registry.clone(), events.clone()),
                MessageQueue::new(config.queue.clone(), events.clone()),
            ),
        };

        Self {
            config,
            registry: Arc::new(registry),
            queue: Arc::new(queue),
            breakers: RwLock::new(HashMap::new()),
            rate_limiter: RateLimiter::new(),
            caller,
            events,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the background loops: registry health sweep, queue delivery
    /// tick and retention sweep. Calling `start` on a running mesh is a
    /// no-op.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        tasks.push(HealthSweeper::new(self.registry.clone()).spawn());
        tasks.push(DeliveryLoop::new(self.queue.clone()).spawn());
        tasks.push(RetentionSweeper::new(self.queue.clone()).spawn());
        info!("service mesh started");
    }

    /// Stop every background loop, waiting for in-flight ticks to finish.
    pub async fn stop(&self) {
        let handles = std::mem::take(&mut *self.tasks.lock().await);
        for handle in handles {
            handle.stop().await;
        }
        info!("service mesh stopped");
    }

    // ------------------------------------------------------------------
    // Registry surface
    // ------------------------------------------------------------------

    pub async fn register_service(&self, instance: ServiceInstance) {
        self.registry.register(instance).await;
    }

    pub async fn deregister_service(&self, id: &str) -> bool {
        self.registry.deregister(id).await
    }

    pub async fn update_service_health(
        &self,
        id: &str,
        metrics: LoadMetricsUpdate,
        status: Option<HealthStatus>,
    ) -> bool {
        self.registry.update_health(id, metrics, status).await
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Synchronous calls
    // ------------------------------------------------------------------

    /// Call `method` on a healthy instance of `name`.
    ///
    /// Selection, rate limiting and circuit breaking happen in that order;
    /// failures are surfaced as typed [`MeshError`]s so callers can fall
    /// back, queue the work instead, or report. With `retries > 0`,
    /// transient failures re-select an instance and retry with exponential
    /// backoff; deliberate rejections (rate-limited, breaker-open) are
    /// returned immediately.
    pub async fn call_service(
        &self,
        name: &str,
        method: &str,
        payload: Payload,
        options: CallOptions,
    ) -> Result<Payload> {
        let mut backoff = self.config.retry.initial_backoff;

        for attempt in 0..=options.retries {
            match self.dispatch(name, method, payload.clone(), &options).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < options.retries && e.is_transient() => {
                    warn!(
                        "call to {} failed (attempt {}/{}): {}, retrying in {:?}",
                        name,
                        attempt + 1,
                        options.retries + 1,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(
                        backoff.mul_f64(self.config.retry.backoff_multiplier),
                        self.config.retry.max_backoff,
                    );
                }
                Err(e) => return Err(e),
            }
        }

        unreachable!("retry loop always returns or errors")
    }

    async fn dispatch(
        &self,
        name: &str,
        method: &str,
        payload: Payload,
        options: &CallOptions,
    ) -> Result<Payload> {
        let instance = self
            .registry
            .select(name)
            .await
            .ok_or_else(|| MeshError::Unavailable(name.to_string()))?;

        if let Some(limit) = options.rate_limit.or(self.config.default_rate_limit) {
            if let RateLimitResult::RateLimited { retry_after } =
                self.rate_limiter.check(name, limit).await
            {
                debug!("call to {} rate limited for {:?}", name, retry_after);
                return Err(MeshError::RateLimited { retry_after });
            }
        }

        let address = instance.address();
        if options.use_circuit_breaker {
            let breaker = self.breaker(name).await;
            breaker
                .execute(|| self.caller.invoke(&address, method, payload, options.timeout))
                .await
        } else {
            self.caller
                .invoke(&address, method, payload, options.timeout)
                .await
        }
    }

    /// Breaker guarding `name`, created closed on first use.
    async fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, self.config.breaker.clone()))
            })
            .clone()
    }

    // ------------------------------------------------------------------
    // Event surface
    // ------------------------------------------------------------------

    pub async fn publish_event(
        &self,
        topic: &str,
        payload: Payload,
        options: PublishOptions,
    ) -> MessageId {
        self.queue.publish(topic, payload, options).await
    }

    pub async fn subscribe_to_event<H>(&self, topic: &str, handler: H) -> HandlerId
    where
        H: MessageHandler + 'static,
    {
        self.queue.subscribe(topic, handler).await
    }

    pub async fn unsubscribe_from_event(&self, topic: &str, id: Option<HandlerId>) -> bool {
        self.queue.unsubscribe(topic, id).await
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Receiver for the mesh's notification stream.
    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Snapshot of registry instances, queue stats and breaker states.
    pub async fn mesh_status(&self) -> MeshStatus {
        let services = self.registry.instances().await;
        let queues = self.queue.stats().await;

        let mut breakers = HashMap::new();
        for (name, breaker) in self.breakers.read().await.iter() {
            breakers.insert(name.clone(), breaker.snapshot().await);
        }

        MeshStatus {
            services,
            queues,
            breakers,
        }
    }
}
