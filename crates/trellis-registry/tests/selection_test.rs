//! Registry selection invariants across register/deregister sequences.

use std::time::Duration;

use trellis_common::EventBus;
use trellis_registry::{
    HealthStatus, LoadBalancingStrategy, LoadMetricsUpdate, RegistryConfig, ServiceInstance,
    ServiceRegistry,
};

fn registry(strategy: LoadBalancingStrategy) -> ServiceRegistry {
    ServiceRegistry::new(
        RegistryConfig {
            strategy,
            ..Default::default()
        },
        EventBus::default(),
    )
}

async fn register_healthy(registry: &ServiceRegistry, id: &str, name: &str) {
    registry
        .register(ServiceInstance::new(id, name, "localhost", 9000))
        .await;
    registry
        .update_health(id, LoadMetricsUpdate::default(), Some(HealthStatus::Healthy))
        .await;
}

#[tokio::test]
async fn select_never_returns_deregistered_or_unhealthy() {
    let registry = registry(LoadBalancingStrategy::RoundRobin);

    register_healthy(&registry, "a", "pricing").await;
    register_healthy(&registry, "b", "pricing").await;
    register_healthy(&registry, "c", "pricing").await;

    // interleave health flips and deregistrations with selections
    registry
        .update_health("b", LoadMetricsUpdate::default(), Some(HealthStatus::Unhealthy))
        .await;
    registry.deregister("c").await;

    for _ in 0..20 {
        let selected = registry.select("pricing").await.unwrap();
        assert_eq!(selected.status, HealthStatus::Healthy);
        assert_eq!(selected.id, "a");
    }

    registry.deregister("a").await;
    assert!(registry.select("pricing").await.is_none());

    // resurrect b and it becomes the only candidate
    registry
        .update_health("b", LoadMetricsUpdate::default(), Some(HealthStatus::Healthy))
        .await;
    assert_eq!(registry.select("pricing").await.unwrap().id, "b");
}

#[tokio::test]
async fn round_robin_is_fair_across_rapid_calls() {
    let registry = registry(LoadBalancingStrategy::RoundRobin);
    register_healthy(&registry, "a", "pricing").await;
    register_healthy(&registry, "b", "pricing").await;
    register_healthy(&registry, "c", "pricing").await;

    // no wall-clock dependence: 300 back-to-back calls land evenly
    let mut counts = std::collections::HashMap::new();
    for _ in 0..300 {
        let id = registry.select("pricing").await.unwrap().id;
        *counts.entry(id).or_insert(0u32) += 1;
    }
    assert_eq!(counts["a"], 100);
    assert_eq!(counts["b"], 100);
    assert_eq!(counts["c"], 100);
}

#[tokio::test]
async fn least_connections_deterministically_picks_idle_instance() {
    let registry = registry(LoadBalancingStrategy::LeastConnections);
    register_healthy(&registry, "a", "pricing").await;
    register_healthy(&registry, "b", "pricing").await;
    registry
        .update_health(
            "a",
            LoadMetricsUpdate {
                open_connections: Some(2),
                ..Default::default()
            },
            None,
        )
        .await;
    registry
        .update_health(
            "b",
            LoadMetricsUpdate {
                open_connections: Some(0),
                ..Default::default()
            },
            None,
        )
        .await;

    // A(2 conns), B(0 conns): deterministically B
    for _ in 0..10 {
        assert_eq!(registry.select("pricing").await.unwrap().id, "b");
    }
}

#[tokio::test]
async fn expiry_flags_but_never_deletes() {
    let registry = ServiceRegistry::new(
        RegistryConfig {
            service_timeout: Duration::from_millis(15),
            ..Default::default()
        },
        EventBus::default(),
    );
    register_healthy(&registry, "i-1", "pricing").await;
    assert_eq!(registry.len().await, 1);

    tokio::time::sleep(Duration::from_millis(25)).await;
    registry.sweep().await;

    assert_eq!(registry.len().await, 1, "expiry must not delete the record");
    assert!(registry.select("pricing").await.is_none());
}
