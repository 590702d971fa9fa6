//! Mesh integration tests against real HTTP services.
//!
//! Each test spins up one or more mock services with axum and drives the
//! mesh end to end through the HTTP caller.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;

use trellis_common::{BreakerConfig, HttpCaller, MeshError, Payload, RateLimit};
use trellis_orchestrator::{CallOptions, MeshConfig, ServiceMesh};
use trellis_queue::QueueConfig;
use trellis_registry::{
    HealthStatus, LoadMetricsUpdate, RegistryConfig, ServiceInstance,
};

// ============================================================================
// Mock Service Server
// ============================================================================

/// A mock service that echoes request bodies and can be flipped unhealthy.
struct MockServiceServer {
    addr: SocketAddr,
    healthy: Arc<AtomicBool>,
    hits: Arc<AtomicU32>,
    _handle: tokio::task::JoinHandle<()>,
}

#[derive(Clone)]
struct MockState {
    healthy: Arc<AtomicBool>,
    hits: Arc<AtomicU32>,
}

async fn handle_call(
    State(state): State<MockState>,
    Path(_method): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if state.healthy.load(Ordering::SeqCst) {
        (StatusCode::OK, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"unhealthy"))
    }
}

impl MockServiceServer {
    async fn start() -> Self {
        let healthy = Arc::new(AtomicBool::new(true));
        let hits = Arc::new(AtomicU32::new(0));

        let app = Router::new()
            .route("/:method", post(handle_call))
            .with_state(MockState {
                healthy: healthy.clone(),
                hits: hits.clone(),
            });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock service");
        let addr = listener.local_addr().expect("mock service has no address");

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // give the server a moment to accept connections
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            addr,
            healthy,
            hits,
            _handle: handle,
        }
    }

    fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    fn port(&self) -> u16 {
        self.addr.port()
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn register_healthy(mesh: &ServiceMesh, id: &str, name: &str, server: &MockServiceServer) {
    mesh.register_service(ServiceInstance::new(id, name, server.host(), server.port()))
        .await;
    mesh.update_service_health(id, LoadMetricsUpdate::default(), Some(HealthStatus::Healthy))
        .await;
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn call_service_round_trips_over_http() {
    let server = MockServiceServer::start().await;
    let mesh = ServiceMesh::new(MeshConfig::default(), Arc::new(HttpCaller::new()));
    register_healthy(&mesh, "i-1", "pricing", &server).await;

    let response = mesh
        .call_service(
            "pricing",
            "quote",
            Payload::from_static(b"{\"sku\":42}"),
            CallOptions {
                timeout: Duration::from_secs(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(&response[..], b"{\"sku\":42}");
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn rate_limit_scenario_two_instances() {
    let server_a = MockServiceServer::start().await;
    let server_b = MockServiceServer::start().await;
    let mesh = ServiceMesh::new(MeshConfig::default(), Arc::new(HttpCaller::new()));
    register_healthy(&mesh, "i-a", "pricing", &server_a).await;
    register_healthy(&mesh, "i-b", "pricing", &server_b).await;

    let options = CallOptions {
        timeout: Duration::from_secs(2),
        rate_limit: Some(RateLimit::new(1, Duration::from_millis(1000))),
        ..Default::default()
    };

    // first call within the window succeeds
    mesh.call_service("pricing", "quote", Payload::from_static(b"{}"), options.clone())
        .await
        .unwrap();

    // second call within the same window is rejected
    let second = mesh
        .call_service("pricing", "quote", Payload::from_static(b"{}"), options.clone())
        .await;
    assert!(matches!(second, Err(MeshError::RateLimited { .. })));

    // after the window has elapsed the next call goes through
    tokio::time::sleep(Duration::from_millis(1050)).await;
    mesh.call_service("pricing", "quote", Payload::from_static(b"{}"), options)
        .await
        .unwrap();

    assert_eq!(server_a.hits() + server_b.hits(), 2);
}

#[tokio::test]
async fn failing_remote_trips_breaker_and_fails_fast() {
    let server = MockServiceServer::start().await;
    server.set_healthy(false);

    let config = MeshConfig {
        breaker: BreakerConfig {
            volume_threshold: 2,
            failure_threshold_ratio: 0.5,
            reset_timeout: Duration::from_secs(30),
            half_open_successes: 1,
        },
        ..Default::default()
    };
    let mesh = ServiceMesh::new(config, Arc::new(HttpCaller::new()));
    register_healthy(&mesh, "i-1", "billing", &server).await;

    let options = CallOptions {
        timeout: Duration::from_secs(2),
        ..Default::default()
    };

    for _ in 0..2 {
        let result = mesh
            .call_service("billing", "sync", Payload::from_static(b"{}"), options.clone())
            .await;
        assert!(matches!(result, Err(MeshError::Transport(_))));
    }
    assert_eq!(server.hits(), 2);

    // circuit open: the remote is no longer contacted
    let rejected = mesh
        .call_service("billing", "sync", Payload::from_static(b"{}"), options)
        .await;
    assert!(matches!(rejected, Err(MeshError::BreakerOpen(_))));
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn breaker_recovers_through_half_open_probe() {
    let server = MockServiceServer::start().await;
    server.set_healthy(false);

    let config = MeshConfig {
        breaker: BreakerConfig {
            volume_threshold: 2,
            failure_threshold_ratio: 0.5,
            reset_timeout: Duration::from_millis(100),
            half_open_successes: 1,
        },
        ..Default::default()
    };
    let mesh = ServiceMesh::new(config, Arc::new(HttpCaller::new()));
    register_healthy(&mesh, "i-1", "billing", &server).await;

    let options = CallOptions {
        timeout: Duration::from_secs(2),
        ..Default::default()
    };

    for _ in 0..2 {
        let _ = mesh
            .call_service("billing", "sync", Payload::from_static(b"{}"), options.clone())
            .await;
    }

    // dependency recovers while the circuit cools down
    server.set_healthy(true);
    tokio::time::sleep(Duration::from_millis(120)).await;

    // the probe goes through and closes the circuit again
    mesh.call_service("billing", "sync", Payload::from_static(b"{}"), options.clone())
        .await
        .unwrap();
    mesh.call_service("billing", "sync", Payload::from_static(b"{}"), options)
        .await
        .unwrap();
}

#[tokio::test]
async fn stale_heartbeat_makes_service_unavailable() {
    let server = MockServiceServer::start().await;
    let config = MeshConfig {
        registry: RegistryConfig {
            sweep_interval: Duration::from_millis(20),
            service_timeout: Duration::from_millis(50),
            ..Default::default()
        },
        ..Default::default()
    };
    let mesh = ServiceMesh::new(config, Arc::new(HttpCaller::new()));
    register_healthy(&mesh, "i-1", "pricing", &server).await;

    mesh.start().await;

    // while heartbeats are fresh the call succeeds
    mesh.call_service(
        "pricing",
        "quote",
        Payload::from_static(b"{}"),
        CallOptions {
            timeout: Duration::from_secs(2),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // no further heartbeats: the sweeper flags the instance
    tokio::time::sleep(Duration::from_millis(120)).await;
    let result = mesh
        .call_service(
            "pricing",
            "quote",
            Payload::from_static(b"{}"),
            CallOptions::default(),
        )
        .await;
    assert!(matches!(result, Err(MeshError::Unavailable(_))));

    mesh.stop().await;
}

#[tokio::test]
async fn background_delivery_feeds_subscribers() {
    let config = MeshConfig {
        queue: QueueConfig {
            tick_interval: Duration::from_millis(10),
            ..Default::default()
        },
        ..Default::default()
    };
    let mesh = ServiceMesh::new(config, Arc::new(HttpCaller::new()));

    let seen = Arc::new(AtomicU32::new(0));
    let counter = seen.clone();
    mesh.subscribe_to_event("tasks.created", move |_m: trellis_queue::QueueMessage| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await;

    mesh.start().await;
    mesh.publish_event(
        "tasks.created",
        Payload::from_static(b"{\"task\":9}"),
        Default::default(),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    mesh.stop().await;

    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
