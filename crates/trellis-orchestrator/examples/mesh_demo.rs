//! End-to-end demo: a tiny HTTP echo service fronted by the mesh.
//!
//! Run with `cargo run --example mesh_demo -p trellis-orchestrator`.

use std::sync::Arc;
use std::time::Duration;

use axum::{body::Bytes, routing::post, Router};
use tracing::info;

use trellis_common::{HttpCaller, Payload, RateLimit};
use trellis_orchestrator::{CallOptions, MeshConfig, ServiceMesh};
use trellis_queue::QueueMessage;
use trellis_registry::{HealthStatus, LoadMetricsUpdate, ServiceInstance};

async fn echo(body: Bytes) -> Bytes {
    body
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // a stand-in remote service
    let app = Router::new().route("/:method", post(echo));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mesh = ServiceMesh::new(MeshConfig::default(), Arc::new(HttpCaller::new()));
    mesh.start().await;

    mesh.register_service(ServiceInstance::new(
        "pricing-1",
        "pricing",
        addr.ip().to_string(),
        addr.port(),
    ))
    .await;
    mesh.update_service_health(
        "pricing-1",
        LoadMetricsUpdate::default(),
        Some(HealthStatus::Healthy),
    )
    .await;

    let response = mesh
        .call_service(
            "pricing",
            "quote",
            Payload::from_static(b"{\"sku\":42}"),
            CallOptions {
                timeout: Duration::from_secs(2),
                rate_limit: Some(RateLimit::new(10, Duration::from_secs(1))),
                ..Default::default()
            },
        )
        .await?;
    info!("pricing responded: {}", String::from_utf8_lossy(&response));

    mesh.subscribe_to_event("tasks.created", |message: QueueMessage| async move {
        info!(
            "task event {} received: {}",
            message.id,
            String::from_utf8_lossy(&message.payload)
        );
        Ok(())
    })
    .await;
    mesh.publish_event(
        "tasks.created",
        Payload::from_static(b"{\"title\":\"water the plants\"}"),
        Default::default(),
    )
    .await;

    // let the delivery loop pick the event up
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = mesh.mesh_status().await;
    info!("mesh status: {}", serde_json::to_string_pretty(&status)?);

    mesh.stop().await;
    Ok(())
}
