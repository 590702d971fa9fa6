use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use trellis_common::Metadata;

/// Health of a registered instance as the registry knows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Load figures an instance reports about itself via heartbeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadMetrics {
    /// CPU utilization, 0–100
    pub cpu: f64,
    /// Memory utilization, 0–100
    pub memory: f64,
    pub open_connections: u32,
    pub requests_per_second: f64,
}

/// Partial heartbeat update; `None` fields leave the current value alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadMetricsUpdate {
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub open_connections: Option<u32>,
    pub requests_per_second: Option<f64>,
}

impl LoadMetricsUpdate {
    pub fn apply(&self, metrics: &mut LoadMetrics) {
        if let Some(cpu) = self.cpu {
            metrics.cpu = cpu;
        }
        if let Some(memory) = self.memory {
            metrics.memory = memory;
        }
        if let Some(open_connections) = self.open_connections {
            metrics.open_connections = open_connections;
        }
        if let Some(rps) = self.requests_per_second {
            metrics.requests_per_second = rps;
        }
    }
}

/// One registered service instance. Owned exclusively by the registry and
/// mutated only through `register`, `deregister` and `update_health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    /// Logical service name instances are selected by
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub tags: HashSet<String>,
    pub metadata: Metadata,
    pub registered_at: SystemTime,
    pub last_heartbeat: SystemTime,
    pub status: HealthStatus,
    pub load: LoadMetrics,
    /// Registration sequence number, used for deterministic tie-breaks
    #[serde(skip)]
    pub(crate) seen: u64,
}

impl ServiceInstance {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            id: id.into(),
            name: name.into(),
            version: "0.0.0".to_string(),
            host: host.into(),
            port,
            tags: HashSet::new(),
            metadata: Metadata::new(),
            registered_at: now,
            last_heartbeat: now,
            status: HealthStatus::Unknown,
            load: LoadMetrics::default(),
            seen: 0,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_load(mut self, load: LoadMetrics) -> Self {
        self.load = load;
        self
    }

    /// Network address selection hands to the outbound caller.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// An instance expires once its heartbeat is older than the configured
    /// service timeout. Expiry flags, it never deletes.
    pub fn is_expired(&self, service_timeout: Duration, now: SystemTime) -> bool {
        now.duration_since(self.last_heartbeat)
            .map(|age| age > service_timeout)
            .unwrap_or(false)
    }

    /// Eligible for selection: explicitly healthy and not expired.
    pub fn is_selectable(&self, service_timeout: Duration, now: SystemTime) -> bool {
        self.status == HealthStatus::Healthy && !self.is_expired(service_timeout, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_creation() {
        let instance = ServiceInstance::new("i-1", "pricing", "10.0.0.5", 8080)
            .with_version("1.2.0")
            .with_tag("canary")
            .with_metadata("zone", "eu-1");

        assert_eq!(instance.id, "i-1");
        assert_eq!(instance.name, "pricing");
        assert_eq!(instance.address(), "10.0.0.5:8080");
        assert_eq!(instance.version, "1.2.0");
        assert!(instance.tags.contains("canary"));
        assert_eq!(instance.metadata.get("zone"), Some(&"eu-1".to_string()));
        assert_eq!(instance.status, HealthStatus::Unknown);
    }

    #[test]
    fn test_expiry() {
        let mut instance = ServiceInstance::new("i-1", "pricing", "localhost", 8080);
        let now = SystemTime::now();
        assert!(!instance.is_expired(Duration::from_secs(30), now));

        instance.last_heartbeat = now - Duration::from_secs(31);
        assert!(instance.is_expired(Duration::from_secs(30), now));
    }

    #[test]
    fn test_selectable_requires_healthy_and_fresh() {
        let mut instance = ServiceInstance::new("i-1", "pricing", "localhost", 8080);
        let now = SystemTime::now();
        let timeout = Duration::from_secs(30);

        // unknown status is not selectable
        assert!(!instance.is_selectable(timeout, now));

        instance.status = HealthStatus::Healthy;
        assert!(instance.is_selectable(timeout, now));

        instance.last_heartbeat = now - Duration::from_secs(31);
        assert!(!instance.is_selectable(timeout, now));
    }

    #[test]
    fn test_metrics_merge_is_partial() {
        let mut metrics = LoadMetrics {
            cpu: 50.0,
            memory: 40.0,
            open_connections: 7,
            requests_per_second: 12.5,
        };
        LoadMetricsUpdate {
            cpu: Some(75.0),
            open_connections: Some(9),
            ..Default::default()
        }
        .apply(&mut metrics);

        assert_eq!(metrics.cpu, 75.0);
        assert_eq!(metrics.memory, 40.0);
        assert_eq!(metrics.open_connections, 9);
        assert_eq!(metrics.requests_per_second, 12.5);
    }
}
