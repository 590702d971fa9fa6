//! Trellis Service Registry
//!
//! Tracks service instances and their health, selects among them with a
//! configurable load-balancing strategy, and flags instances whose
//! heartbeats go stale. An optional external key/value store mirrors the
//! records for cross-process visibility; the in-memory map stays
//! authoritative when the store is absent or failing.

pub mod instance;
pub mod registry;
pub mod sweeper;

pub use instance::{HealthStatus, LoadMetrics, LoadMetricsUpdate, ServiceInstance};
pub use registry::{LoadBalancingStrategy, RegistryConfig, ServiceRegistry};
pub use sweeper::HealthSweeper;
