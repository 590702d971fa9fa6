//! Trellis Service Mesh Orchestrator
//!
//! The orchestrator composes the registry, queue, per-dependency circuit
//! breakers and a fixed-window rate limiter behind a single entry point:
//!
//! 1. **Instance selection**: pick a healthy instance of the logical name
//! 2. **Rate limiting**: count the call against the name's window
//! 3. **Circuit breaking**: guard the outbound call per dependency
//! 4. **Invocation**: hand address, method and payload to the
//!    [`RemoteCaller`](trellis_common::RemoteCaller) with a deadline
//!
//! Event flows (`publish_event` / `subscribe_to_event`) pass straight
//! through to the queue, whose delivery loop the mesh starts and stops
//! alongside the registry's health sweeper.

pub mod orchestrator;
pub mod status;

pub use orchestrator::{CallOptions, MeshConfig, RetryConfig, ServiceMesh};
pub use status::MeshStatus;
