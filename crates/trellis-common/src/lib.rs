//! Trellis Common Types
//!
//! This crate provides the shared building blocks for the trellis in-process
//! service mesh runtime:
//!
//! - **Errors**: the [`MeshError`] taxonomy every component speaks
//! - **Events**: the closed [`MeshEvent`] set and its broadcast [`EventBus`]
//! - **Store**: the optional external [`KeyValueStore`] collaborator
//! - **Breaker**: the per-dependency [`CircuitBreaker`] state machine
//! - **Rate limiting**: the fixed-window [`RateLimiter`]
//! - **Transport**: the [`RemoteCaller`] outbound-call seam and its HTTP
//!   implementation
//!
//! The registry, queue and orchestrator crates build on these; nothing here
//! owns a background task or a map of mesh state.

pub mod breaker;
pub mod error;
pub mod event;
pub mod rate_limit;
pub mod store;
pub mod task;
pub mod transport;

pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use error::{MeshError, Result};
pub use event::{EventBus, MeshEvent};
pub use rate_limit::{RateLimit, RateLimitResult, RateLimiter};
pub use store::{KeyValueStore, MemoryStore};
pub use task::TaskHandle;
pub use transport::{HttpCaller, RemoteCaller};

/// Opaque message/request payload. Interpretation is the caller's business.
pub type Payload = bytes::Bytes;

/// Free-form string metadata attached to instances and messages.
pub type Metadata = std::collections::HashMap<String, String>;

/// Unique id assigned to each published message.
pub type MessageId = u64;
