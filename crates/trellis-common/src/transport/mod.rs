//! Outbound call collaborator.
//!
//! The orchestrator never speaks a wire protocol itself; it hands the
//! selected instance's address, a method name and the opaque payload to a
//! [`RemoteCaller`]. The default implementation is [`HttpCaller`]; tests and
//! embedders substitute their own.

pub mod http;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::Payload;

#[async_trait]
pub trait RemoteCaller: Send + Sync {
    /// Invoke `method` on the service instance at `address`, enforcing
    /// `timeout` via cancellation. Exceeding the deadline must surface as
    /// [`crate::MeshError::Timeout`].
    async fn invoke(
        &self,
        address: &str,
        method: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Payload>;
}

pub use http::HttpCaller;
