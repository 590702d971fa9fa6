use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("no healthy instance available for service: {0}")]
    Unavailable(String),

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("circuit breaker open for dependency: {0}")]
    BreakerOpen(String),

    #[error("request timeout after {0}ms")]
    Timeout(u64),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Transient failures may succeed against another instance or after a
    /// backoff; breaker and rate-limit rejections are deliberate and must
    /// surface to the caller unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MeshError::Unavailable(_) | MeshError::Timeout(_) | MeshError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
