//! Fixed-window rate limiting.
//!
//! The orchestrator counts calls per service name inside a fixed window: the
//! window opens on the first request, every request increments the counter,
//! and once the counter reaches the cap further requests are rejected until
//! the window's duration has elapsed, at which point the window resets.
//!
//! Limits are supplied per check, so different callers can apply different
//! caps to the same key without reconfiguring the limiter. Stale windows are
//! cleaned up periodically to bound memory.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Cap applied to one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Maximum requests admitted inside one window
    pub requests: u32,
    /// Window duration
    pub window: Duration,
}

impl RateLimit {
    pub fn new(requests: u32, window: Duration) -> Self {
        Self { requests, window }
    }
}

/// Result of a rate limit check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request is allowed
    Allowed,
    /// Request is rate limited
    RateLimited {
        /// Time until the current window resets
        retry_after: Duration,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Allowed => None,
            Self::RateLimited { retry_after } => Some(*retry_after),
        }
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
    duration: Duration,
}

/// Fixed-window request counter keyed by an arbitrary string (the mesh keys
/// windows by logical service name).
pub struct RateLimiter {
    windows: RwLock<HashMap<String, Window>>,
    last_cleanup: RwLock<Instant>,
    cleanup_interval: Duration,
    entry_ttl: Duration,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            last_cleanup: RwLock::new(Instant::now()),
            cleanup_interval: Duration::from_secs(60),
            entry_ttl: Duration::from_secs(300),
        }
    }

    /// Check and count one request against `key`'s current window.
    pub async fn check(&self, key: &str, limit: RateLimit) -> RateLimitResult {
        let now = Instant::now();

        {
            let mut last_cleanup = self.last_cleanup.write().await;
            if now.duration_since(*last_cleanup) >= self.cleanup_interval {
                self.cleanup_stale_windows(now).await;
                *last_cleanup = now;
            }
        }

        let mut windows = self.windows.write().await;
        let window = windows.entry(key.to_string()).or_insert_with(|| Window {
            started: now,
            count: 0,
            duration: limit.window,
        });

        // the window auto-resets once its duration has elapsed
        if now.duration_since(window.started) >= limit.window {
            window.started = now;
            window.count = 0;
        }
        window.duration = limit.window;

        if window.count >= limit.requests {
            let elapsed = now.duration_since(window.started);
            RateLimitResult::RateLimited {
                retry_after: limit.window.saturating_sub(elapsed),
            }
        } else {
            window.count += 1;
            RateLimitResult::Allowed
        }
    }

    async fn cleanup_stale_windows(&self, now: Instant) {
        let entry_ttl = self.entry_ttl;
        let mut windows = self.windows.write().await;
        windows.retain(|_, w| now.duration_since(w.started) < w.duration + entry_ttl);
    }

    /// Number of keys currently tracked, for tests and monitoring.
    pub async fn tracked_key_count(&self) -> usize {
        self.windows.read().await.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
