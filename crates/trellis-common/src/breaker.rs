//! Circuit breaker for guarded dependencies.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: testing if the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: window volume reached and failure ratio over threshold
//! Open → Half-Open: first call at or after the reset deadline proceeds as probe
//! Half-Open → Closed: configured number of consecutive probe successes
//! Half-Open → Open: a single probe failure
//! ```
//!
//! One breaker guards one dependency name; the orchestrator keeps a map of
//! them. The admission decision and the outcome recording are each a single
//! critical section, so concurrent callers observe consistent transitions.
//! The guarded operation itself runs outside any lock.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{MeshError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation, requests flow through
    Closed,
    /// Circuit is tripped, requests fail fast without reaching the dependency
    Open,
    /// Testing if the dependency has recovered
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Fraction of the current window that must have failed to trip
    pub failure_threshold_ratio: f64,
    /// Minimum requests in the window before the ratio is evaluated
    pub volume_threshold: u32,
    /// How long an open circuit waits before admitting a probe
    pub reset_timeout: Duration,
    /// Consecutive probe successes required to close from half-open
    pub half_open_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold_ratio: 0.5,
            volume_threshold: 10,
            reset_timeout: Duration::from_secs(30),
            half_open_successes: 3,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    requests_in_window: u32,
    successes_since_half_open: u32,
    next_retry_at: Option<Instant>,
}

/// Point-in-time view of a breaker, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub requests_in_window: u32,
    pub successes_since_half_open: u32,
    /// Milliseconds until an open circuit admits a probe, if open
    pub retry_in_ms: Option<u64>,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                requests_in_window: 0,
                successes_since_half_open: 0,
                next_retry_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `op` under the breaker. Rejected immediately with
    /// [`MeshError::BreakerOpen`] while the circuit is open and the reset
    /// deadline has not passed; otherwise the outcome of `op` drives the
    /// state machine.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit().await?;
        match op().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure().await;
                Err(e)
            }
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            requests_in_window: inner.requests_in_window,
            successes_since_half_open: inner.successes_since_half_open,
            retry_in_ms: inner
                .next_retry_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }

    /// Decide whether a call may proceed. The deadline check and the
    /// open → half-open transition happen under one lock acquisition, so
    /// exactly one caller becomes the probe.
    async fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => match inner.next_retry_at {
                Some(at) if Instant::now() >= at => {
                    inner.state = BreakerState::HalfOpen;
                    inner.successes_since_half_open = 0;
                    inner.next_retry_at = None;
                    info!("circuit for {} half-open, probing", self.name);
                    Ok(())
                }
                _ => Err(MeshError::BreakerOpen(self.name.clone())),
            },
        }
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => {
                inner.requests_in_window += 1;
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.successes_since_half_open += 1;
                if inner.successes_since_half_open >= self.config.half_open_successes {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.requests_in_window = 0;
                    inner.successes_since_half_open = 0;
                    info!("circuit for {} closed after recovery", self.name);
                }
            }
            // a call admitted before the trip finished after it
            BreakerState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => {
                inner.requests_in_window += 1;
                inner.consecutive_failures += 1;
                let ratio =
                    f64::from(inner.consecutive_failures) / f64::from(inner.requests_in_window);
                if inner.requests_in_window >= self.config.volume_threshold
                    && ratio >= self.config.failure_threshold_ratio
                {
                    inner.state = BreakerState::Open;
                    inner.next_retry_at = Some(Instant::now() + self.config.reset_timeout);
                    warn!(
                        "circuit for {} opened after {}/{} failures in window",
                        self.name, inner.consecutive_failures, inner.requests_in_window
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.successes_since_half_open = 0;
                inner.next_retry_at = Some(Instant::now() + self.config.reset_timeout);
                warn!("probe for {} failed, circuit reopened", self.name);
            }
            BreakerState::Open => {}
        }
    }
}
