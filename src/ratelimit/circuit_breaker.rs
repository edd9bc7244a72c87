//! Circuit breaker guarding the remote API
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: API assumed unhealthy, requests fail fast
//! - HalfOpen: probing whether the API recovered
//!
//! # State Transitions
//! ```text
//! Closed   -> Open:     failure_threshold consecutive failures
//! Open     -> HalfOpen: timeout elapsed since the last failure (taken inside can_execute)
//! HalfOpen -> Closed:   success_threshold consecutive successes
//! HalfOpen -> Open:     any failure
//! ```

use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast
    Open,
    /// Probing recovery
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Three-state circuit breaker for one logical dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    ///
    /// # Arguments
    /// * `failure_threshold` - Consecutive failures that open the circuit
    /// * `success_threshold` - Consecutive half-open successes that close it
    /// * `timeout` - How long the circuit stays open before a probe
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a request may be sent.
    ///
    /// In the open state this moves the circuit to half-open once the
    /// timeout has elapsed.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(self.timeout);
                if elapsed >= self.timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    info!("Circuit breaker half-open, probing API");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful request
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.success_count = 0;
                    inner.failure_count = 0;
                    info!("Circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    metrics::counter!("circuit_open_total").increment(1);
                    warn!(
                        failures = inner.failure_count,
                        "Circuit breaker opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                metrics::counter!("circuit_open_total").increment(1);
                warn!("Probe failed, circuit breaker reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Consecutive failures counted while closed
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Consecutive successes counted while half-open
    pub fn success_count(&self) -> u32 {
        self.lock().success_count
    }
}
