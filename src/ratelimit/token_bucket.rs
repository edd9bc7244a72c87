//! Token bucket for local burst smoothing
//!
//! Refills lazily on every call and never blocks. Callers that fail to get a
//! token decide for themselves whether to sleep and retry.

use std::sync::{Mutex, PoisonError};
use tokio::time::Instant;

/// Lazily refilled token bucket
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    fill_rate: f64,
    inner: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: f64, fill_rate: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * fill_rate).min(capacity);
        self.last_refill = now;
    }
}

impl TokenBucket {
    /// Create a full bucket
    ///
    /// # Arguments
    /// * `capacity` - Burst ceiling
    /// * `fill_rate` - Sustained refill in tokens per second
    pub fn new(capacity: f64, fill_rate: f64) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            fill_rate: fill_rate.max(0.0),
            inner: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Refill, then debit `n` tokens if they are available.
    ///
    /// Returns `false` without blocking when the bucket is short.
    pub fn try_acquire(&self, n: f64) -> bool {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.refill(self.capacity, self.fill_rate);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Tokens available right now (after a refill)
    pub fn available(&self) -> f64 {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.refill(self.capacity, self.fill_rate);
        state.tokens
    }

    /// Burst ceiling
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Sustained fill rate in tokens per second
    pub fn fill_rate(&self) -> f64 {
        self.fill_rate
    }
}
