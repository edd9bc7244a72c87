//! Rate limiter configuration and tuning constants

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of requests allowed in flight at once.
/// Secondary limits punish bursts of concurrent requests long before the
/// primary quota runs out, so this stays small.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default token bucket burst ceiling.
pub const DEFAULT_BUCKET_CAPACITY: f64 = 10.0;

/// Default sustained token fill rate (tokens per second).
pub const DEFAULT_FILL_RATE: f64 = 1.5;

/// Number of short sleeps spent waiting for a token before proceeding anyway.
pub const DEFAULT_TOKEN_RETRY_ATTEMPTS: u32 = 3;

/// Sleep between token bucket retries.
pub const DEFAULT_TOKEN_RETRY_DELAY_MS: u64 = 100;

/// Lower bound of the scaled adaptive delay (seconds).
pub const DEFAULT_MIN_SLEEP_SECS: f64 = 1.0;

/// Upper bound of the scaled adaptive delay (seconds).
pub const DEFAULT_MAX_SLEEP_SECS: f64 = 60.0;

/// Consecutive failures that open the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Consecutive half-open successes that close the circuit.
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

/// Time the circuit stays open before probing (seconds).
pub const DEFAULT_BREAKER_TIMEOUT_SECS: u64 = 60;

/// Pause before the second (final) circuit check in `acquire`.
pub const DEFAULT_BREAKER_RECHECK_MS: u64 = 1_000;

/// Inferred secondary limit (requests per minute).
pub const DEFAULT_MAX_REQUESTS_PER_MINUTE: u32 = 90;

/// Fraction of the secondary limit at which pressure is reported.
pub const DEFAULT_SECONDARY_THRESHOLD: f64 = 0.8;

/// Sliding window used to measure the request rate (seconds).
pub const DEFAULT_DETECTION_WINDOW_SECS: u64 = 60;

/// Ceiling for the secondary-limit backoff multiplier.
pub const DEFAULT_MAX_BACKOFF_MULTIPLIER: f64 = 8.0;

/// Record a quota sample every N successful header updates.
pub const DEFAULT_SAMPLE_EVERY: u64 = 10;

/// Provider default for the primary quota before the first response arrives.
pub const DEFAULT_PRIMARY_LIMIT: u32 = 5_000;

/// Largest accepted adaptive sleep (seconds).
pub const MAX_SLEEP_CEILING_SECS: f64 = 3_600.0;

/// Largest accepted secondary-limit detection window (seconds).
pub const MAX_DETECTION_WINDOW_SECS: u64 = 3_600;

/// Largest accepted secondary backoff multiplier.
pub const MAX_BACKOFF_MULTIPLIER_CEILING: f64 = 100.0;

/// Tunables for [`super::AdaptiveRateLimiter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum concurrent requests (semaphore size)
    pub max_concurrency: usize,
    /// Token bucket capacity
    pub bucket_capacity: f64,
    /// Token bucket fill rate in tokens per second
    pub fill_rate: f64,
    /// Token bucket retry attempts before proceeding regardless
    pub token_retry_attempts: u32,
    /// Delay between token bucket retries in milliseconds
    pub token_retry_delay_ms: u64,
    /// Minimum adaptive sleep in seconds
    pub min_sleep_secs: f64,
    /// Maximum adaptive sleep in seconds
    pub max_sleep_secs: f64,
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes
    pub success_threshold: u32,
    /// Seconds the circuit stays open before a probe is allowed
    pub breaker_timeout_secs: u64,
    /// Milliseconds to wait before re-checking an open circuit
    pub breaker_recheck_ms: u64,
    /// Inferred secondary limit in requests per minute
    pub max_requests_per_minute: u32,
    /// Fraction of the secondary limit treated as pressure
    pub secondary_threshold: f64,
    /// Secondary-limit detection window in seconds
    pub detection_window_secs: u64,
    /// Upper bound for the secondary backoff multiplier
    pub max_backoff_multiplier: f64,
    /// Record a quota sample every N successful updates (0 disables)
    pub sample_every: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            fill_rate: DEFAULT_FILL_RATE,
            token_retry_attempts: DEFAULT_TOKEN_RETRY_ATTEMPTS,
            token_retry_delay_ms: DEFAULT_TOKEN_RETRY_DELAY_MS,
            min_sleep_secs: DEFAULT_MIN_SLEEP_SECS,
            max_sleep_secs: DEFAULT_MAX_SLEEP_SECS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            breaker_timeout_secs: DEFAULT_BREAKER_TIMEOUT_SECS,
            breaker_recheck_ms: DEFAULT_BREAKER_RECHECK_MS,
            max_requests_per_minute: DEFAULT_MAX_REQUESTS_PER_MINUTE,
            secondary_threshold: DEFAULT_SECONDARY_THRESHOLD,
            detection_window_secs: DEFAULT_DETECTION_WINDOW_SECS,
            max_backoff_multiplier: DEFAULT_MAX_BACKOFF_MULTIPLIER,
            sample_every: DEFAULT_SAMPLE_EVERY,
        }
    }
}

impl RateLimitConfig {
    /// Breaker open timeout as a [`Duration`]
    pub fn breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.breaker_timeout_secs)
    }

    /// Breaker re-check pause as a [`Duration`]
    pub fn breaker_recheck(&self) -> Duration {
        Duration::from_millis(self.breaker_recheck_ms)
    }

    /// Token bucket retry pause as a [`Duration`]
    pub fn token_retry_delay(&self) -> Duration {
        Duration::from_millis(self.token_retry_delay_ms)
    }

    /// Validate tunables, typically after loading them from a file
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == 0 || self.max_concurrency > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(format!(
                "max_concurrency must be between 1 and {}, got {}",
                tokio::sync::Semaphore::MAX_PERMITS,
                self.max_concurrency
            ));
        }

        if !(self.bucket_capacity.is_finite() && self.bucket_capacity >= 1.0) {
            return Err(format!(
                "bucket_capacity must be a finite number >= 1, got {}",
                self.bucket_capacity
            ));
        }
        if !(self.fill_rate.is_finite() && self.fill_rate > 0.0) {
            return Err(format!(
                "fill_rate must be a finite positive number, got {}",
                self.fill_rate
            ));
        }

        for (name, value) in [
            ("min_sleep_secs", self.min_sleep_secs),
            ("max_sleep_secs", self.max_sleep_secs),
        ] {
            if !(value.is_finite() && (0.0..=MAX_SLEEP_CEILING_SECS).contains(&value)) {
                return Err(format!(
                    "{name} must be between 0 and {MAX_SLEEP_CEILING_SECS}, got {value}"
                ));
            }
        }
        if self.min_sleep_secs > self.max_sleep_secs {
            return Err(format!(
                "min_sleep_secs ({}) must not exceed max_sleep_secs ({})",
                self.min_sleep_secs, self.max_sleep_secs
            ));
        }

        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err("breaker thresholds must be at least 1".to_string());
        }

        if self.max_requests_per_minute == 0 {
            return Err("max_requests_per_minute must be at least 1".to_string());
        }
        if !(self.secondary_threshold > 0.0 && self.secondary_threshold <= 1.0) {
            return Err(format!(
                "secondary_threshold must be in (0, 1], got {}",
                self.secondary_threshold
            ));
        }
        if self.detection_window_secs > MAX_DETECTION_WINDOW_SECS {
            return Err(format!(
                "detection_window_secs must be at most {MAX_DETECTION_WINDOW_SECS}, got {}",
                self.detection_window_secs
            ));
        }
        if !(self.max_backoff_multiplier.is_finite()
            && (1.0..=MAX_BACKOFF_MULTIPLIER_CEILING).contains(&self.max_backoff_multiplier))
        {
            return Err(format!(
                "max_backoff_multiplier must be between 1 and {MAX_BACKOFF_MULTIPLIER_CEILING}, got {}",
                self.max_backoff_multiplier
            ));
        }

        Ok(())
    }

    /// Secondary-limit detection window as a [`Duration`]
    pub fn detection_window(&self) -> Duration {
        Duration::from_secs(self.detection_window_secs.max(1))
    }
}
