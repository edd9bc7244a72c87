//! Admission control and throttling
//!
//! Keeps the crawler inside both the documented primary quota and the
//! inferred secondary (per-minute burst) limit.
//!
//! # Components
//!
//! - [`token_bucket`] - local burst smoothing, independent of server state
//! - [`circuit_breaker`] - fail-fast guard while the API is unhealthy
//! - [`adaptive`] - the [`AdaptiveRateLimiter`] composing both with quota headers
//! - [`headers`] - case-insensitive header map accepted by `update`
//! - [`config`] - tunables and their defaults

pub mod adaptive;
pub mod circuit_breaker;
pub mod config;
pub mod headers;
pub mod token_bucket;

pub use adaptive::{
    compute_delay, AdaptiveRateLimiter, ApiType, DelayDecision, QuotaSample, RateLimitState,
    RequestPermit, RequestPriority,
};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use config::RateLimitConfig;
pub use headers::RateLimitHeaders;
pub use token_bucket::TokenBucket;

/// Rate limiter errors
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// Circuit breaker still open after the re-check
    #[error("API unavailable: circuit breaker open")]
    BreakerOpen,

    /// A quota header could not be parsed
    #[error("invalid rate limit headers: {0}")]
    InvalidHeaders(String),

    /// The concurrency semaphore was closed
    #[error("rate limiter closed")]
    Closed,
}
