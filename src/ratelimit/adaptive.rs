//! Adaptive admission control for the remote API
//!
//! Combines a concurrency semaphore, a [`TokenBucket`], a [`CircuitBreaker`]
//! and the server-reported quota into a single `acquire` call. Every wait
//! happens with no lock held; the semaphore slot travels with the returned
//! [`RequestPermit`] and is freed on every path.

use super::circuit_breaker::CircuitBreaker;
use super::config::{RateLimitConfig, DEFAULT_PRIMARY_LIMIT};
use super::headers::{
    RateLimitHeaders, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
};
use super::token_bucket::TokenBucket;
use super::RateLimitError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

// Adaptive delay breakpoints (percent of quota remaining). Empirically tuned;
// keep as-is.
const PLENTY_PERCENT: f64 = 50.0;
const LOW_ONLY_PERCENT: f64 = 25.0;
const LINEAR_PERCENT: f64 = 10.0;
const STEEP_PERCENT: f64 = 5.0;
const EXHAUSTED_PERCENT: f64 = 1.0;

const LOW_PRIORITY_SCALE: f64 = 0.5;
const STEEP_EXPONENT: f64 = 1.5;
const CRITICAL_EXPONENT: f64 = 2.0;
const PRIORITY_STEP: f64 = 0.25;
const PRIORITY_OFFSET: f64 = 0.5;

/// Extra wait past `reset_at` so the server has certainly rolled the window.
const RESET_SAFETY_BUFFER: Duration = Duration::from_secs(1);

/// Secondary backoff multiplier growth per trip
const BACKOFF_GROWTH: f64 = 1.5;
/// Secondary backoff multiplier decay while the rate is under control
const BACKOFF_DECAY: f64 = 0.9;
/// Longest server-requested backoff honoured (one day)
const MAX_RETRY_AFTER_SECS: u64 = 86_400;
/// Hard cap on remembered request timestamps
const MAX_HISTORY: usize = 10_000;

/// API flavor, each with its own primary quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    /// REST endpoints
    Rest,
    /// Query-language (GraphQL) endpoint
    GraphQl,
}

impl ApiType {
    /// Stable lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::Rest => "rest",
            ApiType::GraphQl => "graphql",
        }
    }
}

impl fmt::Display for ApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request priority; only scales the computed delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    /// Must go out as soon as possible
    Critical = 0,
    /// Important
    High = 1,
    /// Default
    Medium = 2,
    /// Background work, first to yield
    Low = 3,
}

impl RequestPriority {
    /// Ordinal value (Critical = 0 .. Low = 3)
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Delay multiplier: 0.5 for Critical up to 1.25 for Low
    pub fn multiplier(&self) -> f64 {
        1.0 + f64::from(self.value()) * PRIORITY_STEP - PRIORITY_OFFSET
    }
}

/// Server-reported primary quota for one API flavor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitState {
    /// Quota size for the current window
    pub limit: u32,
    /// Requests left in the current window
    pub remaining: u32,
    /// When the window resets
    pub reset_at: DateTime<Utc>,
    /// When this state was last refreshed from headers
    pub last_updated: DateTime<Utc>,
}

impl RateLimitState {
    /// Provider defaults used until the first response arrives
    pub fn provider_default(now: DateTime<Utc>) -> Self {
        Self {
            limit: DEFAULT_PRIMARY_LIMIT,
            remaining: DEFAULT_PRIMARY_LIMIT,
            reset_at: now + chrono::Duration::hours(1),
            last_updated: now,
        }
    }

    /// Remaining quota as a percentage of the limit
    pub fn remaining_percent(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        f64::from(self.remaining) / f64::from(self.limit) * 100.0
    }

    /// Whole seconds until `reset_at` (never negative)
    pub fn seconds_until_reset(&self, now: DateTime<Utc>) -> i64 {
        (self.reset_at - now).num_seconds().max(0)
    }
}

/// Outcome of the adaptive delay calculation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DelayDecision {
    /// Send immediately
    Proceed,
    /// Sleep for a scaled delay, then send
    Sleep(Duration),
    /// Quota exhausted: sleep until the reset (plus buffer), then send
    WaitForReset(Duration),
}

impl DelayDecision {
    /// Time this decision waits
    pub fn duration(&self) -> Duration {
        match self {
            DelayDecision::Proceed => Duration::ZERO,
            DelayDecision::Sleep(d) | DelayDecision::WaitForReset(d) => *d,
        }
    }

    /// Whether this is the quota-exhausted branch
    pub fn is_reset_wait(&self) -> bool {
        matches!(self, DelayDecision::WaitForReset(_))
    }
}

/// Compute the delay for a request given the current quota.
///
/// `min_sleep` and `max_sleep` are in seconds.
pub fn compute_delay(
    state: &RateLimitState,
    priority: RequestPriority,
    min_sleep: f64,
    max_sleep: f64,
    now: DateTime<Utc>,
) -> DelayDecision {
    let pct = state.remaining_percent();
    let multiplier = priority.multiplier();

    if state.remaining == 0 || pct < EXHAUSTED_PERCENT {
        let until_reset = (state.reset_at - now).to_std().unwrap_or(Duration::ZERO);
        return DelayDecision::WaitForReset(until_reset + RESET_SAFETY_BUFFER);
    }

    let secs = if pct > PLENTY_PERCENT {
        0.0
    } else if pct > LOW_ONLY_PERCENT {
        if priority == RequestPriority::Low {
            let factor = (PLENTY_PERCENT - pct) / (PLENTY_PERCENT - LOW_ONLY_PERCENT);
            min_sleep * factor * LOW_PRIORITY_SCALE
        } else {
            0.0
        }
    } else if pct > LINEAR_PERCENT {
        let factor = (LOW_ONLY_PERCENT - pct) / (LOW_ONLY_PERCENT - LINEAR_PERCENT);
        min_sleep * factor * multiplier
    } else if pct > STEEP_PERCENT {
        let factor = (LINEAR_PERCENT - pct) / (LINEAR_PERCENT - STEEP_PERCENT);
        (min_sleep + (max_sleep - min_sleep) * factor.powf(STEEP_EXPONENT)) * multiplier
    } else {
        let factor = (STEEP_PERCENT - pct) / (STEEP_PERCENT - EXHAUSTED_PERCENT);
        max_sleep * factor.powf(CRITICAL_EXPONENT) * multiplier
    };

    if secs > 0.0 && secs.is_finite() {
        DelayDecision::Sleep(Duration::from_secs_f64(secs))
    } else {
        DelayDecision::Proceed
    }
}

/// Point-in-time quota snapshot kept for later analysis
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaSample {
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
    /// API flavor
    pub api_type: ApiType,
    /// Quota size
    pub limit: u32,
    /// Requests left
    pub remaining: u32,
    /// Requests left as a percentage
    pub remaining_percent: f64,
    /// Window reset time
    pub reset_at: DateTime<Utc>,
    /// Seconds until the reset
    pub seconds_until_reset: i64,
}

#[derive(Debug)]
struct SecondaryWindow {
    timestamps: VecDeque<Instant>,
    multiplier: f64,
}

/// Admission slot returned by [`AdaptiveRateLimiter::acquire`].
///
/// Hand it back through [`AdaptiveRateLimiter::release`]. Dropping it
/// unreleased frees the slot and records a failure with the breaker.
#[derive(Debug)]
pub struct RequestPermit {
    slot: Option<OwnedSemaphorePermit>,
    breaker: Arc<CircuitBreaker>,
    decision: DelayDecision,
    remaining_percent: f64,
}

impl RequestPermit {
    /// Delay decision applied while admitting this request
    pub fn decision(&self) -> DelayDecision {
        self.decision
    }

    /// Remaining quota percentage observed at admission
    pub fn remaining_percent(&self) -> f64 {
        self.remaining_percent
    }

    fn finish(&mut self, success: bool) {
        if self.slot.take().is_some() {
            if success {
                self.breaker.record_success();
            } else {
                self.breaker.record_failure();
            }
        }
    }
}

impl Drop for RequestPermit {
    fn drop(&mut self) {
        if self.slot.is_some() {
            debug!("Request permit dropped without release, recording failure");
            self.finish(false);
        }
    }
}

/// Adaptive rate limiter shared by every fetch loop
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    config: RateLimitConfig,
    semaphore: Arc<Semaphore>,
    bucket: TokenBucket,
    breaker: Arc<CircuitBreaker>,
    states: Mutex<HashMap<ApiType, RateLimitState>>,
    secondary: Mutex<SecondaryWindow>,
    samples: Mutex<Vec<QuotaSample>>,
    updates: AtomicU64,
}

impl AdaptiveRateLimiter {
    /// Create a limiter with provider-default quota for every API flavor
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Utc::now();
        let states = [ApiType::Rest, ApiType::GraphQl]
            .into_iter()
            .map(|api| (api, RateLimitState::provider_default(now)))
            .collect();

        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            bucket: TokenBucket::new(config.bucket_capacity, config.fill_rate),
            breaker: Arc::new(CircuitBreaker::new(
                config.failure_threshold,
                config.success_threshold,
                config.breaker_timeout(),
            )),
            states: Mutex::new(states),
            secondary: Mutex::new(SecondaryWindow {
                timestamps: VecDeque::new(),
                multiplier: 1.0,
            }),
            samples: Mutex::new(Vec::new()),
            updates: AtomicU64::new(0),
            config,
        }
    }

    /// Limiter configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Circuit breaker guarding the API
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Free concurrency slots
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Snapshot of the quota state for one API flavor
    pub fn state(&self, api_type: ApiType) -> RateLimitState {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states
            .get(&api_type)
            .cloned()
            .unwrap_or_else(|| RateLimitState::provider_default(Utc::now()))
    }

    /// Current secondary-limit backoff multiplier
    pub fn backoff_multiplier(&self) -> f64 {
        self.secondary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .multiplier
    }

    /// Admit one request.
    ///
    /// Suspends for the concurrency slot and for any throttling delay. Fails
    /// only when the circuit breaker is still open after the re-check.
    pub async fn acquire(
        &self,
        api_type: ApiType,
        priority: RequestPriority,
    ) -> Result<RequestPermit, RateLimitError> {
        let started = Instant::now();

        if !self.breaker.can_execute() {
            debug!(api = %api_type, "Circuit open, re-checking before failing");
            sleep(self.config.breaker_recheck()).await;
            if !self.breaker.can_execute() {
                warn!(api = %api_type, "API unavailable, circuit breaker open");
                return Err(RateLimitError::BreakerOpen);
            }
        }

        let slot = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RateLimitError::Closed)?;
        let mut permit = RequestPermit {
            slot: Some(slot),
            breaker: self.breaker.clone(),
            decision: DelayDecision::Proceed,
            remaining_percent: 100.0,
        };

        self.wait_for_token().await;

        let state = self.state(api_type);
        let decision = compute_delay(
            &state,
            priority,
            self.config.min_sleep_secs,
            self.config.max_sleep_secs,
            Utc::now(),
        );
        permit.decision = decision;
        permit.remaining_percent = state.remaining_percent();

        match decision {
            DelayDecision::Proceed => {}
            DelayDecision::Sleep(delay) => {
                debug!(
                    api = %api_type,
                    ?priority,
                    remaining_percent = permit.remaining_percent,
                    delay_ms = delay.as_millis() as u64,
                    "Adaptive delay"
                );
                sleep(delay).await;
            }
            DelayDecision::WaitForReset(delay) => {
                info!(
                    api = %api_type,
                    remaining = state.remaining,
                    limit = state.limit,
                    reset_at = %state.reset_at,
                    wait_secs = delay.as_secs(),
                    "Primary quota exhausted, waiting for reset"
                );
                sleep(delay).await;
            }
        }

        if let Some(pause) = self.secondary_pause() {
            warn!(
                pause_ms = pause.as_millis() as u64,
                multiplier = self.backoff_multiplier(),
                "Secondary rate limit pressure, backing off"
            );
            sleep(pause).await;
        }
        self.record_request();

        metrics::histogram!("acquire_wait_seconds", "api" => api_type.as_str())
            .record(started.elapsed().as_secs_f64());
        metrics::counter!("crawler_requests_total", "api" => api_type.as_str()).increment(1);

        Ok(permit)
    }

    /// Return a permit, reporting the outcome to the circuit breaker
    pub fn release(&self, mut permit: RequestPermit, success: bool) {
        permit.finish(success);
    }

    async fn wait_for_token(&self) {
        for attempt in 0..=self.config.token_retry_attempts {
            if self.bucket.try_acquire(1.0) {
                return;
            }
            if attempt < self.config.token_retry_attempts {
                sleep(self.config.token_retry_delay()).await;
            }
        }
        debug!("Token bucket still empty after retries, proceeding");
    }

    /// Decide whether the request rate needs a secondary-limit pause.
    ///
    /// Counts the pending request, so with a trip ceiling of 90 rpm the
    /// 91st request inside one window is the first to pause.
    fn secondary_pause(&self) -> Option<Duration> {
        let window = self.config.detection_window();
        let window_secs = window.as_secs_f64();
        let max_rpm = f64::from(self.config.max_requests_per_minute);
        let threshold = self.config.secondary_threshold;
        // Two levels: `warn_rpm` (max_rpm * threshold) only logs pressure;
        // `trip_rpm` sits halfway between it and max_rpm and is where the
        // pause starts. With 100 rpm and 0.8 that is 80 and 90.
        let warn_rpm = max_rpm * threshold;
        let trip_rpm = max_rpm * (1.0 + threshold) / 2.0;

        let mut w = self.secondary.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        while w
            .timestamps
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            w.timestamps.pop_front();
        }

        let count = w.timestamps.len() + 1;
        let rpm = count as f64 * 60.0 / window_secs;

        if rpm > trip_rpm {
            let oldest = w.timestamps.front().copied().unwrap_or(now);
            let ages_out = (oldest + window).saturating_duration_since(now);
            let pause = ages_out.mul_f64(w.multiplier).min(window);
            w.multiplier = (w.multiplier * BACKOFF_GROWTH).min(self.config.max_backoff_multiplier);
            metrics::counter!("secondary_limit_trips_total").increment(1);
            Some(pause)
        } else {
            if rpm > warn_rpm {
                debug!(rpm, warn_rpm, "Request rate above secondary threshold");
            } else {
                w.multiplier = (w.multiplier * BACKOFF_DECAY).max(1.0);
            }
            None
        }
    }

    fn record_request(&self) {
        let mut w = self.secondary.lock().unwrap_or_else(PoisonError::into_inner);
        w.timestamps.push_back(Instant::now());
        while w.timestamps.len() > MAX_HISTORY {
            w.timestamps.pop_front();
        }
    }

    /// Refresh quota state from response headers.
    ///
    /// `Retry-After` wins over the quota headers and forces the exhausted
    /// state. Responses without quota headers leave the state untouched.
    pub fn update(
        &self,
        headers: &RateLimitHeaders,
        api_type: ApiType,
    ) -> Result<(), RateLimitError> {
        let now = Utc::now();

        if let Some(raw) = headers.get(HEADER_RETRY_AFTER) {
            let retry_after: u64 = parse_header(HEADER_RETRY_AFTER, raw)?;
            let retry_after = retry_after.min(MAX_RETRY_AFTER_SECS) as i64;
            let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            let state = states
                .entry(api_type)
                .or_insert_with(|| RateLimitState::provider_default(now));
            state.remaining = 0;
            state.reset_at = now + chrono::Duration::seconds(retry_after);
            state.last_updated = now;
            warn!(api = %api_type, retry_after, "Server requested backoff via Retry-After");
        } else {
            let limit = headers
                .get(HEADER_LIMIT)
                .map(|raw| parse_header::<u32>(HEADER_LIMIT, raw))
                .transpose()?;
            let remaining = headers
                .get(HEADER_REMAINING)
                .map(|raw| parse_header::<u32>(HEADER_REMAINING, raw))
                .transpose()?;
            let reset_at = headers
                .get(HEADER_RESET)
                .map(|raw| {
                    let secs: i64 = parse_header(HEADER_RESET, raw)?;
                    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| {
                        RateLimitError::InvalidHeaders(format!(
                            "{HEADER_RESET} out of range: {secs}"
                        ))
                    })
                })
                .transpose()?;

            if limit.is_none() && remaining.is_none() && reset_at.is_none() {
                return Ok(());
            }

            let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            let state = states
                .entry(api_type)
                .or_insert_with(|| RateLimitState::provider_default(now));
            if let Some(limit) = limit {
                state.limit = limit;
            }
            if let Some(remaining) = remaining {
                state.remaining = remaining;
            }
            if let Some(reset_at) = reset_at {
                state.reset_at = reset_at;
            }
            state.remaining = state.remaining.min(state.limit);
            state.last_updated = now;

            metrics::gauge!("quota_remaining", "api" => api_type.as_str())
                .set(f64::from(state.remaining));
            debug!(
                api = %api_type,
                limit = state.limit,
                remaining = state.remaining,
                reset_at = %state.reset_at,
                "Quota updated from headers"
            );
        }

        let count = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
        if self.config.sample_every > 0 && count % self.config.sample_every == 0 {
            self.record_sample(api_type);
        }
        Ok(())
    }

    /// Record a quota snapshot for `api_type`
    pub fn record_sample(&self, api_type: ApiType) {
        let now = Utc::now();
        let state = self.state(api_type);
        let sample = QuotaSample {
            timestamp: now,
            api_type,
            limit: state.limit,
            remaining: state.remaining,
            remaining_percent: state.remaining_percent(),
            reset_at: state.reset_at,
            seconds_until_reset: state.seconds_until_reset(now),
        };
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample);
    }

    /// Quota samples recorded so far
    pub fn samples(&self) -> Vec<QuotaSample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop all recorded samples
    pub fn clear_samples(&self) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn parse_header<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, RateLimitError> {
    raw.trim()
        .parse()
        .map_err(|_| RateLimitError::InvalidHeaders(format!("{name}: {raw:?}")))
}
