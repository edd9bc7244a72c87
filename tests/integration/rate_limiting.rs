//! Integration tests for admission control under paused time

use crate::support::quiet_rate_limit;
use chrono::Utc;
use repo_crawler::ratelimit::{
    AdaptiveRateLimiter, ApiType, CircuitState, RateLimitConfig, RateLimitError,
    RateLimitHeaders, RequestPriority,
};
use std::time::Duration;
use tokio::time::Instant;

fn quota_headers(limit: u32, remaining: u32, reset_in_secs: i64) -> RateLimitHeaders {
    let reset = Utc::now().timestamp() + reset_in_secs;
    [
        ("X-RateLimit-Limit", limit.to_string()),
        ("X-RateLimit-Remaining", remaining.to_string()),
        ("X-RateLimit-Reset", reset.to_string()),
    ]
    .into_iter()
    .collect()
}

#[tokio::test(start_paused = true)]
async fn test_nearly_exhausted_quota_waits_for_reset() {
    let limiter = AdaptiveRateLimiter::new(quiet_rate_limit());
    // 40 of 5000 is 0.8%
    limiter
        .update(&quota_headers(5_000, 40, 120), ApiType::Rest)
        .unwrap();

    let start = Instant::now();
    let permit = limiter
        .acquire(ApiType::Rest, RequestPriority::Critical)
        .await
        .unwrap();

    assert!(permit.decision().is_reset_wait());
    assert!(start.elapsed() >= Duration::from_secs(119));
    assert!(start.elapsed() <= Duration::from_secs(122));
    limiter.release(permit, true);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_branch_holds_until_headers_change() {
    let limiter = AdaptiveRateLimiter::new(quiet_rate_limit());
    limiter
        .update(&quota_headers(5_000, 40, 120), ApiType::Rest)
        .unwrap();

    for _ in 0..5 {
        let permit = limiter
            .acquire(ApiType::Rest, RequestPriority::Low)
            .await
            .unwrap();
        assert!(permit.decision().is_reset_wait());
        assert!((permit.remaining_percent() - 0.8).abs() < 1e-9);
        limiter.release(permit, true);
    }

    limiter
        .update(&quota_headers(5_000, 5_000, 3_600), ApiType::Rest)
        .unwrap();
    let permit = limiter
        .acquire(ApiType::Rest, RequestPriority::Low)
        .await
        .unwrap();
    assert!(!permit.decision().is_reset_wait());
    limiter.release(permit, true);
}

#[tokio::test(start_paused = true)]
async fn test_quotas_are_tracked_per_api() {
    let limiter = AdaptiveRateLimiter::new(quiet_rate_limit());
    limiter
        .update(&quota_headers(5_000, 0, 600), ApiType::GraphQl)
        .unwrap();

    let start = Instant::now();
    let permit = limiter
        .acquire(ApiType::Rest, RequestPriority::Low)
        .await
        .unwrap();
    assert_eq!(start.elapsed(), Duration::ZERO);
    limiter.release(permit, true);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_blocks_next_acquire() {
    let limiter = AdaptiveRateLimiter::new(quiet_rate_limit());
    let headers: RateLimitHeaders = [("retry-after", "30")].into_iter().collect();
    limiter.update(&headers, ApiType::Rest).unwrap();
    assert_eq!(limiter.state(ApiType::Rest).remaining, 0);

    let start = Instant::now();
    let permit = limiter
        .acquire(ApiType::Rest, RequestPriority::High)
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_secs(29));
    assert!(permit.decision().is_reset_wait());
    limiter.release(permit, true);
}

#[tokio::test(start_paused = true)]
async fn test_lower_priority_waits_longer_when_quota_is_low() {
    let limiter = AdaptiveRateLimiter::new(quiet_rate_limit());
    // 17.5% remaining
    limiter
        .update(&quota_headers(10_000, 1_750, 3_600), ApiType::Rest)
        .unwrap();

    let start = Instant::now();
    let permit = limiter
        .acquire(ApiType::Rest, RequestPriority::Critical)
        .await
        .unwrap();
    let critical = start.elapsed();
    limiter.release(permit, true);

    let start = Instant::now();
    let permit = limiter
        .acquire(ApiType::Rest, RequestPriority::Low)
        .await
        .unwrap();
    let low = start.elapsed();
    limiter.release(permit, true);

    assert!(critical > Duration::ZERO);
    assert!(low > critical);
}

#[tokio::test(start_paused = true)]
async fn test_secondary_limit_trips_on_91st_request() {
    let limiter = AdaptiveRateLimiter::new(RateLimitConfig {
        max_requests_per_minute: 100,
        secondary_threshold: 0.8,
        ..quiet_rate_limit()
    });

    let start = Instant::now();
    for _ in 0..90 {
        let permit = limiter
            .acquire(ApiType::Rest, RequestPriority::Medium)
            .await
            .unwrap();
        limiter.release(permit, true);
    }
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(limiter.backoff_multiplier(), 1.0);

    let permit = limiter
        .acquire(ApiType::Rest, RequestPriority::Medium)
        .await
        .unwrap();
    limiter.release(permit, true);

    // The first request ages out of the 60s window
    assert!(start.elapsed() >= Duration::from_secs(59));
    assert!(start.elapsed() <= Duration::from_secs(60));
    assert!((limiter.backoff_multiplier() - 1.5).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_multiplier_decays_once_rate_drops() {
    let limiter = AdaptiveRateLimiter::new(RateLimitConfig {
        max_requests_per_minute: 10,
        secondary_threshold: 0.8,
        ..quiet_rate_limit()
    });

    for _ in 0..10 {
        let permit = limiter
            .acquire(ApiType::Rest, RequestPriority::Medium)
            .await
            .unwrap();
        limiter.release(permit, true);
    }
    let tripped = limiter.backoff_multiplier();
    assert!(tripped > 1.0);
    assert!(tripped <= limiter.config().max_backoff_multiplier);

    // Let the whole window age out
    tokio::time::sleep(Duration::from_secs(61)).await;
    let permit = limiter
        .acquire(ApiType::Rest, RequestPriority::Medium)
        .await
        .unwrap();
    limiter.release(permit, true);
    assert!(limiter.backoff_multiplier() < tripped);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_cap_blocks_until_release() {
    let limiter = AdaptiveRateLimiter::new(RateLimitConfig {
        max_concurrency: 2,
        ..quiet_rate_limit()
    });

    let first = limiter
        .acquire(ApiType::Rest, RequestPriority::Medium)
        .await
        .unwrap();
    let second = limiter
        .acquire(ApiType::Rest, RequestPriority::Medium)
        .await
        .unwrap();
    assert_eq!(limiter.available_permits(), 0);

    let blocked = tokio::time::timeout(
        Duration::from_secs(5),
        limiter.acquire(ApiType::Rest, RequestPriority::Critical),
    )
    .await;
    assert!(blocked.is_err());

    limiter.release(first, true);
    let third = tokio::time::timeout(
        Duration::from_secs(5),
        limiter.acquire(ApiType::Rest, RequestPriority::Critical),
    )
    .await
    .expect("slot should be free after release")
    .unwrap();

    limiter.release(second, true);
    limiter.release(third, true);
    assert_eq!(limiter.available_permits(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_fails_fast_and_recovers() {
    let limiter = AdaptiveRateLimiter::new(RateLimitConfig {
        failure_threshold: 2,
        success_threshold: 1,
        breaker_timeout_secs: 30,
        ..quiet_rate_limit()
    });

    for _ in 0..2 {
        let permit = limiter
            .acquire(ApiType::Rest, RequestPriority::Medium)
            .await
            .unwrap();
        limiter.release(permit, false);
    }
    assert_eq!(limiter.breaker().state(), CircuitState::Open);

    let err = limiter
        .acquire(ApiType::Rest, RequestPriority::Critical)
        .await
        .unwrap_err();
    assert!(matches!(err, RateLimitError::BreakerOpen));

    tokio::time::sleep(Duration::from_secs(31)).await;
    let probe = limiter
        .acquire(ApiType::Rest, RequestPriority::Medium)
        .await
        .unwrap();
    limiter.release(probe, true);
    assert_eq!(limiter.breaker().state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_quota_samples_follow_updates() {
    let limiter = AdaptiveRateLimiter::new(RateLimitConfig {
        sample_every: 2,
        ..quiet_rate_limit()
    });

    for remaining in [4_000, 3_000, 2_000, 1_000] {
        limiter
            .update(&quota_headers(5_000, remaining, 900), ApiType::Rest)
            .unwrap();
    }

    let samples = limiter.samples();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].remaining, 3_000);
    assert_eq!(samples[1].remaining, 1_000);
    assert!((samples[1].remaining_percent - 20.0).abs() < 1e-9);
    assert!(samples[1].seconds_until_reset > 800);
}
