//! Production observability metrics for the crawler
//!
//! This module registers the crawler's metrics and the optional Prometheus
//! scrape endpoint.
//!
//! ## Architecture
//!
//! - Uses `metrics` crate for low-overhead metric collection
//! - Prometheus exporter for scraping endpoint (`--metrics-addr`)
//! - Emission sites live next to the code they measure; without an
//!   installed recorder every macro is a no-op

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Global metrics registry initialization flag
static METRICS_INITIALIZED: Lazy<Arc<RwLock<bool>>> = Lazy::new(|| Arc::new(RwLock::new(false)));

/// Initialize metrics system with Prometheus exporter
///
/// Call once at startup. Idempotent.
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!(%addr, "Initializing metrics system");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_metrics();

    *initialized = true;
    info!(%addr, "Metrics system initialized successfully");
    Ok(())
}

/// Register metric descriptions with the installed recorder
pub fn describe_metrics() {
    describe_counter!(
        "crawler_requests_total",
        Unit::Count,
        "Total number of requests admitted by the rate limiter"
    );

    describe_gauge!(
        "quota_remaining",
        Unit::Count,
        "Remaining primary quota reported by the API"
    );

    describe_histogram!(
        "acquire_wait_seconds",
        Unit::Seconds,
        "Time spent in admission control before a request"
    );

    describe_counter!(
        "secondary_limit_trips_total",
        Unit::Count,
        "Total number of secondary rate limit pauses"
    );

    describe_counter!(
        "circuit_open_total",
        Unit::Count,
        "Total number of times the circuit breaker opened"
    );

    describe_counter!(
        "pages_collected_total",
        Unit::Count,
        "Total number of pages durably collected"
    );

    describe_counter!(
        "units_completed_total",
        Unit::Count,
        "Total number of repository endpoints fully collected"
    );

    describe_counter!(
        "units_failed_total",
        Unit::Count,
        "Total number of repository endpoints marked failed"
    );

    describe_histogram!(
        "http_request_duration_seconds",
        Unit::Seconds,
        "HTTP request duration in seconds"
    );
}

/// Collection metrics for one checkpoint unit
pub struct UnitMetrics {
    repo: String,
    endpoint: String,
    start_time: Instant,
}

impl UnitMetrics {
    /// Start tracking a unit
    pub fn start(repo: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let repo = repo.into();
        let endpoint = endpoint.into();

        debug!(repo = %repo, endpoint = %endpoint, "Unit started");

        Self {
            repo,
            endpoint,
            start_time: Instant::now(),
        }
    }

    /// Record a fully collected unit
    pub fn record_success(&self, pages: u32, records: u64) {
        counter!("units_completed_total", "endpoint" => self.endpoint.clone()).increment(1);

        info!(
            repo = %self.repo,
            endpoint = %self.endpoint,
            pages,
            records,
            duration_secs = self.start_time.elapsed().as_secs(),
            "Unit completed"
        );
    }

    /// Record a failed unit
    pub fn record_failure(&self, error: &str, retryable: bool) {
        counter!(
            "units_failed_total",
            "endpoint" => self.endpoint.clone(),
            "retryable" => retryable.to_string()
        )
        .increment(1);

        error!(
            repo = %self.repo,
            endpoint = %self.endpoint,
            error = %error,
            retryable,
            duration_secs = self.start_time.elapsed().as_secs(),
            "Unit failed"
        );
    }
}
