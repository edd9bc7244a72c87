//! Crawl configuration and retry constants

use crate::ratelimit::RateLimitConfig;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Page-level retries before a unit is marked failed.
/// With the backoff below the longest retry sequence waits about a minute.
pub const MAX_PAGE_RETRIES: u32 = 5;

/// Initial page retry backoff in milliseconds
pub const INITIAL_BACKOFF_MS: u64 = 1000;

/// Maximum page retry backoff in milliseconds
pub const MAX_BACKOFF_MS: u64 = 30000;

/// Default page size requested from REST endpoints (the API maximum)
pub const DEFAULT_PER_PAGE: u32 = 100;

/// Default REST API base URL
pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";

/// Default GraphQL endpoint
pub const DEFAULT_GRAPHQL_URL: &str = "https://api.github.com/graphql";

/// Endpoints collected when none are configured
pub const DEFAULT_ENDPOINTS: &[&str] = &["pulls", "issues", "commits", "releases"];

/// Exponential page retry backoff: 1s, 2s, 4s, ... capped at 30s
pub fn calculate_backoff(retry_count: u32) -> Duration {
    let delay_ms = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(retry_count));
    Duration::from_millis(delay_ms.min(MAX_BACKOFF_MS))
}

/// Effective configuration of one collection run.
///
/// Everything except the API token is serialised into the checkpoint digest,
/// so a resumed run can tell whether it is continuing the same crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Organisation or user whose repositories are collected
    pub target: String,
    /// Calendar year of activity to collect
    pub year: i32,
    /// Endpoints collected for every repository
    pub endpoints: Vec<String>,
    /// Explicit repositories (`owner/name`); empty means discover them
    #[serde(default)]
    pub repos: Vec<String>,
    /// REST page size
    pub per_page: u32,
    /// Page-level retries for transient failures
    pub max_page_retries: u32,
    /// REST API base URL
    pub api_base_url: String,
    /// GraphQL endpoint URL
    pub graphql_url: String,
    /// Directory receiving the per-unit record files
    pub output_dir: PathBuf,
    /// Admission control tunables
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// API token; never serialised
    #[serde(skip)]
    pub token: Option<String>,
}

impl CrawlConfig {
    /// Configuration with defaults for `target` and `year`
    pub fn new(target: impl Into<String>, year: i32) -> Self {
        Self {
            target: target.into(),
            year,
            endpoints: DEFAULT_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
            repos: Vec::new(),
            per_page: DEFAULT_PER_PAGE,
            max_page_retries: MAX_PAGE_RETRIES,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            graphql_url: DEFAULT_GRAPHQL_URL.to_string(),
            output_dir: PathBuf::from("data"),
            rate_limit: RateLimitConfig::default(),
            token: None,
        }
    }

    /// Start of the collected year (inclusive)
    pub fn since(&self) -> DateTime<Utc> {
        year_start(self.year)
    }

    /// Start of the following year (exclusive end)
    pub fn until(&self) -> DateTime<Utc> {
        year_start(self.year.saturating_add(1))
    }
}

fn year_start(year: i32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
