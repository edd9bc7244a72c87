//! Case-insensitive response header map consumed by the rate limiter
//!
//! The limiter never sees transport-specific header types. Responses are
//! normalised into [`RateLimitHeaders`] at the HTTP boundary.

use std::collections::HashMap;

/// Header carrying the primary quota size
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Header carrying the remaining primary quota
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Header carrying the quota reset time (epoch seconds)
pub const HEADER_RESET: &str = "x-ratelimit-reset";
/// Server-driven backoff (seconds)
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Response headers with lowercased keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    values: HashMap<String, String>,
}

impl RateLimitHeaders {
    /// Create an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any value stored under the same name
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.values
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Look a header up, ignoring case
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(&name.to_ascii_lowercase())
            .map(|v| v.trim())
    }
}

impl<K, V> FromIterator<(K, V)> for RateLimitHeaders
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

impl From<&reqwest::header::HeaderMap> for RateLimitHeaders {
    fn from(map: &reqwest::header::HeaderMap) -> Self {
        map.iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect()
    }
}
