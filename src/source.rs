//! Endpoint catalogue and repository discovery
//!
//! A [`Source`] turns `(repo, endpoint)` into a [`PageFetcher`] and lists the
//! repositories of a target. [`ApiSource`] is the live implementation.

use crate::client::{ApiClient, FetchError, GraphQlCursorFetcher, RestPageFetcher};
use crate::config::CrawlConfig;
use crate::pagination::PageFetcher;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

/// Endpoints served by [`ApiSource`]
pub const KNOWN_ENDPOINTS: &[&str] = &["pulls", "issues", "commits", "releases", "discussions"];

const DISCUSSIONS_QUERY: &str = r#"query($owner: String!, $name: String!, $cursor: String) {
  repository(owner: $owner, name: $name) {
    discussions(first: 100, after: $cursor, orderBy: {field: CREATED_AT, direction: DESC}) {
      nodes { id number title createdAt updatedAt author { login } comments { totalCount } }
      pageInfo { endCursor hasNextPage }
    }
  }
}"#;

/// Source errors
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Endpoint name not in the catalogue
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Repository name is not `owner/name`
    #[error("invalid repository name: {0}")]
    InvalidRepo(String),
}

/// Supplies fetchers for checkpoint units and for discovery
pub trait Source: Send + Sync {
    /// Fetcher for one unit
    fn fetcher(&self, repo: &str, endpoint: &str) -> Result<Box<dyn PageFetcher>, SourceError>;

    /// Fetcher listing the target's repositories
    fn discovery_fetcher(&self, target: &str, as_user: bool) -> Box<dyn PageFetcher>;
}

/// Split `owner/name`
pub fn split_repo(repo: &str) -> Result<(&str, &str), SourceError> {
    match repo.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner, name))
        }
        _ => Err(SourceError::InvalidRepo(repo.to_string())),
    }
}

/// Whether a discovered repository record was active during the crawl year.
///
/// Records without timestamps are kept.
pub fn active_in_year(record: &Value, since: DateTime<Utc>, until: DateTime<Utc>) -> bool {
    let timestamp = |field: &str| {
        record
            .get(field)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };
    let created_before_end = timestamp("created_at").map_or(true, |t| t < until);
    let pushed_after_start = timestamp("pushed_at").map_or(true, |t| t >= since);
    created_before_end && pushed_after_start
}

/// Full name (`owner/name`) of a discovered repository record
pub fn repo_full_name(record: &Value) -> Option<String> {
    record
        .get("full_name")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Live source backed by [`ApiClient`]
#[derive(Debug, Clone)]
pub struct ApiSource {
    client: Arc<ApiClient>,
    per_page: u32,
    since: String,
    until: String,
}

impl ApiSource {
    /// Source for the configured API and year
    pub fn new(client: Arc<ApiClient>, config: &CrawlConfig) -> Self {
        Self {
            client,
            per_page: config.per_page,
            since: config.since().to_rfc3339(),
            until: config.until().to_rfc3339(),
        }
    }
}

impl Source for ApiSource {
    fn fetcher(&self, repo: &str, endpoint: &str) -> Result<Box<dyn PageFetcher>, SourceError> {
        let (owner, name) = split_repo(repo)?;
        let rest = |suffix: &str| {
            RestPageFetcher::new(
                self.client.clone(),
                format!("/repos/{owner}/{name}/{suffix}"),
                self.per_page,
            )
        };

        let fetcher: Box<dyn PageFetcher> = match endpoint {
            "pulls" => Box::new(
                rest("pulls")
                    .with_param("state", "all")
                    .with_param("sort", "created")
                    .with_param("direction", "asc"),
            ),
            "issues" => Box::new(
                rest("issues")
                    .with_param("state", "all")
                    .with_param("since", &self.since),
            ),
            "commits" => Box::new(
                rest("commits")
                    .with_param("since", &self.since)
                    .with_param("until", &self.until),
            ),
            "releases" => Box::new(rest("releases")),
            "discussions" => Box::new(GraphQlCursorFetcher::new(
                self.client.clone(),
                DISCUSSIONS_QUERY,
                json!({ "owner": owner, "name": name }),
                &["repository", "discussions"],
            )),
            other => return Err(SourceError::UnknownEndpoint(other.to_string())),
        };
        Ok(fetcher)
    }

    fn discovery_fetcher(&self, target: &str, as_user: bool) -> Box<dyn PageFetcher> {
        let path = if as_user {
            format!("/users/{target}/repos")
        } else {
            format!("/orgs/{target}/repos")
        };
        Box::new(
            RestPageFetcher::new(self.client.clone(), path, self.per_page)
                .with_param("type", "all")
                .with_param("sort", "full_name"),
        )
    }
}

/// Whether discovery should fall back from the organisation listing to the
/// user listing
pub fn is_missing_org(error: &FetchError) -> bool {
    matches!(error, FetchError::NotFound(_))
}
