//! HTTP transport for the REST and GraphQL APIs
//!
//! Provides the shared client plus the two [`PageFetcher`] instantiations:
//! - [`RestPageFetcher`]: `page`/`per_page` query, `Link: rel="next"` for more
//! - [`GraphQlCursorFetcher`]: opaque `endCursor`/`hasNextPage` cursor
//!
//! Nothing here retries; every call is a single attempt classified into a
//! [`FetchError`] for the paginator's retry loop.

use crate::config::CrawlConfig;
use crate::pagination::{FetchedPage, PageFetcher, PageRequest};
use crate::ratelimit::{ApiType, RateLimitHeaders};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// HTTP connect timeout (seconds) - time to establish TCP connection
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
/// HTTP request timeout (seconds) - overall time for the entire request
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 30;

const API_ACCEPT: &str = "application/vnd.github+json";
const CLIENT_USER_AGENT: &str = concat!("repo-crawler/", env!("CARGO_PKG_VERSION"));

/// Fetch errors for a single request
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Transport failure (DNS, connect, timeout, reset)
    #[error("network error: {0}")]
    Network(String),

    /// Quota exhausted or secondary limit hit (429, or 403 with quota headers)
    #[error("rate limited by server (HTTP {status})")]
    RateLimited {
        /// HTTP status
        status: u16,
        /// Response headers carrying `retry-after` / quota values
        headers: RateLimitHeaders,
    },

    /// 5xx response
    #[error("server error: {0}")]
    Server(String),

    /// 4xx response other than rate limiting and not-found
    #[error("client error: {0}")]
    Client(String),

    /// Resource missing or gone (404 / 410)
    #[error("not found: {0}")]
    NotFound(String),

    /// Response body did not have the expected shape
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::RateLimited { .. } | FetchError::Server(_)
        )
    }

    /// Whether the failure says the API itself is unhealthy
    pub fn is_server_fault(&self) -> bool {
        matches!(self, FetchError::Network(_) | FetchError::Server(_))
    }
}

/// Result type for fetch operations
pub type FetchResult<T> = Result<T, FetchError>;

/// Shared HTTP client for both API flavors
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    graphql_url: String,
}

impl ApiClient {
    /// Build a client from the crawl configuration
    pub fn new(config: &CrawlConfig) -> FetchResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(API_ACCEPT));
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| FetchError::Client("API token is not a valid header value".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
            .default_headers(headers)
            .build()
            .map_err(|e| FetchError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            graphql_url: config.graphql_url.clone(),
        })
    }

    /// REST base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Single GET against a REST path
    pub async fn get(&self, path: &str, query: &[(String, String)]) -> FetchResult<(Value, RateLimitHeaders)> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, params = query.len(), "GET");

        let started = Instant::now();
        let response = self.http.get(&url).query(query).send().await;
        self.finish(path, response, started).await
    }

    /// Single GraphQL POST
    pub async fn graphql(&self, query: &str, variables: &Value) -> FetchResult<(Value, RateLimitHeaders)> {
        debug!(url = %self.graphql_url, "GraphQL POST");

        let started = Instant::now();
        let response = self
            .http
            .post(&self.graphql_url)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await;
        let (body, headers) = self.finish("graphql", response, started).await?;

        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                let rate_limited = errors
                    .iter()
                    .any(|e| e.get("type").and_then(Value::as_str) == Some("RATE_LIMITED"));
                if rate_limited {
                    return Err(FetchError::RateLimited {
                        status: StatusCode::OK.as_u16(),
                        headers,
                    });
                }
                let messages: Vec<&str> = errors
                    .iter()
                    .filter_map(|e| e.get("message").and_then(Value::as_str))
                    .collect();
                return Err(FetchError::Client(format!(
                    "GraphQL errors: {}",
                    messages.join("; ")
                )));
            }
        }
        Ok((body, headers))
    }

    async fn finish(
        &self,
        endpoint: &str,
        response: reqwest::Result<reqwest::Response>,
        started: Instant,
    ) -> FetchResult<(Value, RateLimitHeaders)> {
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                record_request(endpoint, "network_error", started);
                return Err(FetchError::Network(e.to_string()));
            }
        };

        let status = response.status();
        record_request(endpoint, status.as_str(), started);
        let headers = RateLimitHeaders::from(response.headers());

        if let Some(error) = classify_status(status, &headers) {
            let error = match error {
                FetchError::Client(_) | FetchError::Server(_) | FetchError::NotFound(_) => {
                    let text = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    with_body(error, &text)
                }
                other => other,
            };
            warn!(endpoint, status = status.as_u16(), error = %error, "Request failed");
            return Err(error);
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| FetchError::Malformed(format!("Failed to deserialize response: {e}")))?;
        Ok((body, headers))
    }
}

fn record_request(endpoint: &str, status: &str, started: Instant) {
    metrics::histogram!("http_request_duration_seconds", "endpoint" => endpoint.to_string())
        .record(started.elapsed().as_secs_f64());
    debug!(
        endpoint,
        status,
        duration_ms = started.elapsed().as_millis() as u64,
        "HTTP request completed"
    );
}

/// Map an HTTP status to a fetch error; `None` for success
pub fn classify_status(status: StatusCode, headers: &RateLimitHeaders) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    let code = status.as_u16();
    let quota_exhausted = headers.get(crate::ratelimit::headers::HEADER_REMAINING) == Some("0");
    let retry_after = headers.get(crate::ratelimit::headers::HEADER_RETRY_AFTER).is_some();

    Some(match code {
        429 => FetchError::RateLimited {
            status: code,
            headers: headers.clone(),
        },
        403 if quota_exhausted || retry_after => FetchError::RateLimited {
            status: code,
            headers: headers.clone(),
        },
        404 | 410 => FetchError::NotFound(status.to_string()),
        _ if status.is_server_error() => FetchError::Server(status.to_string()),
        _ => FetchError::Client(status.to_string()),
    })
}

fn with_body(error: FetchError, body: &str) -> FetchError {
    let body: String = body.chars().take(200).collect();
    match error {
        FetchError::Client(s) => FetchError::Client(format!("{s}: {body}")),
        FetchError::Server(s) => FetchError::Server(format!("{s}: {body}")),
        FetchError::NotFound(s) => FetchError::NotFound(format!("{s}: {body}")),
        other => other,
    }
}

/// Whether a `Link` header advertises a `rel="next"` page
pub fn has_next_link(link: &str) -> bool {
    link.split(',').any(|part| {
        part.split(';').skip(1).any(|param| {
            let param = param.trim();
            param
                .strip_prefix("rel=")
                .map(|rel| rel.trim_matches('"').split_whitespace().any(|r| r == "next"))
                .unwrap_or(false)
        })
    })
}

/// Page-number fetcher for REST list endpoints
#[derive(Debug, Clone)]
pub struct RestPageFetcher {
    client: Arc<ApiClient>,
    path: String,
    query: Vec<(String, String)>,
    per_page: u32,
}

impl RestPageFetcher {
    /// Fetcher for `path` with extra query parameters
    pub fn new(client: Arc<ApiClient>, path: impl Into<String>, per_page: u32) -> Self {
        Self {
            client,
            path: path.into(),
            query: Vec::new(),
            per_page: per_page.clamp(1, 100),
        }
    }

    /// Add a fixed query parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Request path
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl PageFetcher for RestPageFetcher {
    fn api_type(&self) -> ApiType {
        ApiType::Rest
    }

    fn resume_request(&self, last_page_written: u32, _cursor: Option<String>) -> PageRequest {
        PageRequest::Number(last_page_written + 1)
    }

    async fn fetch(&self, request: &PageRequest) -> FetchResult<FetchedPage> {
        let page = match request {
            PageRequest::Number(page) => *page,
            PageRequest::Cursor(_) => {
                return Err(FetchError::Malformed(
                    "REST endpoints paginate by page number".to_string(),
                ))
            }
        };

        let mut query = self.query.clone();
        query.push(("per_page".to_string(), self.per_page.to_string()));
        query.push(("page".to_string(), page.to_string()));

        let (body, headers) = self.client.get(&self.path, &query).await?;
        let items = match body {
            Value::Array(items) => items,
            other => {
                return Err(FetchError::Malformed(format!(
                    "expected a JSON array from {}, got {}",
                    self.path,
                    type_name(&other)
                )))
            }
        };

        let has_more = headers.get("link").is_some_and(has_next_link);
        Ok(FetchedPage {
            items,
            next: has_more.then_some(PageRequest::Number(page + 1)),
            has_more,
            headers,
        })
    }
}

/// Cursor fetcher for GraphQL connections.
///
/// The query must accept a `$cursor` variable and select `nodes` and
/// `pageInfo { endCursor hasNextPage }` on the connection found at
/// `connection_path` below `data`.
#[derive(Debug, Clone)]
pub struct GraphQlCursorFetcher {
    client: Arc<ApiClient>,
    query: String,
    variables: Value,
    connection_path: Vec<String>,
}

impl GraphQlCursorFetcher {
    /// Fetcher for `query` with fixed `variables`
    pub fn new(
        client: Arc<ApiClient>,
        query: impl Into<String>,
        variables: Value,
        connection_path: &[&str],
    ) -> Self {
        Self {
            client,
            query: query.into(),
            variables,
            connection_path: connection_path.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Extract records and page info from a GraphQL response body
pub fn parse_connection(body: &Value, connection_path: &[String]) -> FetchResult<(Vec<Value>, Option<String>, bool)> {
    let mut node = body
        .get("data")
        .ok_or_else(|| FetchError::Malformed("GraphQL response without data".to_string()))?;
    for key in connection_path {
        node = node.get(key).filter(|v| !v.is_null()).ok_or_else(|| {
            FetchError::NotFound(format!("connection path {} missing", connection_path.join(".")))
        })?;
    }

    let items = if let Some(nodes) = node.get("nodes").and_then(Value::as_array) {
        nodes.clone()
    } else if let Some(edges) = node.get("edges").and_then(Value::as_array) {
        edges.iter().filter_map(|e| e.get("node").cloned()).collect()
    } else {
        return Err(FetchError::Malformed(
            "connection has neither nodes nor edges".to_string(),
        ));
    };

    let page_info = node
        .get("pageInfo")
        .ok_or_else(|| FetchError::Malformed("connection without pageInfo".to_string()))?;
    let has_next = page_info
        .get("hasNextPage")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let end_cursor = page_info
        .get("endCursor")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok((items, end_cursor, has_next))
}

#[async_trait]
impl PageFetcher for GraphQlCursorFetcher {
    fn api_type(&self) -> ApiType {
        ApiType::GraphQl
    }

    fn resume_request(&self, _last_page_written: u32, cursor: Option<String>) -> PageRequest {
        PageRequest::Cursor(cursor)
    }

    async fn fetch(&self, request: &PageRequest) -> FetchResult<FetchedPage> {
        let cursor = match request {
            PageRequest::Cursor(cursor) => cursor.clone(),
            PageRequest::Number(_) => {
                return Err(FetchError::Malformed(
                    "GraphQL connections paginate by cursor".to_string(),
                ))
            }
        };

        let mut variables = self.variables.clone();
        if let Value::Object(map) = &mut variables {
            map.insert("cursor".to_string(), cursor.map(Value::String).unwrap_or(Value::Null));
        }

        let (body, headers) = self.client.graphql(&self.query, &variables).await?;
        let (items, end_cursor, has_more) = parse_connection(&body, &self.connection_path)?;
        let has_more = has_more && end_cursor.is_some();

        Ok(FetchedPage {
            items,
            next: has_more.then(|| PageRequest::Cursor(end_cursor)),
            has_more,
            headers,
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
