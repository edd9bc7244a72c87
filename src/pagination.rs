//! Resumable page-by-page collection of one checkpoint unit
//!
//! [`Paginator`] drives a [`PageFetcher`] through the rate limiter into a
//! [`RecordSink`], advancing the checkpoint only after each page is durable.
//!
//! Safety mechanisms:
//! - Maximum iteration limit against servers that never stop paging
//! - Page-level retry with exponential backoff for transient failures
//! - Shutdown requests honoured between pages, never mid-page

use crate::checkpoint::{CheckpointError, CheckpointManager};
use crate::client::FetchError;
use crate::config::calculate_backoff;
use crate::ratelimit::{AdaptiveRateLimiter, ApiType, RateLimitError, RateLimitHeaders, RequestPriority};
use crate::shutdown::SharedShutdown;
use crate::sink::{blocking_io, RecordSink, SinkError};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Maximum pages per unit before pagination is assumed to loop
pub const MAX_ITERATIONS: u32 = 100_000;

/// Where the next page starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    /// 1-based page number
    Number(u32),
    /// Opaque server cursor; `None` requests the first page
    Cursor(Option<String>),
}

impl PageRequest {
    /// Cursor carried by the request, if any
    pub fn cursor(&self) -> Option<&str> {
        match self {
            PageRequest::Cursor(cursor) => cursor.as_deref(),
            PageRequest::Number(_) => None,
        }
    }
}

/// One page returned by a [`PageFetcher`]
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    /// Records on the page
    pub items: Vec<Value>,
    /// Request for the following page, when there is one
    pub next: Option<PageRequest>,
    /// Whether the server reports further pages
    pub has_more: bool,
    /// Response headers, fed to the rate limiter
    pub headers: RateLimitHeaders,
}

/// Fetches single pages of one paginated listing
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Quota the requests count against
    fn api_type(&self) -> ApiType;

    /// Request that resumes after `last_page_written`.
    ///
    /// `cursor` is the checkpointed cursor of that page, if any.
    fn resume_request(&self, last_page_written: u32, cursor: Option<String>) -> PageRequest;

    /// Fetch one page. Must not retry; the paginator owns retries.
    async fn fetch(&self, request: &PageRequest) -> Result<FetchedPage, FetchError>;
}

/// Pagination errors
#[derive(Debug, thiserror::Error)]
pub enum PaginationError {
    /// A page could not be fetched
    #[error("page {page} failed: {source}")]
    Fetch {
        /// Page ordinal
        page: u32,
        /// Last fetch error
        #[source]
        source: FetchError,
    },

    /// Admission refused
    #[error("rate limiter error: {0}")]
    RateLimit(#[from] RateLimitError),

    /// Checkpoint could not be updated
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Page could not be stored
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// The server kept returning pages
    #[error("max iterations ({0}) exceeded, possible pagination loop")]
    MaxIterations(u32),

    /// The server reported more pages without saying where they start
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl PaginationError {
    /// Whether a later run may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        match self {
            PaginationError::Fetch { source, .. } => source.is_transient(),
            PaginationError::RateLimit(RateLimitError::BreakerOpen) => true,
            PaginationError::RateLimit(_) => false,
            PaginationError::Sink(_) => true,
            PaginationError::Checkpoint(_)
            | PaginationError::MaxIterations(_)
            | PaginationError::Protocol(_) => false,
        }
    }
}

/// How a unit run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Every page collected
    Complete {
        /// Pages collected by this run
        pages: u32,
        /// Records collected by this run
        records: u64,
    },
    /// Shutdown requested; resumable from the checkpoint
    Interrupted {
        /// Pages collected by this run
        pages: u32,
        /// Records collected by this run
        records: u64,
    },
    /// The checkpoint already marked the unit complete
    AlreadyComplete,
}

/// Runs one checkpoint unit to completion
pub struct Paginator<'a> {
    limiter: &'a AdaptiveRateLimiter,
    checkpoint: &'a CheckpointManager,
    shutdown: Option<SharedShutdown>,
    priority: RequestPriority,
    max_retries: u32,
}

impl<'a> Paginator<'a> {
    /// Paginator sharing `limiter` and `checkpoint`
    pub fn new(limiter: &'a AdaptiveRateLimiter, checkpoint: &'a CheckpointManager) -> Self {
        Self {
            limiter,
            checkpoint,
            shutdown: None,
            priority: RequestPriority::Medium,
            max_retries: crate::config::MAX_PAGE_RETRIES,
        }
    }

    /// Stop between pages once shutdown is requested
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Priority passed to the limiter
    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Page-level retries for transient failures
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|s| s.is_shutdown_requested())
    }

    /// Collect `repo`/`endpoint` from its resume point.
    ///
    /// The unit is marked complete on success. Failures are returned to the
    /// caller, which decides how to record them.
    pub async fn run(
        &self,
        repo: &str,
        endpoint: &str,
        fetcher: &dyn PageFetcher,
        sink: &mut dyn RecordSink,
    ) -> Result<UnitOutcome, PaginationError> {
        if self.checkpoint.is_repo_endpoint_complete(repo, endpoint) {
            debug!(repo, endpoint, "Unit already complete, skipping");
            return Ok(UnitOutcome::AlreadyComplete);
        }

        self.checkpoint
            .mark_repo_endpoint_in_progress(repo, endpoint)?;

        let mut page = self.checkpoint.get_resume_page(repo, endpoint);
        let mut request = fetcher.resume_request(
            page - 1,
            self.checkpoint.get_resume_cursor(repo, endpoint),
        );
        if page > 1 {
            info!(repo, endpoint, page, "Resuming unit");
        }

        let mut pages = 0u32;
        let mut records = 0u64;

        loop {
            if pages >= MAX_ITERATIONS {
                return Err(PaginationError::MaxIterations(MAX_ITERATIONS));
            }
            if self.shutdown_requested() {
                info!(repo, endpoint, page, "Shutdown requested, stopping between pages");
                self.checkpoint.save()?;
                return Ok(UnitOutcome::Interrupted { pages, records });
            }

            let fetched = self.fetch_page(fetcher, &request, page).await?;
            let count = fetched.items.len() as u64;
            let next_cursor = match &fetched.next {
                Some(PageRequest::Cursor(cursor)) => cursor.clone(),
                _ => None,
            };

            blocking_io(|| -> Result<(), PaginationError> {
                sink.append_page(page, request.cursor(), &fetched.items)?;
                if matches!(request, PageRequest::Cursor(_)) {
                    self.checkpoint.update_cursor_progress(
                        repo,
                        endpoint,
                        page,
                        count,
                        next_cursor.as_deref(),
                    )?;
                } else {
                    self.checkpoint
                        .update_progress(repo, endpoint, page, count)?;
                }
                Ok(())
            })?;
            metrics::counter!("pages_collected_total", "endpoint" => endpoint.to_string())
                .increment(1);

            pages += 1;
            records += count;
            debug!(repo, endpoint, page, records = count, has_more = fetched.has_more, "Page collected");

            if !fetched.has_more {
                break;
            }
            request = fetched.next.ok_or_else(|| {
                PaginationError::Protocol(format!(
                    "page {page} of {repo}/{endpoint} reports more pages but no next request"
                ))
            })?;
            page += 1;
        }

        self.checkpoint
            .mark_repo_endpoint_complete(repo, endpoint)?;
        info!(repo, endpoint, pages, records, "Unit collected");
        Ok(UnitOutcome::Complete { pages, records })
    }

    /// Fetch one page through the limiter, retrying transient failures.
    ///
    /// `page` only labels logs and errors.
    pub async fn fetch_page(
        &self,
        fetcher: &dyn PageFetcher,
        request: &PageRequest,
        page: u32,
    ) -> Result<FetchedPage, PaginationError> {
        let api_type = fetcher.api_type();
        let mut attempt = 0;

        loop {
            let permit = self.limiter.acquire(api_type, self.priority).await?;
            match fetcher.fetch(request).await {
                Ok(fetched) => {
                    self.apply_headers(&fetched.headers, api_type);
                    self.limiter.release(permit, true);
                    return Ok(fetched);
                }
                Err(error) => {
                    if let FetchError::RateLimited { headers, .. } = &error {
                        self.apply_headers(headers, api_type);
                    }
                    self.limiter.release(permit, !error.is_server_fault());

                    if !error.is_transient() || attempt >= self.max_retries {
                        return Err(PaginationError::Fetch {
                            page,
                            source: error,
                        });
                    }

                    let backoff = calculate_backoff(attempt);
                    warn!(
                        page,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Page fetch failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    fn apply_headers(&self, headers: &RateLimitHeaders, api_type: ApiType) {
        if let Err(e) = self.limiter.update(headers, api_type) {
            warn!(api = %api_type, error = %e, "Ignoring unparseable rate limit headers");
        }
    }
}
