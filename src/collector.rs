//! Collection orchestration
//!
//! Two phases, each recorded in the checkpoint:
//! - `discovery`: list the target's repositories active in the crawl year
//! - `collection`: page through every endpoint of every pending repository
//!
//! Repositories run concurrently (bounded by `max_concurrency`) and share one
//! limiter and one checkpoint. A unit that fails is recorded and the run
//! moves on; only checkpoint I/O failures abort the run.

use crate::checkpoint::{CheckpointError, CheckpointManager};
use crate::config::CrawlConfig;
use crate::metrics::UnitMetrics;
use crate::pagination::{PaginationError, Paginator, UnitOutcome, MAX_ITERATIONS};
use crate::ratelimit::{AdaptiveRateLimiter, RateLimitError, RequestPriority};
use crate::shutdown::SharedShutdown;
use crate::sink::{JsonlSink, SinkError};
use crate::source::{active_in_year, is_missing_org, repo_full_name, Source};
use futures::stream::{self, StreamExt, TryStreamExt};
use indicatif::ProgressBar;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Phase listing repositories
pub const PHASE_DISCOVERY: &str = "discovery";
/// Phase collecting endpoint pages
pub const PHASE_COLLECTION: &str = "collection";

/// Collector errors; all of them abort the run
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// Checkpoint could not be read or written
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Discovery failed
    #[error("discovery failed: {0}")]
    Discovery(#[source] PaginationError),
}

/// Result type for collector operations
pub type CollectResult<T> = Result<T, CollectError>;

/// Run options chosen per invocation (not part of the config digest)
#[derive(Debug, Clone, Default)]
pub struct CollectOptions {
    /// Process previously failed repositories again
    pub retry_failed: bool,
    /// Start at this repository (inclusive)
    pub from_repo: Option<String>,
}

/// Totals for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CollectReport {
    /// Repositories tracked after discovery
    pub repos_discovered: usize,
    /// Repositories processed by this run
    pub repos_processed: usize,
    /// Units completed by this run
    pub units_completed: usize,
    /// Units skipped because they were already complete
    pub units_skipped: usize,
    /// Units marked failed by this run
    pub units_failed: usize,
    /// Pages collected by this run
    pub pages: u64,
    /// Records collected by this run
    pub records: u64,
    /// Whether the run stopped on a shutdown request
    pub interrupted: bool,
}

impl CollectReport {
    fn merge(&mut self, other: CollectReport) {
        self.repos_processed += other.repos_processed;
        self.units_completed += other.units_completed;
        self.units_skipped += other.units_skipped;
        self.units_failed += other.units_failed;
        self.pages += other.pages;
        self.records += other.records;
        self.interrupted |= other.interrupted;
    }
}

/// Drives a whole collection run
pub struct Collector {
    config: CrawlConfig,
    source: Arc<dyn Source>,
    limiter: Arc<AdaptiveRateLimiter>,
    checkpoint: Arc<CheckpointManager>,
    shutdown: SharedShutdown,
    progress: Option<ProgressBar>,
}

impl Collector {
    /// Collector over a loaded or freshly created checkpoint
    pub fn new(
        config: CrawlConfig,
        source: Arc<dyn Source>,
        limiter: Arc<AdaptiveRateLimiter>,
        checkpoint: Arc<CheckpointManager>,
        shutdown: SharedShutdown,
    ) -> Self {
        Self {
            config,
            source,
            limiter,
            checkpoint,
            shutdown,
            progress: None,
        }
    }

    /// Advance `progress` by one per finished repository
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run discovery (if not yet complete) and collection.
    ///
    /// On a fatal error the checkpoint is saved on a best-effort basis
    /// before the error is returned.
    pub async fn run(&self, options: &CollectOptions) -> CollectResult<CollectReport> {
        let result = self.run_phases(options).await;
        if let Err(e) = &result {
            error!(error = %e, "Collection aborted");
            if let Err(save_error) = self.checkpoint.save() {
                error!(error = %save_error, "Failed to save checkpoint after abort");
            }
        }
        result
    }

    async fn run_phases(&self, options: &CollectOptions) -> CollectResult<CollectReport> {
        let mut report = CollectReport::default();

        if !self.checkpoint.is_phase_complete(PHASE_DISCOVERY) {
            self.checkpoint.set_current_phase(PHASE_DISCOVERY)?;
            let repos = self.discover().await?;
            if self.shutdown.is_shutdown_requested() {
                report.interrupted = true;
                self.checkpoint.save()?;
                return Ok(report);
            }
            self.checkpoint.update_repos(&repos)?;
            self.checkpoint.mark_phase_complete(PHASE_DISCOVERY)?;
        }
        report.repos_discovered = self
            .checkpoint
            .summary()
            .map(|s| s.repos_total)
            .unwrap_or(0);

        self.checkpoint.set_current_phase(PHASE_COLLECTION)?;
        let repos = self
            .checkpoint
            .get_repos_to_process(options.retry_failed, options.from_repo.as_deref());
        info!(
            repos = repos.len(),
            concurrency = self.config.rate_limit.max_concurrency,
            retry_failed = options.retry_failed,
            "Starting collection"
        );
        if let Some(progress) = &self.progress {
            progress.set_length(repos.len() as u64);
        }

        // The first fatal error drops the stream, so no further repository starts
        let concurrency = self.config.rate_limit.max_concurrency.max(1);
        let collected = stream::iter(repos)
            .map(|repo| async move {
                let result = self.collect_repo(&repo).await;
                if let Some(progress) = &self.progress {
                    progress.set_message(repo);
                    progress.inc(1);
                }
                result
            })
            .buffer_unordered(concurrency)
            .try_fold(CollectReport::default(), |mut totals, repo_report| async move {
                totals.merge(repo_report);
                Ok::<_, CollectError>(totals)
            })
            .await?;
        report.merge(collected);

        let remaining = self.checkpoint.get_repos_to_process(true, None);
        if !report.interrupted && remaining.is_empty() {
            self.checkpoint.mark_phase_complete(PHASE_COLLECTION)?;
        }
        self.checkpoint.save()?;

        info!(
            repos = report.repos_processed,
            completed = report.units_completed,
            skipped = report.units_skipped,
            failed = report.units_failed,
            pages = report.pages,
            records = report.records,
            interrupted = report.interrupted,
            "Collection finished"
        );
        Ok(report)
    }

    /// List repositories to track: the configured ones, or those the target
    /// owns that were active during the year
    async fn discover(&self) -> CollectResult<Vec<String>> {
        if !self.config.repos.is_empty() {
            info!(repos = self.config.repos.len(), "Using configured repositories");
            let unique: BTreeSet<String> = self.config.repos.iter().cloned().collect();
            return Ok(unique.into_iter().collect());
        }

        info!(target = %self.config.target, year = self.config.year, "Discovering repositories");
        let records = match self.list_repos(false).await {
            Err(PaginationError::Fetch { source, .. }) if is_missing_org(&source) => {
                debug!(target = %self.config.target, "Not an organisation, listing user repositories");
                self.list_repos(true).await
            }
            other => other,
        }
        .map_err(CollectError::Discovery)?;

        let since = self.config.since();
        let until = self.config.until();
        let repos: BTreeSet<String> = records
            .iter()
            .filter(|record| active_in_year(record, since, until))
            .filter_map(repo_full_name)
            .collect();

        info!(
            listed = records.len(),
            active = repos.len(),
            "Discovery complete"
        );
        Ok(repos.into_iter().collect())
    }

    /// Page through the repository listing in memory
    async fn list_repos(&self, as_user: bool) -> Result<Vec<serde_json::Value>, PaginationError> {
        let fetcher = self.source.discovery_fetcher(&self.config.target, as_user);
        let paginator = Paginator::new(&self.limiter, &self.checkpoint)
            .with_priority(RequestPriority::High)
            .with_max_retries(self.config.max_page_retries);

        let mut records = Vec::new();
        let mut request = fetcher.resume_request(0, None);
        for page_number in 1..=MAX_ITERATIONS {
            if self.shutdown.is_shutdown_requested() {
                return Ok(records);
            }
            let page = paginator
                .fetch_page(fetcher.as_ref(), &request, page_number)
                .await?;
            debug!(page = page_number, repos = page.items.len(), "Repository page listed");
            records.extend(page.items);
            match page.next {
                Some(next) if page.has_more => request = next,
                _ => return Ok(records),
            }
        }
        Err(PaginationError::MaxIterations(MAX_ITERATIONS))
    }

    /// Collect every configured endpoint of one repository
    async fn collect_repo(&self, repo: &str) -> CollectResult<CollectReport> {
        let mut report = CollectReport {
            repos_processed: 1,
            ..Default::default()
        };

        for endpoint in &self.config.endpoints {
            if self.shutdown.is_shutdown_requested() {
                report.interrupted = true;
                break;
            }
            if self.checkpoint.is_repo_endpoint_complete(repo, endpoint) {
                report.units_skipped += 1;
                continue;
            }

            let metrics = UnitMetrics::start(repo, endpoint.as_str());
            let outcome = match self.collect_unit(repo, endpoint).await {
                Ok(outcome) => outcome,
                Err(UnitFailure::Fatal(e)) => return Err(e),
                Err(UnitFailure::Unit { message, retryable }) => {
                    metrics.record_failure(&message, retryable);
                    self.checkpoint
                        .mark_repo_endpoint_failed(repo, endpoint, &message, retryable)?;
                    report.units_failed += 1;
                    continue;
                }
            };

            match outcome {
                UnitOutcome::Complete { pages, records } => {
                    metrics.record_success(pages, records);
                    report.units_completed += 1;
                    report.pages += u64::from(pages);
                    report.records += records;
                }
                UnitOutcome::AlreadyComplete => report.units_skipped += 1,
                UnitOutcome::Interrupted { pages, records } => {
                    report.pages += u64::from(pages);
                    report.records += records;
                    report.interrupted = true;
                    break;
                }
            }
        }
        Ok(report)
    }

    async fn collect_unit(&self, repo: &str, endpoint: &str) -> Result<UnitOutcome, UnitFailure> {
        let fetcher = match self.source.fetcher(repo, endpoint) {
            Ok(fetcher) => fetcher,
            Err(e) => {
                return Err(UnitFailure::Unit {
                    message: e.to_string(),
                    retryable: false,
                })
            }
        };
        let mut sink = JsonlSink::for_unit(&self.config.output_dir, repo, endpoint)
            .map_err(|e| UnitFailure::from_sink(&e))?;

        let paginator = Paginator::new(&self.limiter, &self.checkpoint)
            .with_shutdown(self.shutdown.clone())
            .with_priority(RequestPriority::Medium)
            .with_max_retries(self.config.max_page_retries);

        paginator
            .run(repo, endpoint, fetcher.as_ref(), &mut sink)
            .await
            .map_err(UnitFailure::from)
    }
}

/// Why a unit stopped
enum UnitFailure {
    /// Abort the run
    Fatal(CollectError),
    /// Record the unit as failed and move on
    Unit { message: String, retryable: bool },
}

impl UnitFailure {
    fn from_sink(error: &SinkError) -> Self {
        UnitFailure::Unit {
            message: format!("sink error: {error}"),
            retryable: true,
        }
    }
}

impl From<PaginationError> for UnitFailure {
    fn from(error: PaginationError) -> Self {
        match error {
            PaginationError::Checkpoint(e) => UnitFailure::Fatal(CollectError::Checkpoint(e)),
            PaginationError::RateLimit(RateLimitError::BreakerOpen) => {
                warn!("API unavailable, marking unit failed for retry");
                UnitFailure::Unit {
                    message: RateLimitError::BreakerOpen.to_string(),
                    retryable: true,
                }
            }
            other => UnitFailure::Unit {
                retryable: other.is_retryable(),
                message: other.to_string(),
            },
        }
    }
}
