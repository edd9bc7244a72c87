//! Collect command implementation

use super::{print_json, Cli, CliError, OutputFormat};
use crate::checkpoint::CheckpointManager;
use crate::client::ApiClient;
use crate::collector::{CollectOptions, CollectReport, Collector};
use crate::config::{CrawlConfig, DEFAULT_API_BASE_URL, DEFAULT_GRAPHQL_URL, DEFAULT_PER_PAGE, MAX_PAGE_RETRIES};
use crate::ratelimit::{AdaptiveRateLimiter, RateLimitConfig};
use crate::shutdown::{self, SharedShutdown};
use crate::source::{ApiSource, KNOWN_ENDPOINTS};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Maximum allowed concurrency to prevent self-inflicted rate limiting
const MAX_CONCURRENCY: usize = 32;

/// Parse and validate concurrency value
fn parse_concurrency(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("concurrency must be at least 1".to_string());
    }
    if value > MAX_CONCURRENCY {
        return Err(format!(
            "concurrency {value} exceeds maximum of {MAX_CONCURRENCY}"
        ));
    }
    Ok(value)
}

/// Arguments for a collection run
#[derive(Parser, Debug)]
pub struct CollectArgs {
    /// Organisation or user to collect
    #[arg(long)]
    pub target: String,

    /// Calendar year to collect
    #[arg(long)]
    pub year: i32,

    /// Endpoints to collect per repository
    #[arg(long, value_delimiter = ',', default_value = "pulls,issues,commits,releases")]
    pub endpoints: Vec<String>,

    /// Collect these repositories (owner/name) instead of discovering them
    #[arg(long = "repo")]
    pub repos: Vec<String>,

    /// Directory for collected records
    #[arg(long, default_value = "data")]
    pub output_dir: PathBuf,

    /// API token
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// REST API base URL
    #[arg(long, default_value = DEFAULT_API_BASE_URL)]
    pub api_url: String,

    /// GraphQL endpoint URL
    #[arg(long, default_value = DEFAULT_GRAPHQL_URL)]
    pub graphql_url: String,

    /// REST page size (1-100)
    #[arg(long, default_value_t = DEFAULT_PER_PAGE, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub per_page: u32,

    /// Page-level retries for transient failures (0-20)
    #[arg(long, default_value_t = MAX_PAGE_RETRIES, value_parser = clap::value_parser!(u32).range(0..=20))]
    pub max_retries: u32,

    /// Concurrent repositories and requests (default: 4, max: 32)
    #[arg(long, value_parser = parse_concurrency)]
    pub concurrency: Option<usize>,

    /// JSON file with rate limiter tunables (missing fields use defaults)
    #[arg(long)]
    pub rate_limit_config: Option<PathBuf>,

    /// Process repositories that failed in an earlier run again
    #[arg(long, default_value_t = false)]
    pub retry_failed: bool,

    /// Start at this repository (inclusive)
    #[arg(long)]
    pub from_repo: Option<String>,

    /// Resume even if the configuration differs from the checkpoint's
    #[arg(long, default_value_t = false)]
    pub ignore_config_change: bool,

    /// Fail instead of waiting when another run holds the checkpoint lock
    #[arg(long, default_value_t = false)]
    pub no_wait: bool,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9090)
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,

    /// Write quota samples as JSON to this file when the run ends
    #[arg(long)]
    pub samples_out: Option<PathBuf>,
}

impl CollectArgs {
    /// Build the run configuration from the arguments
    pub fn to_config(&self) -> Result<CrawlConfig, CliError> {
        let unknown: Vec<&str> = self
            .endpoints
            .iter()
            .map(String::as_str)
            .filter(|e| !KNOWN_ENDPOINTS.contains(e))
            .collect();
        if !unknown.is_empty() {
            return Err(CliError::InvalidArgument(format!(
                "unknown endpoint(s) {}; supported: {}",
                unknown.join(", "),
                KNOWN_ENDPOINTS.join(", ")
            )));
        }
        if self.endpoints.is_empty() {
            return Err(CliError::InvalidArgument(
                "at least one endpoint is required".to_string(),
            ));
        }
        if let Some(bad) = self.repos.iter().find(|r| crate::source::split_repo(r).is_err()) {
            return Err(CliError::InvalidArgument(format!(
                "repository must be owner/name: {bad}"
            )));
        }

        let mut rate_limit = match &self.rate_limit_config {
            Some(path) => load_rate_limit_config(path)?,
            None => RateLimitConfig::default(),
        };
        if let Some(concurrency) = self.concurrency {
            rate_limit.max_concurrency = concurrency;
        }
        rate_limit
            .validate()
            .map_err(|e| CliError::ConfigurationError(format!("Invalid rate limit config: {e}")))?;

        let mut endpoints = self.endpoints.clone();
        endpoints.dedup();

        Ok(CrawlConfig {
            target: self.target.clone(),
            year: self.year,
            endpoints,
            repos: self.repos.clone(),
            per_page: self.per_page,
            max_page_retries: self.max_retries,
            api_base_url: self.api_url.clone(),
            graphql_url: self.graphql_url.clone(),
            output_dir: self.output_dir.clone(),
            rate_limit,
            token: self.token.clone(),
        })
    }

    /// Execute a collection run
    pub async fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<(), CliError> {
        let config = self.to_config()?;
        if config.token.is_none() {
            warn!("No API token configured, unauthenticated quota is much smaller");
        }

        let checkpoint = Arc::new(CheckpointManager::new(&cli.checkpoint));
        if self.no_wait {
            checkpoint.try_acquire_lock()?;
        } else {
            let waiting = checkpoint.clone();
            tokio::task::spawn_blocking(move || waiting.acquire_lock())
                .await
                .map_err(|e| CliError::ConfigurationError(format!("Lock task failed: {e}")))??;
        }
        self.open_checkpoint(&checkpoint, &config)?;

        if let Some(addr) = self.metrics_addr {
            crate::metrics::init_metrics(addr)
                .await
                .map_err(|e| CliError::ConfigurationError(e.to_string()))?;
        }

        let signals = shutdown::spawn_signal_handler(shutdown.clone(), checkpoint.clone());

        let client = Arc::new(ApiClient::new(&config)?);
        let source = Arc::new(ApiSource::new(client, &config));
        let limiter = Arc::new(AdaptiveRateLimiter::new(config.rate_limit.clone()));
        let progress = create_progress_bar(cli.output_format);

        let collector = Collector::new(
            config,
            source,
            limiter.clone(),
            checkpoint.clone(),
            shutdown,
        )
        .with_progress(progress.clone());

        let options = CollectOptions {
            retry_failed: self.retry_failed,
            from_repo: self.from_repo.clone(),
        };
        let result = collector.run(&options).await;

        progress.finish_and_clear();
        signals.abort();

        if let Some(path) = &self.samples_out {
            write_samples(path, &limiter)?;
        }
        checkpoint.release_lock();

        let report = result?;
        match cli.output_format {
            OutputFormat::Json => print_json(&report)?,
            OutputFormat::Human => print_report(&report, &cli.checkpoint),
        }
        Ok(())
    }

    /// Load and validate an existing checkpoint or start a new one
    fn open_checkpoint(&self, checkpoint: &CheckpointManager, config: &CrawlConfig) -> Result<(), CliError> {
        if !checkpoint.exists() {
            checkpoint.create_new(config)?;
            return Ok(());
        }

        checkpoint.load()?;
        if !checkpoint.validate_config(config) {
            if !self.ignore_config_change {
                return Err(CliError::ConfigurationError(format!(
                    "configuration differs from checkpoint {}; rerun with --ignore-config-change to resume anyway, or reset it",
                    checkpoint.path().display()
                )));
            }
            warn!("Resuming despite configuration change");
        }
        info!(path = %checkpoint.path().display(), "Resuming from checkpoint");
        Ok(())
    }
}

fn load_rate_limit_config(path: &Path) -> Result<RateLimitConfig, CliError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        CliError::ConfigurationError(format!("Failed to read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&contents).map_err(|e| {
        CliError::ConfigurationError(format!("Invalid rate limit config {}: {e}", path.display()))
    })
}

fn write_samples(path: &Path, limiter: &AdaptiveRateLimiter) -> Result<(), CliError> {
    let samples = limiter.samples();
    let json = serde_json::to_string_pretty(&samples)
        .map_err(|e| CliError::OutputError(format!("Failed to serialize samples: {e}")))?;
    std::fs::write(path, json)
        .map_err(|e| CliError::OutputError(format!("Failed to write {}: {e}", path.display())))?;
    info!(path = %path.display(), samples = samples.len(), "Quota samples written");
    Ok(())
}

fn print_report(report: &CollectReport, checkpoint: &Path) {
    if report.interrupted {
        println!("\nCollection interrupted; progress saved to {}", checkpoint.display());
        println!("Run the same command again to resume.");
    } else {
        println!("\nCollection finished!");
    }
    println!("Repositories tracked: {}", report.repos_discovered);
    println!("Repositories processed: {}", report.repos_processed);
    println!("Units completed: {}", report.units_completed);
    println!("Units skipped: {}", report.units_skipped);
    println!("Pages collected: {}", report.pages);
    println!("Records collected: {}", report.records);
    if report.units_failed > 0 {
        println!("Units failed: {} (retry with --retry-failed)", report.units_failed);
    }
}

/// Progress bar over repositories; hidden for JSON output
fn create_progress_bar(format: OutputFormat) -> ProgressBar {
    if format == OutputFormat::Json {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} repos ({percent}%) {msg}",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}
