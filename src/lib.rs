//! # Repo Crawler Library
//!
//! A resumable crawler for paginated REST and GraphQL repository APIs that
//! enforce a primary request quota, an undocumented per-minute burst limit
//! and server-driven backoff. Runs can last hours and survive interruption
//! at any point.
//!
//! ## Features
//!
//! - **Adaptive admission control**: concurrency cap, token bucket, circuit
//!   breaker and quota-aware delays in one `acquire` call
//! - **Secondary limit protection**: rolling request-rate window with a
//!   growing backoff multiplier
//! - **Crash-consistent checkpoints**: atomic JSON checkpoint resuming at
//!   page granularity, guarded by an inter-process lock
//! - **Durable sinks**: one fsynced JSON line per page, replay-safe
//! - **Graceful shutdown**: first interrupt saves and drains, second exits
//!
//! ## Quick Start
//!
//! ```no_run
//! use repo_crawler::checkpoint::CheckpointManager;
//! use repo_crawler::client::ApiClient;
//! use repo_crawler::collector::{CollectOptions, Collector};
//! use repo_crawler::config::CrawlConfig;
//! use repo_crawler::ratelimit::AdaptiveRateLimiter;
//! use repo_crawler::shutdown::ShutdownCoordinator;
//! use repo_crawler::source::ApiSource;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CrawlConfig::new("rust-lang", 2024);
//!
//! let checkpoint = Arc::new(CheckpointManager::new("checkpoint.json"));
//! checkpoint.try_acquire_lock()?;
//! if checkpoint.exists() {
//!     checkpoint.load()?;
//! } else {
//!     checkpoint.create_new(&config)?;
//! }
//!
//! let client = Arc::new(ApiClient::new(&config)?);
//! let collector = Collector::new(
//!     config.clone(),
//!     Arc::new(ApiSource::new(client, &config)),
//!     Arc::new(AdaptiveRateLimiter::new(config.rate_limit.clone())),
//!     checkpoint,
//!     ShutdownCoordinator::shared(),
//! );
//! let report = collector.run(&CollectOptions::default()).await?;
//! println!("collected {} pages", report.pages);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`ratelimit`] - admission control (token bucket, circuit breaker, adaptive limiter)
//! - [`checkpoint`] - durable, hierarchical progress ledger
//! - [`pagination`] - resumable page loop for one repository endpoint
//! - [`sink`] - append-only record output
//! - [`client`] - HTTP transport and the REST / GraphQL page fetchers
//! - [`source`] - endpoint catalogue and repository discovery
//! - [`collector`] - discovery and collection phases
//! - [`shutdown`] - graceful shutdown and signal handling

#![warn(missing_docs)]
#![warn(clippy::all)]

/// CLI command implementations
pub mod cli;

/// HTTP transport and page fetchers
pub mod client;

/// Checkpoint persistence
pub mod checkpoint;

/// Phase orchestration
pub mod collector;

/// Run configuration
pub mod config;

/// Prometheus metrics
pub mod metrics;

/// Paginated fetch protocol
pub mod pagination;

/// Admission control and throttling
pub mod ratelimit;

/// Graceful shutdown coordination shared across modules
pub mod shutdown;

/// Durable record output
pub mod sink;

/// Endpoint catalogue and discovery
pub mod source;

// Re-export commonly used types
pub use checkpoint::CheckpointManager;
pub use collector::{CollectOptions, CollectReport, Collector};
pub use config::CrawlConfig;
pub use ratelimit::{AdaptiveRateLimiter, ApiType, RequestPriority};
