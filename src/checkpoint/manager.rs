//! Checkpoint manager: the only owner of the checkpoint document
//!
//! Every mutating call persists the whole document with a
//! write-temp-then-rename before returning, except `update_progress`, which
//! coalesces writes (see [`SAVE_EVERY_PAGES`] / [`SAVE_EVERY_RECORDS`]).

use super::digest::config_digest;
use super::document::{
    CheckpointDocument, EndpointProgress, PhaseState, PhaseStatus, UnitStatus, CHECKPOINT_VERSION,
};
use super::lock::CheckpointLock;
use super::{CheckpointError, CheckpointResult};
use crate::config::CrawlConfig;
use chrono::Utc;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Maximum accepted checkpoint size (64 MB) to prevent memory exhaustion
pub const MAX_CHECKPOINT_SIZE: u64 = 64 * 1024 * 1024;

/// `update_progress` persists at least every this many pages
pub const SAVE_EVERY_PAGES: u32 = 10;

/// `update_progress` persists at least every this many records
pub const SAVE_EVERY_RECORDS: u64 = 100;

#[derive(Debug, Default)]
struct ManagerInner {
    document: Option<CheckpointDocument>,
    pages_since_save: u32,
    records_since_save: u64,
}

/// Counts per repository status, for operator output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointSummary {
    /// Organisation or user
    pub target: String,
    /// Collected year
    pub year: i32,
    /// Most recent phase
    pub current_phase: Option<String>,
    /// Phases already complete
    pub phases_complete: Vec<String>,
    /// Tracked repositories
    pub repos_total: usize,
    /// Repositories not started
    pub repos_pending: usize,
    /// Repositories started but unfinished
    pub repos_in_progress: usize,
    /// Repositories fully collected
    pub repos_complete: usize,
    /// Repositories stopped on an error
    pub repos_failed: usize,
    /// Pages collected across all units
    pub pages_collected: u64,
    /// Records collected across all units
    pub records_collected: u64,
}

/// Durable, hierarchical progress ledger
#[derive(Debug)]
pub struct CheckpointManager {
    path: PathBuf,
    inner: Mutex<ManagerInner>,
    run_lock: Mutex<Option<CheckpointLock>>,
}

impl CheckpointManager {
    /// Manager for the checkpoint at `path`. Touches nothing on disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(ManagerInner::default()),
            run_lock: Mutex::new(None),
        }
    }

    /// Checkpoint file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a checkpoint file exists
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn inner(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the run lock, blocking until no other process holds it
    pub fn acquire_lock(&self) -> CheckpointResult<()> {
        let lock = match CheckpointLock::try_acquire(&self.path) {
            Ok(lock) => lock,
            Err(CheckpointError::Lock(_)) => {
                info!(path = %self.path.display(), "Checkpoint locked by another run, waiting");
                CheckpointLock::acquire(&self.path)?
            }
            Err(e) => return Err(e),
        };
        info!(path = %lock.path().display(), "Checkpoint lock acquired");
        *self.run_lock.lock().unwrap_or_else(PoisonError::into_inner) = Some(lock);
        Ok(())
    }

    /// Take the run lock or fail immediately if it is held
    pub fn try_acquire_lock(&self) -> CheckpointResult<()> {
        let lock = CheckpointLock::try_acquire(&self.path)?;
        *self.run_lock.lock().unwrap_or_else(PoisonError::into_inner) = Some(lock);
        Ok(())
    }

    /// Release the run lock if held
    pub fn release_lock(&self) {
        self.run_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Start a fresh document for `config` and persist it
    pub fn create_new(&self, config: &CrawlConfig) -> CheckpointResult<()> {
        let digest = config_digest(config)?;
        let document = CheckpointDocument::new(
            config.target.clone(),
            config.year,
            config.endpoints.clone(),
            digest,
        );
        info!(
            path = %self.path.display(),
            target = %config.target,
            year = config.year,
            "Creating new checkpoint"
        );

        let mut inner = self.inner();
        inner.document = Some(document);
        self.persist(&mut inner)
    }

    /// Load the document from disk
    pub fn load(&self) -> CheckpointResult<()> {
        debug!(path = %self.path.display(), "Loading checkpoint");

        let metadata =
            std::fs::metadata(&self.path).map_err(|e| CheckpointError::Io(e.to_string()))?;
        if metadata.len() > MAX_CHECKPOINT_SIZE {
            return Err(CheckpointError::TooLarge {
                size: metadata.len(),
                max: MAX_CHECKPOINT_SIZE,
            });
        }

        let contents =
            std::fs::read_to_string(&self.path).map_err(|e| CheckpointError::Io(e.to_string()))?;
        let document: CheckpointDocument = serde_json::from_str(&contents).map_err(|e| {
            warn!(error = %e, "Failed to deserialize checkpoint");
            CheckpointError::Deserialization(e.to_string())
        })?;

        if document.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                expected: CHECKPOINT_VERSION,
                found: document.version,
            });
        }

        info!(
            repos = document.repos.len(),
            current_phase = document.current_phase.as_deref().unwrap_or("-"),
            "Checkpoint loaded"
        );

        let mut inner = self.inner();
        inner.document = Some(document);
        inner.pages_since_save = 0;
        inner.records_since_save = 0;
        Ok(())
    }

    /// Persist the current document atomically
    pub fn save(&self) -> CheckpointResult<()> {
        let mut inner = self.inner();
        self.persist(&mut inner)
    }

    fn persist(&self, inner: &mut ManagerInner) -> CheckpointResult<()> {
        let document = inner.document.as_ref().ok_or(CheckpointError::NotLoaded)?;
        write_atomic(&self.path, document)?;
        inner.pages_since_save = 0;
        inner.records_since_save = 0;
        Ok(())
    }

    /// Apply `f` to the loaded document, stamp `updated_at` and persist
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut CheckpointDocument) -> R,
    ) -> CheckpointResult<R> {
        let mut inner = self.inner();
        let document = inner.document.as_mut().ok_or(CheckpointError::NotLoaded)?;
        let result = f(document);
        document.updated_at = Utc::now();
        self.persist(&mut inner)?;
        Ok(result)
    }

    fn read<R>(&self, f: impl FnOnce(&CheckpointDocument) -> R) -> Option<R> {
        self.inner().document.as_ref().map(f)
    }

    /// Snapshot of the loaded document
    pub fn document(&self) -> Option<CheckpointDocument> {
        self.read(Clone::clone)
    }

    /// Whether `config` matches the configuration the checkpoint was made with.
    ///
    /// A mismatch is logged and reported, never raised; the caller decides
    /// whether to resume anyway.
    pub fn validate_config(&self, config: &CrawlConfig) -> bool {
        let stored = match self.read(|d| d.config_digest.clone()) {
            Some(stored) => stored,
            None => return false,
        };
        match config_digest(config) {
            Ok(current) if current == stored => true,
            Ok(current) => {
                warn!(
                    stored = %stored,
                    current = %current,
                    "Configuration changed since checkpoint was created"
                );
                false
            }
            Err(e) => {
                warn!(error = %e, "Could not digest configuration");
                false
            }
        }
    }

    /// Enter phase `name`
    pub fn set_current_phase(&self, name: &str) -> CheckpointResult<()> {
        info!(phase = name, "Entering phase");
        self.mutate(|doc| {
            let now = Utc::now();
            doc.current_phase = Some(name.to_string());
            let phase = doc.phases.entry(name.to_string()).or_default();
            if phase.status != PhaseState::Complete {
                phase.status = PhaseState::InProgress;
            }
            phase.started_at.get_or_insert(now);
        })
    }

    /// Mark phase `name` complete
    pub fn mark_phase_complete(&self, name: &str) -> CheckpointResult<()> {
        info!(phase = name, "Phase complete");
        self.mutate(|doc| {
            let now = Utc::now();
            let phase = doc.phases.entry(name.to_string()).or_insert(PhaseStatus {
                started_at: Some(now),
                ..Default::default()
            });
            phase.status = PhaseState::Complete;
            phase.completed_at = Some(now);
        })
    }

    /// Whether phase `name` has completed
    pub fn is_phase_complete(&self, name: &str) -> bool {
        self.read(|doc| {
            doc.phases
                .get(name)
                .is_some_and(|p| p.status == PhaseState::Complete)
        })
        .unwrap_or(false)
    }

    /// Track `repos`; repositories already tracked keep their progress
    pub fn update_repos(&self, repos: &[String]) -> CheckpointResult<()> {
        let added = self.mutate(|doc| doc.add_repos(repos))?;
        info!(added, total = repos.len(), "Repository list updated");
        Ok(())
    }

    /// Repositories still to collect, sorted by name.
    ///
    /// Skips complete repositories, and failed ones unless `retry_failed`.
    /// With `from_repo`, the list starts at that repository (inclusive);
    /// an unknown name is logged and ignored.
    pub fn get_repos_to_process(&self, retry_failed: bool, from_repo: Option<&str>) -> Vec<String> {
        let repos: Vec<String> = self
            .read(|doc| {
                doc.repos
                    .iter()
                    .filter(|(_, progress)| match progress.status {
                        UnitStatus::Complete => false,
                        UnitStatus::Failed => retry_failed,
                        UnitStatus::Pending | UnitStatus::InProgress => true,
                    })
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();

        match from_repo {
            Some(start) => match repos.iter().position(|name| name == start) {
                Some(index) => repos[index..].to_vec(),
                None => {
                    warn!(
                        from_repo = start,
                        "Start repository not among pending repositories, processing all"
                    );
                    repos
                }
            },
            None => repos,
        }
    }

    /// Mark a unit as started
    pub fn mark_repo_endpoint_in_progress(&self, repo: &str, endpoint: &str) -> CheckpointResult<()> {
        debug!(repo, endpoint, "Unit in progress");
        self.mutate(|doc| {
            let now = Utc::now();
            let progress = doc.endpoint_mut(repo, endpoint);
            if progress.status != UnitStatus::Complete {
                progress.status = UnitStatus::InProgress;
            }
            if let Some(r) = doc.repos.get_mut(repo) {
                r.started_at.get_or_insert(now);
                if !r.endpoints.values().any(|e| e.status == UnitStatus::Failed) {
                    r.error = None;
                }
                r.refresh_status(now);
            }
        })
    }

    /// Mark a unit complete. Calling it again is a no-op.
    pub fn mark_repo_endpoint_complete(&self, repo: &str, endpoint: &str) -> CheckpointResult<()> {
        if self.is_repo_endpoint_complete(repo, endpoint) {
            return Ok(());
        }
        let repo_status = self.mutate(|doc| {
            let now = Utc::now();
            doc.endpoint_mut(repo, endpoint).status = UnitStatus::Complete;
            doc.repos.get_mut(repo).map(|r| {
                r.started_at.get_or_insert(now);
                r.refresh_status(now);
                r.status
            })
        })?;
        info!(repo, endpoint, ?repo_status, "Unit complete");
        Ok(())
    }

    /// Mark a unit failed
    pub fn mark_repo_endpoint_failed(
        &self,
        repo: &str,
        endpoint: &str,
        error: &str,
        retryable: bool,
    ) -> CheckpointResult<()> {
        warn!(repo, endpoint, error, retryable, "Unit failed");
        self.mutate(|doc| {
            let now = Utc::now();
            doc.endpoint_mut(repo, endpoint).status = UnitStatus::Failed;
            if let Some(r) = doc.repos.get_mut(repo) {
                r.error = Some(format!("{endpoint}: {error}"));
                r.retryable = retryable;
                r.refresh_status(now);
            }
        })
    }

    /// Whether a unit is complete
    pub fn is_repo_endpoint_complete(&self, repo: &str, endpoint: &str) -> bool {
        self.read(|doc| {
            doc.endpoint(repo, endpoint)
                .is_some_and(|e| e.status == UnitStatus::Complete)
        })
        .unwrap_or(false)
    }

    /// Next page to request for a unit (`last_page_written + 1`)
    pub fn get_resume_page(&self, repo: &str, endpoint: &str) -> u32 {
        self.read(|doc| {
            doc.endpoint(repo, endpoint)
                .map(|e| e.last_page_written)
                .unwrap_or(0)
        })
        .unwrap_or(0)
            + 1
    }

    /// Opaque cursor to resume a cursor-paginated unit from
    pub fn get_resume_cursor(&self, repo: &str, endpoint: &str) -> Option<String> {
        self.read(|doc| {
            doc.endpoint(repo, endpoint)
                .and_then(|e| e.last_cursor.clone())
        })
        .flatten()
    }

    /// Record that `page` (with `records` items) is durably stored.
    ///
    /// Saves are coalesced; a save is only guaranteed once the unit completes
    /// or the manager is saved explicitly.
    pub fn update_progress(
        &self,
        repo: &str,
        endpoint: &str,
        page: u32,
        records: u64,
    ) -> CheckpointResult<()> {
        self.record_progress(repo, endpoint, page, records, None)
    }

    /// [`Self::update_progress`] for cursor pagination, also storing the
    /// cursor that follows `page`
    pub fn update_cursor_progress(
        &self,
        repo: &str,
        endpoint: &str,
        page: u32,
        records: u64,
        cursor: Option<&str>,
    ) -> CheckpointResult<()> {
        self.record_progress(repo, endpoint, page, records, Some(cursor))
    }

    fn record_progress(
        &self,
        repo: &str,
        endpoint: &str,
        page: u32,
        records: u64,
        cursor: Option<Option<&str>>,
    ) -> CheckpointResult<()> {
        let mut inner = self.inner();
        let document = inner.document.as_mut().ok_or(CheckpointError::NotLoaded)?;
        let progress: &mut EndpointProgress = document.endpoint_mut(repo, endpoint);

        if page <= progress.last_page_written {
            debug!(
                repo,
                endpoint,
                page,
                last_page_written = progress.last_page_written,
                "Ignoring stale progress update"
            );
            return Ok(());
        }

        progress.last_page_written = page;
        progress.pages_collected += 1;
        progress.records_collected += records;
        if let Some(cursor) = cursor {
            progress.last_cursor = cursor.map(str::to_string);
        }
        let started = progress.status == UnitStatus::Pending;
        if started {
            progress.status = UnitStatus::InProgress;
        }
        let now = Utc::now();
        if started {
            if let Some(r) = document.repos.get_mut(repo) {
                r.started_at.get_or_insert(now);
                r.refresh_status(now);
            }
        }
        document.updated_at = now;

        inner.pages_since_save += 1;
        inner.records_since_save += records;
        if inner.pages_since_save >= SAVE_EVERY_PAGES
            || inner.records_since_save >= SAVE_EVERY_RECORDS
        {
            self.persist(&mut inner)?;
        }
        Ok(())
    }

    /// Counts per status
    pub fn summary(&self) -> Option<CheckpointSummary> {
        self.read(|doc| {
            let mut summary = CheckpointSummary {
                target: doc.target.clone(),
                year: doc.year,
                current_phase: doc.current_phase.clone(),
                phases_complete: doc
                    .phases
                    .iter()
                    .filter(|(_, p)| p.status == PhaseState::Complete)
                    .map(|(name, _)| name.clone())
                    .collect(),
                repos_total: doc.repos.len(),
                ..Default::default()
            };
            for repo in doc.repos.values() {
                match repo.status {
                    UnitStatus::Pending => summary.repos_pending += 1,
                    UnitStatus::InProgress => summary.repos_in_progress += 1,
                    UnitStatus::Complete => summary.repos_complete += 1,
                    UnitStatus::Failed => summary.repos_failed += 1,
                }
                for endpoint in repo.endpoints.values() {
                    summary.pages_collected += endpoint.pages_collected;
                    summary.records_collected += endpoint.records_collected;
                }
            }
            summary
        })
    }

    /// Delete the checkpoint file and forget the loaded document.
    ///
    /// The lock file stays in place so every run keeps locking the same
    /// inode. Returns whether a file was removed.
    pub fn remove(&self) -> CheckpointResult<bool> {
        let mut inner = self.inner();
        inner.document = None;
        inner.pages_since_save = 0;
        inner.records_since_save = 0;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Checkpoint removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CheckpointError::Io(e.to_string())),
        }
    }
}

/// Write `document` to `path` through a temp file in the same directory.
///
/// The temp file is removed on any failure, leaving the previous file intact.
fn write_atomic(path: &Path, document: &CheckpointDocument) -> CheckpointResult<()> {
    let json = serde_json::to_string_pretty(document)
        .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

    let parent_dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent_dir).map_err(|e| CheckpointError::Io(e.to_string()))?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
        .map_err(|e| CheckpointError::Io(format!("Failed to create temp file: {e}")))?;
    temp_file
        .write_all(json.as_bytes())
        .map_err(|e| CheckpointError::Io(format!("Failed to write to temp file: {e}")))?;
    temp_file
        .flush()
        .map_err(|e| CheckpointError::Io(format!("Failed to flush temp file: {e}")))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| CheckpointError::Io(format!("Failed to sync temp file: {e}")))?;
    temp_file
        .persist(path)
        .map_err(|e| CheckpointError::Io(format!("Failed to persist temp file: {e}")))?;

    // Make the rename itself durable
    if let Ok(dir) = std::fs::File::open(parent_dir) {
        let _ = dir.sync_all();
    }

    debug!(
        path = %path.display(),
        repos = document.repos.len(),
        "Checkpoint saved"
    );
    Ok(())
}
