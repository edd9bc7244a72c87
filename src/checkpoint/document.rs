//! Checkpoint document: the hierarchical progress ledger
//!
//! phase -> repository -> endpoint -> page. Everything here is plain data;
//! persistence and locking live in [`super::manager`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current checkpoint schema version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Status of a collection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    /// Not started
    #[default]
    Pending,
    /// Running (or interrupted while running)
    InProgress,
    /// Finished
    Complete,
}

/// Status of a repository or one of its endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Not started
    #[default]
    Pending,
    /// Started, not finished
    InProgress,
    /// All pages collected
    Complete,
    /// Stopped on an error
    Failed,
}

/// Progress of one phase
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PhaseStatus {
    /// Phase status
    pub status: PhaseState,
    /// First time the phase was entered
    pub started_at: Option<DateTime<Utc>>,
    /// When the phase completed
    pub completed_at: Option<DateTime<Utc>>,
}

/// Progress of one (repository, endpoint) unit
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EndpointProgress {
    /// Unit status
    pub status: UnitStatus,
    /// Pages durably collected
    pub pages_collected: u64,
    /// Records durably collected
    pub records_collected: u64,
    /// Highest page durably written (0 = none); the resume cursor
    pub last_page_written: u32,
    /// Opaque server cursor after `last_page_written` (cursor pagination only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cursor: Option<String>,
}

/// Progress of one repository
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RepoProgress {
    /// Derived from the endpoint statuses
    pub status: UnitStatus,
    /// First time any endpoint started
    pub started_at: Option<DateTime<Utc>>,
    /// When the last endpoint completed
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure message
    pub error: Option<String>,
    /// Whether the last failure is worth retrying
    #[serde(default)]
    pub retryable: bool,
    /// Per-endpoint progress
    pub endpoints: BTreeMap<String, EndpointProgress>,
}

impl RepoProgress {
    /// New pending repository tracking `endpoints`
    pub fn with_endpoints<'a>(endpoints: impl IntoIterator<Item = &'a String>) -> Self {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|name| (name.clone(), EndpointProgress::default()))
                .collect(),
            ..Default::default()
        }
    }

    /// Re-derive the repository status from its endpoints.
    ///
    /// Complete iff every endpoint is complete; otherwise failed if any
    /// endpoint failed, in progress if any started, pending if none did.
    pub fn refresh_status(&mut self, now: DateTime<Utc>) {
        let all_complete = !self.endpoints.is_empty()
            && self
                .endpoints
                .values()
                .all(|e| e.status == UnitStatus::Complete);

        let status = if all_complete {
            UnitStatus::Complete
        } else if self
            .endpoints
            .values()
            .any(|e| e.status == UnitStatus::Failed)
        {
            UnitStatus::Failed
        } else if self
            .endpoints
            .values()
            .any(|e| matches!(e.status, UnitStatus::InProgress | UnitStatus::Complete))
        {
            UnitStatus::InProgress
        } else {
            UnitStatus::Pending
        };

        match status {
            UnitStatus::Complete if self.status != UnitStatus::Complete => {
                self.completed_at = Some(now);
                self.error = None;
            }
            UnitStatus::Complete => {}
            _ => self.completed_at = None,
        }
        self.status = status;
    }
}

/// The whole persisted checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDocument {
    /// Schema version
    pub version: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Digest of the run configuration this checkpoint belongs to
    pub config_digest: String,
    /// Organisation or user being collected
    pub target: String,
    /// Calendar year being collected
    pub year: i32,
    /// Phase entered most recently
    pub current_phase: Option<String>,
    /// Endpoints every repository is tracked for
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Phase progress
    pub phases: BTreeMap<String, PhaseStatus>,
    /// Repository progress keyed by full name (`owner/name`)
    pub repos: BTreeMap<String, RepoProgress>,
}

impl CheckpointDocument {
    /// Empty document for a fresh run
    pub fn new(
        target: impl Into<String>,
        year: i32,
        endpoints: Vec<String>,
        config_digest: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            created_at: now,
            updated_at: now,
            config_digest,
            target: target.into(),
            year,
            current_phase: None,
            endpoints,
            phases: BTreeMap::new(),
            repos: BTreeMap::new(),
        }
    }

    /// Look up one unit
    pub fn endpoint(&self, repo: &str, endpoint: &str) -> Option<&EndpointProgress> {
        self.repos.get(repo)?.endpoints.get(endpoint)
    }

    /// Get or create the repository and endpoint entries for a unit
    pub fn endpoint_mut(&mut self, repo: &str, endpoint: &str) -> &mut EndpointProgress {
        let tracked = &self.endpoints;
        self.repos
            .entry(repo.to_string())
            .or_insert_with(|| RepoProgress::with_endpoints(tracked))
            .endpoints
            .entry(endpoint.to_string())
            .or_default()
    }

    /// Add repositories not yet tracked; returns how many were new
    pub fn add_repos(&mut self, repos: &[String]) -> usize {
        let mut added = 0;
        for repo in repos {
            if !self.repos.contains_key(repo) {
                self.repos
                    .insert(repo.clone(), RepoProgress::with_endpoints(&self.endpoints));
                added += 1;
            }
        }
        added
    }
}
