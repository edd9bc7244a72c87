//! Durable crawl progress
//!
//! A single JSON document records which phases, repositories, endpoints and
//! pages are done, so an interrupted run resumes without re-collecting.
//! Writes are atomic (temp file, fsync, rename) and a run lock keeps two
//! processes from sharing one checkpoint.

pub mod digest;
pub mod document;
pub mod lock;
pub mod manager;

pub use digest::config_digest;
pub use document::{
    CheckpointDocument, EndpointProgress, PhaseState, PhaseStatus, RepoProgress, UnitStatus,
    CHECKPOINT_VERSION,
};
pub use lock::{lock_path, CheckpointLock};
pub use manager::{CheckpointManager, CheckpointSummary};

/// Checkpoint errors
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error (corrupt or foreign file)
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Run lock error
    #[error("Lock error: {0}")]
    Lock(String),

    /// No document loaded or created
    #[error("No checkpoint loaded")]
    NotLoaded,

    /// Schema version differs from this build
    #[error("Checkpoint version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this build writes
        expected: u32,
        /// Version found on disk
        found: u32,
    },

    /// File exceeds the size cap
    #[error("Checkpoint too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual size
        size: u64,
        /// Maximum accepted size
        max: u64,
    },
}

/// Result alias for checkpoint operations
pub type CheckpointResult<T> = Result<T, CheckpointError>;
