//! Advisory lock held for the duration of a collection run
//!
//! Uses fd-lock on a `.lock` file next to the checkpoint. This is the only
//! inter-process mutual exclusion in the crawler.

use super::CheckpointError;
use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive run lock; released when dropped
pub struct CheckpointLock {
    // Holding the descriptor keeps the flock; closing it on drop releases it.
    _lock: RwLock<File>,
    path: PathBuf,
}

impl std::fmt::Debug for CheckpointLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointLock")
            .field("path", &self.path)
            .finish()
    }
}

/// Lock file path for a checkpoint file
pub fn lock_path(checkpoint: &Path) -> PathBuf {
    checkpoint.with_extension("lock")
}

fn open_lock_file(checkpoint: &Path) -> Result<(RwLock<File>, PathBuf), CheckpointError> {
    if let Some(parent) = checkpoint.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| CheckpointError::Io(e.to_string()))?;
        }
    }

    let path = lock_path(checkpoint);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| CheckpointError::Lock(format!("Failed to open lock file: {e}")))?;
    Ok((RwLock::new(file), path))
}

impl CheckpointLock {
    /// Acquire the exclusive run lock, blocking until it is free
    pub fn acquire(checkpoint: &Path) -> Result<Self, CheckpointError> {
        let (mut lock, path) = open_lock_file(checkpoint)?;
        debug!(path = %path.display(), "Acquiring checkpoint lock");
        let guard = lock
            .write()
            .map_err(|e| CheckpointError::Lock(format!("Failed to acquire lock: {e}")))?;
        std::mem::forget(guard);
        Ok(Self { _lock: lock, path })
    }

    /// Acquire the run lock without blocking
    ///
    /// Returns an error immediately if another run holds it.
    pub fn try_acquire(checkpoint: &Path) -> Result<Self, CheckpointError> {
        let (mut lock, path) = open_lock_file(checkpoint)?;
        let guard = lock.try_write().map_err(|e| {
            CheckpointError::Lock(format!(
                "Checkpoint {} is locked by another run: {e}",
                path.display()
            ))
        })?;
        std::mem::forget(guard);
        Ok(Self { _lock: lock, path })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
