//! Durable, append-only record output
//!
//! Each checkpoint unit (repository + endpoint) gets one JSON Lines file with
//! one line per page. A page is only reported to the checkpoint after its
//! line has been flushed and fsynced, so a crash can at worst leave a page
//! that is written again on resume. [`JsonlSink::replay`] collapses those
//! duplicates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Sink errors
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A complete line in the middle of the file does not parse
    #[error("corrupt record at {path}:{line}: {reason}")]
    Corrupt {
        /// File path
        path: String,
        /// 1-based line number
        line: usize,
        /// Parser message
        reason: String,
    },
}

/// Result type for sink operations
pub type SinkResult<T> = Result<T, SinkError>;

/// Run blocking file I/O (writes plus fsync) from async code.
///
/// On a multi-threaded runtime the worker is handed over with
/// `block_in_place` so other tasks keep running; elsewhere `f` runs inline.
pub fn blocking_io<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Destination for fetched pages
pub trait RecordSink: Send {
    /// Durably append one page.
    ///
    /// Must not return before the page survives a crash.
    fn append_page(&mut self, page: u32, cursor: Option<&str>, items: &[Value]) -> SinkResult<()>;
}

/// One persisted page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    /// 1-based page ordinal within the unit
    pub page: u32,
    /// Cursor the page was requested with (cursor pagination only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Time the page was written
    pub written_at: DateTime<Utc>,
    /// Raw records
    pub items: Vec<Value>,
}

#[derive(Serialize)]
struct PageRecordRef<'a> {
    page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
    written_at: DateTime<Utc>,
    items: &'a [Value],
}

/// JSON Lines sink for one unit
#[derive(Debug)]
pub struct JsonlSink {
    file: File,
    path: PathBuf,
    pages_written: u64,
}

/// File holding the records of `endpoint` for `repo` below `root`
pub fn unit_path(root: &Path, repo: &str, endpoint: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in repo.split('/').filter(|p| !p.is_empty() && *p != "." && *p != "..") {
        path.push(part);
    }
    path.push(format!("{endpoint}.jsonl"));
    path
}

impl JsonlSink {
    /// Open (or create) the unit file at `path` for appending.
    ///
    /// A torn trailing line left by a crash is cut off first so the next
    /// append starts on a clean line.
    pub fn open(path: impl Into<PathBuf>) -> SinkResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SinkError::Io(format!("Failed to create directory: {e}")))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| SinkError::Io(format!("Failed to open {}: {e}", path.display())))?;
        truncate_torn_tail(&mut file, &path)?;

        debug!(path = %path.display(), "Record sink opened");
        Ok(Self {
            file,
            path,
            pages_written: 0,
        })
    }

    /// Open the unit file for `repo`/`endpoint` below `root`
    pub fn for_unit(root: &Path, repo: &str, endpoint: &str) -> SinkResult<Self> {
        Self::open(unit_path(root, repo, endpoint))
    }

    /// Unit file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pages appended through this handle
    pub fn pages_written(&self) -> u64 {
        self.pages_written
    }

    /// Read back every page of a unit file, one record per page number.
    ///
    /// When a page appears more than once the last copy wins. A trailing
    /// line that does not parse is an interrupted write and is skipped;
    /// anywhere else it is an error.
    pub fn replay(path: &Path) -> SinkResult<Vec<PageRecord>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SinkError::Io(e.to_string())),
        };

        let lines: Vec<&str> = contents.split('\n').collect();
        let last_index = lines.len().saturating_sub(1);
        let mut pages = BTreeMap::new();

        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PageRecord>(line) {
                Ok(record) => {
                    pages.insert(record.page, record);
                }
                Err(e) if index == last_index => {
                    warn!(
                        path = %path.display(),
                        line = index + 1,
                        error = %e,
                        "Skipping torn trailing record"
                    );
                }
                Err(e) => {
                    return Err(SinkError::Corrupt {
                        path: path.display().to_string(),
                        line: index + 1,
                        reason: e.to_string(),
                    })
                }
            }
        }

        Ok(pages.into_values().collect())
    }
}

impl RecordSink for JsonlSink {
    fn append_page(&mut self, page: u32, cursor: Option<&str>, items: &[Value]) -> SinkResult<()> {
        let record = PageRecordRef {
            page,
            cursor,
            written_at: Utc::now(),
            items,
        };
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| SinkError::Serialization(e.to_string()))?;
        line.push(b'\n');

        self.file
            .write_all(&line)
            .map_err(|e| SinkError::Io(format!("Failed to write page {page}: {e}")))?;
        self.file
            .flush()
            .map_err(|e| SinkError::Io(format!("Failed to flush page {page}: {e}")))?;
        self.file
            .sync_data()
            .map_err(|e| SinkError::Io(format!("Failed to sync page {page}: {e}")))?;

        self.pages_written += 1;
        debug!(path = %self.path.display(), page, records = items.len(), "Page appended");
        Ok(())
    }
}

/// Cut the file back to its last newline if it ends mid-line
fn truncate_torn_tail(file: &mut File, path: &Path) -> SinkResult<()> {
    let len = file
        .metadata()
        .map_err(|e| SinkError::Io(e.to_string()))?
        .len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))
        .and_then(|_| file.read_exact(&mut last))
        .map_err(|e| SinkError::Io(e.to_string()))?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut contents = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_end(&mut contents))
        .map_err(|e| SinkError::Io(e.to_string()))?;
    let keep = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|pos| pos as u64 + 1)
        .unwrap_or(0);

    info!(
        path = %path.display(),
        dropped_bytes = len - keep,
        "Truncating torn trailing record"
    );
    file.set_len(keep)
        .and_then(|_| file.sync_data())
        .map_err(|e| SinkError::Io(e.to_string()))?;
    Ok(())
}
