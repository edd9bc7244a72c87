//! CLI error types and conversions

use crate::checkpoint::CheckpointError;
use crate::client::FetchError;
use crate::collector::CollectError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Checkpoint error
    #[error("checkpoint error: {0}")]
    CheckpointError(#[from] CheckpointError),

    /// Collection error
    #[error("collection error: {0}")]
    CollectError(#[from] CollectError),

    /// HTTP client setup error
    #[error("client error: {0}")]
    FetchError(#[from] FetchError),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Output could not be written
    #[error("output error: {0}")]
    OutputError(String),
}
