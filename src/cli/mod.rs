//! CLI command implementations

pub mod collect;
pub mod error;
pub mod reset;
pub mod status;

pub use collect::CollectArgs;
pub use error::CliError;
pub use reset::ResetArgs;
pub use status::StatusArgs;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Default checkpoint location
pub const DEFAULT_CHECKPOINT: &str = "checkpoint.json";

/// Repository crawler CLI
#[derive(Parser, Debug)]
#[command(name = "repo-crawler")]
#[command(about = "Resumable, rate-limit aware collection of repository activity", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Checkpoint file
    #[arg(long, global = true, default_value = DEFAULT_CHECKPOINT)]
    pub checkpoint: PathBuf,

    /// Output format (json or human)
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Human)]
    pub output_format: OutputFormat,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run or resume a collection
    Collect(CollectArgs),

    /// Summarise a checkpoint
    Status(StatusArgs),

    /// Delete a checkpoint and its lock file
    Reset(ResetArgs),
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

fn print_json(value: &impl serde::Serialize) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CliError::OutputError(format!("Failed to serialize output: {e}")))?;
    println!("{json}");
    Ok(())
}
