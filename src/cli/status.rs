//! Status command: summarise a checkpoint without touching it

use super::{print_json, Cli, CliError, OutputFormat};
use crate::checkpoint::{CheckpointManager, UnitStatus};
use clap::Parser;
use serde_json::json;

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// List failed repositories with their last error
    #[arg(long, default_value_t = false)]
    pub failed: bool,
}

impl StatusArgs {
    /// Print the checkpoint summary
    pub fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let checkpoint = CheckpointManager::new(&cli.checkpoint);
        if !checkpoint.exists() {
            return Err(CliError::InvalidArgument(format!(
                "no checkpoint at {}",
                cli.checkpoint.display()
            )));
        }
        checkpoint.load()?;

        let summary = checkpoint
            .summary()
            .ok_or(crate::checkpoint::CheckpointError::NotLoaded)?;
        let failed: Vec<(String, Option<String>, bool)> = if self.failed {
            checkpoint
                .document()
                .map(|doc| {
                    doc.repos
                        .into_iter()
                        .filter(|(_, r)| r.status == UnitStatus::Failed)
                        .map(|(name, r)| (name, r.error, r.retryable))
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        match cli.output_format {
            OutputFormat::Json => {
                let failed: Vec<_> = failed
                    .iter()
                    .map(|(repo, error, retryable)| {
                        json!({"repo": repo, "error": error, "retryable": retryable})
                    })
                    .collect();
                print_json(&json!({"summary": summary, "failed": failed}))?;
            }
            OutputFormat::Human => {
                println!("Checkpoint: {}", cli.checkpoint.display());
                println!("Target: {} ({})", summary.target, summary.year);
                println!(
                    "Phase: {}",
                    summary.current_phase.as_deref().unwrap_or("not started")
                );
                if !summary.phases_complete.is_empty() {
                    println!("Completed phases: {}", summary.phases_complete.join(", "));
                }
                println!(
                    "Repositories: {} total, {} complete, {} in progress, {} pending, {} failed",
                    summary.repos_total,
                    summary.repos_complete,
                    summary.repos_in_progress,
                    summary.repos_pending,
                    summary.repos_failed
                );
                println!(
                    "Collected: {} pages, {} records",
                    summary.pages_collected, summary.records_collected
                );
                for (repo, error, retryable) in &failed {
                    println!(
                        "  FAILED {repo}: {}{}",
                        error.as_deref().unwrap_or("unknown error"),
                        if *retryable { " (retryable)" } else { "" }
                    );
                }
            }
        }
        Ok(())
    }
}
