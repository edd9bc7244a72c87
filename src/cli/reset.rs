//! Reset command: delete a checkpoint so the next run starts fresh

use super::{Cli, CliError};
use crate::checkpoint::CheckpointManager;
use clap::Parser;
use tracing::info;

/// Arguments for the reset command
#[derive(Parser, Debug)]
pub struct ResetArgs {
    /// Also delete collected records in this directory
    #[arg(long)]
    pub output_dir: Option<std::path::PathBuf>,
}

impl ResetArgs {
    /// Delete the checkpoint (and optionally the records).
    ///
    /// Refuses while another run holds the checkpoint lock, and keeps the
    /// lock until everything is deleted.
    pub fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let checkpoint = CheckpointManager::new(&cli.checkpoint);
        checkpoint.try_acquire_lock()?;
        let result = self.remove_under_lock(&checkpoint);
        checkpoint.release_lock();

        if result? {
            println!("Removed checkpoint {}", cli.checkpoint.display());
        } else {
            println!("No checkpoint at {}", cli.checkpoint.display());
        }
        Ok(())
    }

    fn remove_under_lock(&self, checkpoint: &CheckpointManager) -> Result<bool, CliError> {
        let existed = checkpoint.remove()?;

        if let Some(dir) = &self.output_dir {
            if dir.exists() {
                info!(path = %dir.display(), "Deleting collected records");
                std::fs::remove_dir_all(dir).map_err(|e| {
                    CliError::OutputError(format!("Failed to delete {}: {e}", dir.display()))
                })?;
            }
        }
        Ok(existed)
    }
}
