//! Graceful shutdown coordination utilities.
//!
//! Provides a lightweight [`ShutdownCoordinator`] that can be shared across
//! tasks, plus the signal listener used by the binary. The first Ctrl+C or
//! SIGTERM saves the checkpoint and asks fetch loops to stop between pages;
//! a second one saves again and exits with status 130.

use crate::checkpoint::CheckpointManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Exit status after a second interrupt
pub const FORCED_EXIT_CODE: i32 = 130;

/// Shared handle to a shutdown coordinator.
pub type SharedShutdown = Arc<ShutdownCoordinator>;

/// Coordinates graceful shutdown across async tasks.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    is_shutdown: AtomicBool,
    notify: Notify,
}

impl ShutdownCoordinator {
    /// Create a new coordinator.
    pub fn new() -> Self {
        Self {
            is_shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Create a new shared coordinator wrapped in [`Arc`].
    pub fn shared() -> SharedShutdown {
        Arc::new(Self::new())
    }

    /// Request shutdown. Returns `true` only for the first request.
    pub fn request_shutdown(&self) -> bool {
        let first = !self.is_shutdown.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is requested. Returns immediately if already set.
    pub async fn wait_for_shutdown(&self) {
        let notified = self.notify.notified();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }
}

/// What an interrupt should do, given how many came before
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Save and stop between pages
    Graceful,
    /// Save and exit immediately
    ForceExit,
}

/// Save the checkpoint and escalate according to the interrupt count.
///
/// Saving is best effort; a checkpoint that was never loaded is skipped.
pub fn handle_interrupt(shutdown: &ShutdownCoordinator, checkpoint: &CheckpointManager) -> InterruptAction {
    if let Err(e) = checkpoint.save() {
        if !matches!(e, crate::checkpoint::CheckpointError::NotLoaded) {
            error!(error = %e, "Failed to save checkpoint on interrupt");
        }
    }
    if shutdown.request_shutdown() {
        warn!("Interrupt received - progress saved, finishing in-flight pages (interrupt again to exit)");
        InterruptAction::Graceful
    } else {
        warn!("Second interrupt received - progress saved, exiting");
        InterruptAction::ForceExit
    }
}

/// Resolve on the next Ctrl+C or SIGTERM
async fn next_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Spawn the signal listener for a collection run
pub fn spawn_signal_handler(shutdown: SharedShutdown, checkpoint: Arc<CheckpointManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = next_signal().await {
                error!(error = %e, "Failed to listen for signals");
                return;
            }
            if handle_interrupt(&shutdown, &checkpoint) == InterruptAction::ForceExit {
                std::process::exit(FORCED_EXIT_CODE);
            }
        }
    })
}
