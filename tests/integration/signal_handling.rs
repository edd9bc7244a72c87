//! Integration tests for interrupt handling and graceful shutdown

use crate::support::{pages, quiet_limiter, test_config, ScriptedFetcher};
use repo_crawler::checkpoint::CheckpointManager;
use repo_crawler::pagination::{Paginator, UnitOutcome};
use repo_crawler::shutdown::{handle_interrupt, InterruptAction, ShutdownCoordinator};
use repo_crawler::sink::{unit_path, JsonlSink};
use std::time::Duration;
use tempfile::TempDir;

const REPO: &str = "acme/widgets";

#[tokio::test]
async fn test_shutdown_stops_between_pages_and_saves() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let checkpoint = CheckpointManager::new(dir.path().join("checkpoint.json"));
    checkpoint.create_new(&config).unwrap();
    checkpoint.update_repos(&[REPO.to_string()]).unwrap();

    let limiter = quiet_limiter();
    let shutdown = ShutdownCoordinator::shared();
    let fetcher = ScriptedFetcher::numbered(pages(&[2, 2, 2, 2, 2])).shutdown_on(2, shutdown.clone());
    let out = dir.path().join("out");
    let mut sink = JsonlSink::for_unit(&out, REPO, "pulls").unwrap();

    let outcome = Paginator::new(&limiter, &checkpoint)
        .with_shutdown(shutdown.clone())
        .run(REPO, "pulls", &fetcher, &mut sink)
        .await
        .unwrap();

    // The in-flight page is finished, nothing after it is started
    assert_eq!(outcome, UnitOutcome::Interrupted { pages: 2, records: 4 });
    assert_eq!(fetcher.log().lock().unwrap().len(), 2);
    assert_eq!(JsonlSink::replay(&unit_path(&out, REPO, "pulls")).unwrap().len(), 2);

    let on_disk = CheckpointManager::new(checkpoint.path());
    on_disk.load().unwrap();
    assert_eq!(on_disk.get_resume_page(REPO, "pulls"), 3);
    assert!(!on_disk.is_repo_endpoint_complete(REPO, "pulls"));
}

#[tokio::test]
async fn test_first_interrupt_is_graceful_second_forces_exit() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let checkpoint = CheckpointManager::new(dir.path().join("checkpoint.json"));
    checkpoint.create_new(&config).unwrap();
    checkpoint.update_repos(&[REPO.to_string()]).unwrap();
    // Below the save threshold, so only held in memory
    checkpoint.update_progress(REPO, "pulls", 1, 5).unwrap();

    let shutdown = ShutdownCoordinator::shared();
    assert_eq!(
        handle_interrupt(&shutdown, &checkpoint),
        InterruptAction::Graceful
    );
    assert!(shutdown.is_shutdown_requested());

    let on_disk = CheckpointManager::new(checkpoint.path());
    on_disk.load().unwrap();
    assert_eq!(on_disk.get_resume_page(REPO, "pulls"), 2);

    assert_eq!(
        handle_interrupt(&shutdown, &checkpoint),
        InterruptAction::ForceExit
    );
}

#[tokio::test]
async fn test_interrupt_without_checkpoint_still_requests_shutdown() {
    let dir = TempDir::new().unwrap();
    let checkpoint = CheckpointManager::new(dir.path().join("never-created.json"));
    let shutdown = ShutdownCoordinator::shared();

    assert_eq!(
        handle_interrupt(&shutdown, &checkpoint),
        InterruptAction::Graceful
    );
    assert!(shutdown.is_shutdown_requested());
    assert!(!checkpoint.exists());
}

#[tokio::test]
async fn test_waiters_wake_on_request() {
    let shutdown = ShutdownCoordinator::shared();
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait_for_shutdown().await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown.request_shutdown();

    for waiter in waiters {
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    // Late waiters return immediately
    tokio::time::timeout(Duration::from_millis(100), shutdown.wait_for_shutdown())
        .await
        .unwrap();
}
