//! Integration tests for crash-consistent resume of a single unit

use crate::support::{pages, quiet_limiter, test_config, ScriptedFetcher};
use repo_crawler::checkpoint::{CheckpointManager, UnitStatus};
use repo_crawler::client::FetchError;
use repo_crawler::pagination::{PageRequest, PaginationError, Paginator, UnitOutcome};
use repo_crawler::sink::{unit_path, JsonlSink};
use std::collections::HashSet;
use tempfile::TempDir;

const REPO: &str = "acme/widgets";

fn setup() -> (TempDir, CheckpointManager) {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let checkpoint = CheckpointManager::new(dir.path().join("checkpoint.json"));
    checkpoint.create_new(&config).unwrap();
    checkpoint.update_repos(&[REPO.to_string()]).unwrap();
    (dir, checkpoint)
}

fn unique_ids(dir: &TempDir, endpoint: &str) -> HashSet<u64> {
    let path = unit_path(&dir.path().join("out"), REPO, endpoint);
    JsonlSink::replay(&path)
        .unwrap()
        .iter()
        .flat_map(|page| page.items.iter())
        .map(|item| item["id"].as_u64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_unit_collects_every_page() {
    let (dir, checkpoint) = setup();
    let limiter = quiet_limiter();
    let fetcher = ScriptedFetcher::numbered(pages(&[3, 3, 1]));
    let mut sink = JsonlSink::for_unit(&dir.path().join("out"), REPO, "pulls").unwrap();

    let outcome = Paginator::new(&limiter, &checkpoint)
        .run(REPO, "pulls", &fetcher, &mut sink)
        .await
        .unwrap();

    assert_eq!(outcome, UnitOutcome::Complete { pages: 3, records: 7 });
    assert!(checkpoint.is_repo_endpoint_complete(REPO, "pulls"));
    assert_eq!(unique_ids(&dir, "pulls").len(), 7);

    // Completion is persisted immediately
    let reloaded = CheckpointManager::new(checkpoint.path());
    reloaded.load().unwrap();
    assert!(reloaded.is_repo_endpoint_complete(REPO, "pulls"));
}

#[tokio::test]
async fn test_completed_unit_is_not_fetched_again() {
    let (dir, checkpoint) = setup();
    let limiter = quiet_limiter();
    let mut sink = JsonlSink::for_unit(&dir.path().join("out"), REPO, "pulls").unwrap();

    let first = ScriptedFetcher::numbered(pages(&[2]));
    Paginator::new(&limiter, &checkpoint)
        .run(REPO, "pulls", &first, &mut sink)
        .await
        .unwrap();

    let second = ScriptedFetcher::numbered(pages(&[2]));
    let outcome = Paginator::new(&limiter, &checkpoint)
        .run(REPO, "pulls", &second, &mut sink)
        .await
        .unwrap();

    assert_eq!(outcome, UnitOutcome::AlreadyComplete);
    assert!(second.log().lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_crash_after_unsaved_page_refetches_it_once() {
    let (dir, checkpoint) = setup();
    let limiter = quiet_limiter();
    let out = dir.path().join("out");
    let data = pages(&[50, 50, 50, 50, 50]);

    {
        // Pages 1-2 reach 100 records and force a save; page 3 stays in memory
        let fetcher = ScriptedFetcher::numbered(data.clone())
            .fail_at(4, FetchError::Client("HTTP 403".to_string()));
        let mut sink = JsonlSink::for_unit(&out, REPO, "pulls").unwrap();
        let err = Paginator::new(&limiter, &checkpoint)
            .with_max_retries(0)
            .run(REPO, "pulls", &fetcher, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, PaginationError::Fetch { page: 4, .. }));
        assert!(!err.is_retryable());
        assert_eq!(checkpoint.get_resume_page(REPO, "pulls"), 4);
    }

    // Simulated crash: the in-memory state is lost
    let resumed = CheckpointManager::new(checkpoint.path());
    resumed.load().unwrap();
    assert_eq!(resumed.get_resume_page(REPO, "pulls"), 3);

    let fetcher = ScriptedFetcher::numbered(data);
    let mut sink = JsonlSink::for_unit(&out, REPO, "pulls").unwrap();
    let outcome = Paginator::new(&limiter, &resumed)
        .run(REPO, "pulls", &fetcher, &mut sink)
        .await
        .unwrap();

    assert_eq!(outcome, UnitOutcome::Complete { pages: 3, records: 150 });
    assert_eq!(
        fetcher.log().lock().unwrap().first(),
        Some(&PageRequest::Number(3))
    );
    assert_eq!(unique_ids(&dir, "pulls").len(), 250);
    assert_eq!(
        JsonlSink::replay(&unit_path(&out, REPO, "pulls")).unwrap().len(),
        5
    );
}

#[tokio::test]
async fn test_cursor_unit_resumes_from_saved_cursor() {
    let (dir, checkpoint) = setup();
    let limiter = quiet_limiter();
    let out = dir.path().join("out");
    let data = pages(&[4, 4, 4, 4]);

    let fetcher = ScriptedFetcher::cursor(data.clone())
        .fail_at(3, FetchError::Malformed("missing pageInfo".to_string()));
    let mut sink = JsonlSink::for_unit(&out, REPO, "discussions").unwrap();
    Paginator::new(&limiter, &checkpoint)
        .with_max_retries(0)
        .run(REPO, "discussions", &fetcher, &mut sink)
        .await
        .unwrap_err();
    checkpoint.save().unwrap();

    let resumed = CheckpointManager::new(checkpoint.path());
    resumed.load().unwrap();
    assert_eq!(
        resumed.get_resume_cursor(REPO, "discussions").as_deref(),
        Some("c2")
    );

    let fetcher = ScriptedFetcher::cursor(data);
    let mut sink = JsonlSink::for_unit(&out, REPO, "discussions").unwrap();
    let outcome = Paginator::new(&limiter, &resumed)
        .run(REPO, "discussions", &fetcher, &mut sink)
        .await
        .unwrap();

    assert_eq!(outcome, UnitOutcome::Complete { pages: 2, records: 8 });
    assert_eq!(
        fetcher.log().lock().unwrap().first(),
        Some(&PageRequest::Cursor(Some("c2".to_string())))
    );
    assert_eq!(unique_ids(&dir, "discussions").len(), 16);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried_in_place() {
    let (dir, checkpoint) = setup();
    let limiter = quiet_limiter();
    let fetcher = ScriptedFetcher::numbered(pages(&[1, 1, 1]))
        .fail_at(2, FetchError::Server("HTTP 502".to_string()))
        .fail_at(2, FetchError::Network("connection reset".to_string()));
    let mut sink = JsonlSink::for_unit(&dir.path().join("out"), REPO, "issues").unwrap();

    let outcome = Paginator::new(&limiter, &checkpoint)
        .with_max_retries(3)
        .run(REPO, "issues", &fetcher, &mut sink)
        .await
        .unwrap();

    assert_eq!(outcome, UnitOutcome::Complete { pages: 3, records: 3 });
    let log = fetcher.log();
    let log = log.lock().unwrap();
    assert_eq!(
        log.iter()
            .filter(|r| **r == PageRequest::Number(2))
            .count(),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_bounded() {
    let (dir, checkpoint) = setup();
    let limiter = quiet_limiter();
    let mut fetcher = ScriptedFetcher::numbered(pages(&[1, 1]));
    for _ in 0..3 {
        fetcher = fetcher.fail_at(1, FetchError::Server("HTTP 503".to_string()));
    }
    let mut sink = JsonlSink::for_unit(&dir.path().join("out"), REPO, "issues").unwrap();

    let err = Paginator::new(&limiter, &checkpoint)
        .with_max_retries(2)
        .run(REPO, "issues", &fetcher, &mut sink)
        .await
        .unwrap_err();

    assert!(matches!(err, PaginationError::Fetch { page: 1, .. }));
    assert!(err.is_retryable());
    assert_eq!(fetcher.log().lock().unwrap().len(), 3);
    let doc = checkpoint.document().unwrap();
    assert_eq!(
        doc.endpoint(REPO, "issues").unwrap().status,
        UnitStatus::InProgress
    );
}

#[tokio::test]
async fn test_empty_listing_completes_with_no_records() {
    let (dir, checkpoint) = setup();
    let limiter = quiet_limiter();
    let fetcher = ScriptedFetcher::numbered(Vec::new());
    let mut sink = JsonlSink::for_unit(&dir.path().join("out"), REPO, "releases").unwrap();

    let outcome = Paginator::new(&limiter, &checkpoint)
        .run(REPO, "releases", &fetcher, &mut sink)
        .await
        .unwrap();

    assert_eq!(outcome, UnitOutcome::Complete { pages: 1, records: 0 });
    assert!(checkpoint.is_repo_endpoint_complete(REPO, "releases"));
}
