//! Unit tests for checkpoint bookkeeping

use repo_crawler::checkpoint::{CheckpointManager, UnitStatus};
use repo_crawler::config::CrawlConfig;
use tempfile::TempDir;

fn manager(dir: &TempDir, repos: &[&str]) -> CheckpointManager {
    let mut config = CrawlConfig::new("acme", 2024);
    config.endpoints = vec!["pulls".to_string(), "issues".to_string()];
    let m = CheckpointManager::new(dir.path().join("checkpoint.json"));
    m.create_new(&config).unwrap();
    let repos: Vec<String> = repos.iter().map(|r| r.to_string()).collect();
    m.update_repos(&repos).unwrap();
    m
}

#[test]
fn test_mark_complete_twice_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir, &["a/b"]);

    m.mark_repo_endpoint_complete("a/b", "pulls").unwrap();
    let once = m.document().unwrap();
    let on_disk = std::fs::read_to_string(m.path()).unwrap();

    m.mark_repo_endpoint_complete("a/b", "pulls").unwrap();
    assert_eq!(m.document().unwrap(), once);
    assert_eq!(std::fs::read_to_string(m.path()).unwrap(), on_disk);
}

#[test]
fn test_resume_page_follows_last_written_page() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir, &["a/b"]);
    for page in 1..=3 {
        m.update_progress("a/b", "pulls", page, 10).unwrap();
    }
    assert_eq!(m.get_resume_page("a/b", "pulls"), 4);
    assert_eq!(m.get_resume_page("a/b", "issues"), 1);
    assert_eq!(m.get_resume_page("x/y", "pulls"), 1);
}

#[test]
fn test_repo_not_complete_while_an_endpoint_is_running() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir, &["a/b"]);
    m.mark_repo_endpoint_complete("a/b", "pulls").unwrap();
    m.mark_repo_endpoint_in_progress("a/b", "issues").unwrap();

    let doc = m.document().unwrap();
    assert_eq!(doc.repos["a/b"].status, UnitStatus::InProgress);
    assert!(doc.repos["a/b"].completed_at.is_none());

    m.mark_repo_endpoint_complete("a/b", "issues").unwrap();
    let doc = m.document().unwrap();
    assert_eq!(doc.repos["a/b"].status, UnitStatus::Complete);
    assert!(doc.repos["a/b"].completed_at.is_some());
}

#[test]
fn test_repos_to_process_skip_complete_and_failed() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir, &["acme/d", "acme/a", "acme/c", "acme/b"]);
    m.mark_repo_endpoint_complete("acme/a", "pulls").unwrap();
    m.mark_repo_endpoint_complete("acme/a", "issues").unwrap();
    m.mark_repo_endpoint_failed("acme/b", "pulls", "HTTP 502", true)
        .unwrap();
    m.mark_repo_endpoint_in_progress("acme/c", "pulls").unwrap();

    assert_eq!(m.get_repos_to_process(false, None), vec!["acme/c", "acme/d"]);
    assert_eq!(
        m.get_repos_to_process(true, None),
        vec!["acme/b", "acme/c", "acme/d"]
    );
    assert_eq!(
        m.get_repos_to_process(true, Some("acme/c")),
        vec!["acme/c", "acme/d"]
    );
    // Unknown start repository is ignored
    assert_eq!(
        m.get_repos_to_process(false, Some("acme/zzz")),
        vec!["acme/c", "acme/d"]
    );
}

#[test]
fn test_update_repos_keeps_existing_progress() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir, &["acme/a"]);
    m.update_progress("acme/a", "pulls", 1, 30).unwrap();

    m.update_repos(&["acme/a".to_string(), "acme/b".to_string()])
        .unwrap();

    let summary = m.summary().unwrap();
    assert_eq!(summary.repos_total, 2);
    assert_eq!(summary.records_collected, 30);
    assert_eq!(m.get_resume_page("acme/a", "pulls"), 2);
}

#[test]
fn test_phases_are_tracked_by_name() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir, &[]);
    m.set_current_phase("discovery").unwrap();
    assert!(!m.is_phase_complete("discovery"));
    m.mark_phase_complete("discovery").unwrap();

    let reloaded = CheckpointManager::new(m.path());
    reloaded.load().unwrap();
    assert!(reloaded.is_phase_complete("discovery"));
    assert!(!reloaded.is_phase_complete("collection"));
    assert_eq!(
        reloaded.summary().unwrap().current_phase.as_deref(),
        Some("discovery")
    );
}

#[test]
fn test_first_page_moves_repo_out_of_pending() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir, &["acme/a", "acme/b"]);
    m.update_progress("acme/a", "pulls", 1, 25).unwrap();

    let doc = m.document().unwrap();
    assert_eq!(doc.repos["acme/a"].status, UnitStatus::InProgress);
    assert!(doc.repos["acme/a"].started_at.is_some());
    assert_eq!(doc.repos["acme/b"].status, UnitStatus::Pending);

    let summary = m.summary().unwrap();
    assert_eq!(summary.repos_in_progress, 1);
    assert_eq!(summary.repos_pending, 1);
}
