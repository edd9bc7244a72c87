//! End-to-end tests for the repo-crawler binary
//!
//! The API URL points at a closed local port so no test reaches the network.

use assert_cmd::Command;
use repo_crawler::checkpoint::{lock_path, CheckpointManager};
use repo_crawler::config::CrawlConfig;
use serde_json::Value;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const CLOSED_PORT_URL: &str = "http://127.0.0.1:1";

fn crawler() -> Command {
    let mut cmd = Command::cargo_bin("repo-crawler").unwrap();
    cmd.env_remove("GITHUB_TOKEN").env("RUST_LOG", "off");
    cmd
}

fn collect_offline(checkpoint: &Path, out: &Path, year: &str) -> Command {
    let mut cmd = crawler();
    cmd.args([
        "--checkpoint",
        checkpoint.to_str().unwrap(),
        "collect",
        "--target",
        "acme",
        "--year",
        year,
        "--repo",
        "acme/widgets",
        "--endpoints",
        "pulls,releases",
        "--max-retries",
        "0",
        "--api-url",
        CLOSED_PORT_URL,
        "--output-dir",
        out.to_str().unwrap(),
    ]);
    cmd
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_help_lists_commands() {
    let output = crawler().arg("--help").assert().success().get_output().clone();
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["collect", "status", "reset"] {
        assert!(stdout.contains(command), "missing {command} in help");
    }
}

#[test]
fn test_unknown_endpoint_is_rejected() {
    let dir = TempDir::new().unwrap();
    let output = crawler()
        .args([
            "--checkpoint",
            dir.path().join("cp.json").to_str().unwrap(),
            "collect",
            "--target",
            "acme",
            "--year",
            "2024",
            "--endpoints",
            "pulls,stargazers",
        ])
        .assert()
        .failure()
        .get_output()
        .clone();

    assert!(String::from_utf8_lossy(&output.stderr).contains("stargazers"));
    assert!(!dir.path().join("cp.json").exists());
}

#[test]
fn test_status_without_checkpoint_fails() {
    let dir = TempDir::new().unwrap();
    let output = crawler()
        .args([
            "--checkpoint",
            dir.path().join("missing.json").to_str().unwrap(),
            "status",
        ])
        .assert()
        .failure()
        .get_output()
        .clone();
    assert!(String::from_utf8_lossy(&output.stderr).contains("no checkpoint"));
}

#[test]
fn test_status_reports_checkpoint_summary() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cp.json");
    let checkpoint = CheckpointManager::new(&path);
    checkpoint.create_new(&CrawlConfig::new("acme", 2024)).unwrap();
    checkpoint
        .update_repos(&["acme/a".to_string(), "acme/b".to_string()])
        .unwrap();
    checkpoint.mark_repo_endpoint_complete("acme/a", "pulls").unwrap();

    let output = crawler()
        .args(["--checkpoint", path.to_str().unwrap(), "status"])
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Target: acme (2024)"));
    assert!(stdout.contains("2 total"));

    let output = crawler()
        .args([
            "--checkpoint",
            path.to_str().unwrap(),
            "--output-format",
            "json",
            "status",
        ])
        .assert()
        .success()
        .get_output()
        .clone();
    let json = stdout_json(&output);
    assert_eq!(json["summary"]["repos_total"], 2);
    assert_eq!(json["summary"]["repos_in_progress"], 1);
    assert_eq!(json["summary"]["repos_pending"], 1);
}

#[test]
fn test_offline_collect_records_retryable_failures() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cp.json");
    let out = dir.path().join("out");

    let output = collect_offline(&path, &out, "2024")
        .arg("--output-format")
        .arg("json")
        .assert()
        .success()
        .get_output()
        .clone();
    let report = stdout_json(&output);
    assert_eq!(report["repos_discovered"], 1);
    assert_eq!(report["units_failed"], 2);
    assert_eq!(report["interrupted"], false);

    let output = crawler()
        .args([
            "--checkpoint",
            path.to_str().unwrap(),
            "--output-format",
            "json",
            "status",
            "--failed",
        ])
        .assert()
        .success()
        .get_output()
        .clone();
    let status = stdout_json(&output);
    assert_eq!(status["summary"]["repos_failed"], 1);
    assert_eq!(status["failed"][0]["repo"], "acme/widgets");
    assert_eq!(status["failed"][0]["retryable"], true);

    // The checkpoint lock is released when the run ends
    assert!(CheckpointManager::new(&path).try_acquire_lock().is_ok());
}

#[test]
fn test_changed_config_refuses_to_resume() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cp.json");
    let out = dir.path().join("out");

    collect_offline(&path, &out, "2024").assert().success();

    let output = collect_offline(&path, &out, "2023")
        .assert()
        .failure()
        .get_output()
        .clone();
    assert!(String::from_utf8_lossy(&output.stderr).contains("--ignore-config-change"));

    collect_offline(&path, &out, "2023")
        .arg("--ignore-config-change")
        .assert()
        .success();
}

#[test]
fn test_collect_no_wait_refuses_locked_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cp.json");
    let holder = CheckpointManager::new(&path);
    holder.try_acquire_lock().unwrap();

    collect_offline(&path, &dir.path().join("out"), "2024")
        .arg("--no-wait")
        .assert()
        .failure();
    assert!(!path.exists());
}

#[test]
fn test_collect_waits_for_locked_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cp.json");
    let holder = CheckpointManager::new(&path);
    holder.try_acquire_lock().unwrap();

    let hold_for = Duration::from_millis(1_500);
    let releaser = std::thread::spawn(move || {
        std::thread::sleep(hold_for);
        holder.release_lock();
    });

    let start = Instant::now();
    collect_offline(&path, &dir.path().join("out"), "2024")
        .assert()
        .success();
    assert!(start.elapsed() >= hold_for);
    assert!(path.exists());
    releaser.join().unwrap();
}

#[test]
fn test_reset_removes_checkpoint_and_records() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cp.json");
    let out = dir.path().join("out");
    CheckpointManager::new(&path)
        .create_new(&CrawlConfig::new("acme", 2024))
        .unwrap();
    std::fs::create_dir_all(out.join("acme/widgets")).unwrap();
    std::fs::write(out.join("acme/widgets/pulls.jsonl"), "{}\n").unwrap();

    crawler()
        .args([
            "--checkpoint",
            path.to_str().unwrap(),
            "reset",
            "--output-dir",
            out.to_str().unwrap(),
        ])
        .assert()
        .success();

    assert!(!path.exists());
    assert!(!out.exists());
    // The lock file survives so later runs lock the same file
    assert!(lock_path(&path).exists());
}

#[test]
fn test_reset_refuses_while_locked() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cp.json");
    let holder = CheckpointManager::new(&path);
    holder.create_new(&CrawlConfig::new("acme", 2024)).unwrap();
    holder.try_acquire_lock().unwrap();

    crawler()
        .args(["--checkpoint", path.to_str().unwrap(), "reset"])
        .assert()
        .failure();
    assert!(path.exists());

    holder.release_lock();
    crawler()
        .args(["--checkpoint", path.to_str().unwrap(), "reset"])
        .assert()
        .success();
    assert!(!path.exists());
}
