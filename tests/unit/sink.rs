//! Unit tests for JSONL sink replay

use repo_crawler::sink::{JsonlSink, RecordSink};
use serde_json::json;
use std::io::Write;
use tempfile::TempDir;

#[test]
fn test_replay_keeps_last_copy_of_rewritten_page() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pulls.jsonl");
    let mut sink = JsonlSink::open(&path).unwrap();
    sink.append_page(1, None, &[json!({"id": 1})]).unwrap();
    sink.append_page(2, None, &[json!({"id": 2, "title": "old"})]).unwrap();
    // Re-fetched after a crash
    sink.append_page(2, None, &[json!({"id": 2, "title": "new"})]).unwrap();
    sink.append_page(3, None, &[json!({"id": 3})]).unwrap();

    let pages = JsonlSink::replay(&path).unwrap();
    assert_eq!(pages.len(), 3);
    assert_eq!(pages[1].page, 2);
    assert_eq!(pages[1].items[0]["title"], "new");
}

#[test]
fn test_replay_skips_torn_trailing_line() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("issues.jsonl");
    {
        let mut sink = JsonlSink::open(&path).unwrap();
        sink.append_page(1, None, &[json!({"id": 1})]).unwrap();
        sink.append_page(2, None, &[json!({"id": 2})]).unwrap();
    }
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(br#"{"page":3,"items":[{"id""#).unwrap();
    drop(file);

    let pages = JsonlSink::replay(&path).unwrap();
    assert_eq!(pages.iter().map(|p| p.page).collect::<Vec<_>>(), vec![1, 2]);
}

#[test]
fn test_cursor_is_stored_with_page() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("discussions.jsonl");
    let mut sink = JsonlSink::open(&path).unwrap();
    sink.append_page(1, None, &[json!({"id": "D_1"})]).unwrap();
    sink.append_page(2, Some("Y3Vyc29yOjE="), &[json!({"id": "D_2"})])
        .unwrap();
    assert_eq!(sink.pages_written(), 2);

    let pages = JsonlSink::replay(&path).unwrap();
    assert_eq!(pages[0].cursor, None);
    assert_eq!(pages[1].cursor.as_deref(), Some("Y3Vyc29yOjE="));
}
