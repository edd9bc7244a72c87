//! Unit tests for pagination error handling

use async_trait::async_trait;
use repo_crawler::checkpoint::CheckpointManager;
use repo_crawler::client::FetchError;
use repo_crawler::config::CrawlConfig;
use repo_crawler::pagination::{
    FetchedPage, PageFetcher, PageRequest, PaginationError, Paginator,
};
use repo_crawler::ratelimit::{ApiType, RateLimitError, RateLimitHeaders};
use repo_crawler::sink::JsonlSink;
use serde_json::json;
use tempfile::TempDir;

/// Claims more pages but never says where they start
struct DeadEndFetcher;

#[async_trait]
impl PageFetcher for DeadEndFetcher {
    fn api_type(&self) -> ApiType {
        ApiType::Rest
    }

    fn resume_request(&self, last_page_written: u32, _cursor: Option<String>) -> PageRequest {
        PageRequest::Number(last_page_written + 1)
    }

    async fn fetch(&self, _request: &PageRequest) -> Result<FetchedPage, FetchError> {
        Ok(FetchedPage {
            items: vec![json!({"id": 1})],
            next: None,
            has_more: true,
            headers: RateLimitHeaders::new(),
        })
    }
}

#[test]
fn test_error_retryability() {
    let fetch = |source| PaginationError::Fetch { page: 1, source };
    assert!(fetch(FetchError::Server("502".into())).is_retryable());
    assert!(fetch(FetchError::Network("reset".into())).is_retryable());
    assert!(fetch(FetchError::RateLimited {
        status: 429,
        headers: RateLimitHeaders::new()
    })
    .is_retryable());
    assert!(!fetch(FetchError::NotFound("gone".into())).is_retryable());
    assert!(!fetch(FetchError::Client("403".into())).is_retryable());
    assert!(!fetch(FetchError::Malformed("no items".into())).is_retryable());

    assert!(PaginationError::RateLimit(RateLimitError::BreakerOpen).is_retryable());
    assert!(!PaginationError::MaxIterations(10).is_retryable());
}

#[test]
fn test_request_cursor_accessor() {
    assert_eq!(PageRequest::Number(3).cursor(), None);
    assert_eq!(PageRequest::Cursor(None).cursor(), None);
    assert_eq!(
        PageRequest::Cursor(Some("abc".to_string())).cursor(),
        Some("abc")
    );
}

#[tokio::test]
async fn test_missing_next_request_is_a_protocol_error() {
    let dir = TempDir::new().unwrap();
    let checkpoint = CheckpointManager::new(dir.path().join("cp.json"));
    checkpoint.create_new(&CrawlConfig::new("acme", 2024)).unwrap();
    let limiter = crate::support::quiet_limiter();
    let mut sink = JsonlSink::open(dir.path().join("pulls.jsonl")).unwrap();

    let err = Paginator::new(&limiter, &checkpoint)
        .run("acme/widgets", "pulls", &DeadEndFetcher, &mut sink)
        .await
        .unwrap_err();

    assert!(matches!(err, PaginationError::Protocol(_)));
    assert!(!err.is_retryable());
    // The page itself was stored before the error
    assert_eq!(sink.pages_written(), 1);
    assert_eq!(checkpoint.get_resume_page("acme/widgets", "pulls"), 2);
}
