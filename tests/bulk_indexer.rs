//! Bulk indexer wire contract and accounting against a stub search store.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use edr_core::config::BulkIndexerConfig;
use edr_core::pipeline::sink::bulk::{BulkAction, BulkIndexer, BulkItem};

fn config(server: &MockServer, batch_size: usize) -> BulkIndexerConfig {
    BulkIndexerConfig {
        search_url: server.uri(),
        index_prefix: "edr-events".into(),
        batch_size,
        flush_bytes: 5 * 1024 * 1024,
        flush_interval_ms: 60_000,
        max_retries: 1,
    }
}

fn item(id: &str) -> BulkItem {
    BulkItem {
        action: BulkAction::Index,
        index: "edr-events-2026.08.01".into(),
        id: Some(id.into()),
        routing: Some("agent-1".into()),
        pipeline: None,
        document: Some(serde_json::json!({"event": {"id": id}})),
    }
}

#[tokio::test]
async fn count_trigger_flushes_and_accounts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errors": false,
            "items": [
                {"index": {"status": 201}},
                {"index": {"status": 201}},
                {"index": {"status": 201}}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let indexer = BulkIndexer::new(&config(&server, 3), None).unwrap();
    for i in 0..3 {
        indexer.add(item(&format!("evt-{i}"))).await.unwrap();
    }

    let stats = indexer.stats();
    assert_eq!(stats.num_added, 3);
    assert_eq!(stats.num_flushed, 3);
    assert_eq!(stats.num_failed, 0);
    assert_eq!(stats.in_buffer, 0);
}

#[tokio::test]
async fn partial_failures_hit_the_callback_not_the_flush() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errors": true,
            "items": [
                {"index": {"status": 201}},
                {"index": {"status": 429, "error": {"reason": "queue full"}}}
            ]
        })))
        .mount(&server)
        .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let indexer = BulkIndexer::new(
        &config(&server, 100),
        Some(Box::new(move |e| seen_clone.lock().push(e.to_string()))),
    )
    .unwrap();

    indexer.add(item("evt-0")).await.unwrap();
    indexer.add(item("evt-1")).await.unwrap();
    indexer.flush().await.unwrap();

    let stats = indexer.stats();
    assert_eq!(stats.num_added, 2);
    assert_eq!(stats.num_flushed, 1);
    assert_eq!(stats.num_failed, 1);
    assert_eq!(stats.in_buffer, 0);
    assert_eq!(stats.num_added, stats.num_flushed + stats.num_failed + stats.in_buffer as u64);

    let errors = seen.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("queue full"));
}

#[tokio::test]
async fn request_failure_after_retries_counts_everything_failed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let indexer = BulkIndexer::new(&config(&server, 100), None).unwrap();
    indexer.add(item("evt-0")).await.unwrap();
    assert!(indexer.flush().await.is_err());

    let stats = indexer.stats();
    assert_eq!(stats.num_failed, 1);
    assert_eq!(stats.in_buffer, 0);
    assert_eq!(stats.num_added, stats.num_flushed + stats.num_failed + stats.in_buffer as u64);
}

#[tokio::test]
async fn close_drains_residual_items() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errors": false,
            "items": [{"index": {"status": 201}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let indexer = BulkIndexer::new(&config(&server, 100), None).unwrap();
    indexer.add(item("evt-0")).await.unwrap();
    assert_eq!(indexer.stats().in_buffer, 1);

    indexer.close(Duration::from_secs(2)).await.unwrap();
    let stats = indexer.stats();
    assert_eq!(stats.num_flushed, 1);
    assert_eq!(stats.in_buffer, 0);
}

#[tokio::test]
async fn index_creation_is_idempotent() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/edr-events-2026.08.01"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": {"type": "resource_already_exists_exception"}
        })))
        .mount(&server)
        .await;

    let indexer = BulkIndexer::new(&config(&server, 100), None).unwrap();
    let t = chrono::DateTime::parse_from_rfc3339("2026-08-01T00:00:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    // Conflict from a previous creation is success.
    assert_eq!(indexer.create_time_based_index(t).await.unwrap(), "edr-events-2026.08.01");
    assert_eq!(indexer.create_time_based_index(t).await.unwrap(), "edr-events-2026.08.01");
}
