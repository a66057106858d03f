//! PostgreSQL queue integration tests.
//!
//! These exercise the real skip-locked dequeue path and therefore need a
//! database. They are ignored by default; run them with
//!
//! ```text
//! DATABASE_URL=postgresql://localhost/backhaul_test cargo test -p backhaul-delivery -- --ignored
//! ```

use std::{collections::HashSet, sync::Arc};

use backhaul_core::{CapturedRequest, Headers};
use backhaul_delivery::{DeliveryError, PgQueue, Queue};
use bytes::Bytes;
use sqlx::postgres::PgPoolOptions;

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS proxy_requests (
        id uuid PRIMARY KEY,
        timestamp timestamptz NOT NULL,
        method text NOT NULL,
        header jsonb NOT NULL,
        body bytea NOT NULL,
        origin_url text NOT NULL,
        attempt int NOT NULL
    )
";

async fn test_queue() -> PgQueue {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for ignored tests");
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .expect("database should be reachable");

    sqlx::query(SCHEMA_SQL).execute(&pool).await.expect("schema should apply");
    sqlx::query("TRUNCATE proxy_requests").execute(&pool).await.expect("truncate should work");

    PgQueue::from_pool(pool, true)
}

fn request(path: &str, body: &str) -> CapturedRequest {
    let mut headers = Headers::new();
    headers.insert("content-type".into(), vec!["application/json".into()]);
    headers.insert("x-trace".into(), vec!["a".into(), "b".into()]);
    CapturedRequest::from_parts(
        "POST".into(),
        path.into(),
        headers,
        Bytes::copy_from_slice(body.as_bytes()),
    )
}

#[tokio::test]
#[ignore = "needs PostgreSQL (set DATABASE_URL)"]
async fn enqueued_records_round_trip() {
    let queue = test_queue().await;
    let original = request("/hooks/ci?ref=main", "payload");

    queue.enqueue(&original, 3).await.expect("enqueue should succeed");
    assert_eq!(queue.total().await, 1);

    let (dequeued, attempt) = queue.dequeue().await.expect("dequeue should return the record");
    assert_eq!(dequeued, original);
    assert_eq!(attempt, 3);
    assert_eq!(queue.total().await, 0);
}

#[tokio::test]
#[ignore = "needs PostgreSQL (set DATABASE_URL)"]
async fn empty_queue_is_a_sentinel_not_a_failure() {
    let queue = test_queue().await;

    let error = queue.dequeue().await.expect_err("empty queue should not yield a record");
    assert!(matches!(error, DeliveryError::Empty));
}

#[tokio::test]
#[ignore = "needs PostgreSQL (set DATABASE_URL)"]
async fn every_record_is_dequeued_exactly_once() {
    let queue = test_queue().await;
    for i in 0..5 {
        queue.enqueue(&request(&format!("/r/{i}"), "x"), 1).await.expect("enqueue");
    }

    let mut seen = HashSet::new();
    for _ in 0..5 {
        let (record, _) = queue.dequeue().await.expect("dequeue");
        assert!(seen.insert(record.origin_url().to_owned()), "record dequeued twice");
    }

    assert!(matches!(queue.dequeue().await, Err(DeliveryError::Empty)));
}

#[tokio::test]
#[ignore = "needs PostgreSQL (set DATABASE_URL)"]
async fn concurrent_dequeues_never_share_a_record() {
    let queue = Arc::new(test_queue().await);
    for i in 0..8 {
        queue.enqueue(&request(&format!("/c/{i}"), "x"), 1).await.expect("enqueue");
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move { queue.dequeue().await }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let (record, _) = handle.await.unwrap().expect("each task should claim one record");
        assert!(
            seen.insert(record.origin_url().to_owned()),
            "two workers claimed the same record"
        );
    }
    assert_eq!(seen.len(), 8);
    assert_eq!(queue.total().await, 0);
}

#[tokio::test]
#[ignore = "needs PostgreSQL (set DATABASE_URL)"]
async fn shutdown_is_idempotent() {
    let queue = test_queue().await;
    queue.shutdown().await;
    queue.shutdown().await;
}
