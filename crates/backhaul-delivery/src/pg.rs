//! PostgreSQL queue backed by `FOR UPDATE SKIP LOCKED`.
//!
//! Rows are deleted inside the same transaction that claims them; the
//! delete-on-dequeue schema has no `processed` column and is the ground
//! truth of at-least-once delivery. A crash after commit but before the
//! upstream call completes loses that attempt.

// NOTE: every query runs with prepared-statement caching disabled. The
// service is deployed behind pgbouncer in transaction pooling mode, which
// does not support prepared statements persisting across calls.
// See: https://www.pgbouncer.org/features.html

use backhaul_core::{CapturedRequest, Headers};
use bytes::Bytes;
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{DeliveryError, Result},
    queue::Queue,
};

const INSERT_SQL: &str = "
    INSERT INTO proxy_requests (
      timestamp, id, method, header, body, origin_url, attempt
    ) VALUES (now(), $1, $2, $3, $4, $5, $6)
";

const SELECT_WITH_INDEX_SQL: &str = "
    SELECT id, method, header, body, origin_url, attempt
    FROM proxy_requests
    ORDER BY date_trunc('minute', timestamp) ASC
    LIMIT 1
    FOR UPDATE
    SKIP LOCKED
";

const SELECT_WITHOUT_INDEX_SQL: &str = "
    SELECT id, method, header, body, origin_url, attempt
    FROM proxy_requests
    LIMIT 1
    FOR UPDATE
    SKIP LOCKED
";

const DELETE_SQL: &str = "DELETE FROM proxy_requests WHERE id = $1";

const COUNT_TOTAL_SQL: &str = "SELECT COUNT(*) FROM proxy_requests";

/// Queue over the `proxy_requests` table.
///
/// The table is pre-created by an external migration tool. Ordering is
/// coarse: oldest minute-bucket first, any row within the bucket, which
/// trades strict FIFO for index locality. With `use_index` off the sort is
/// skipped entirely and any unlocked row is taken.
pub struct PgQueue {
    pool: PgPool,
    select_sql: &'static str,
}

impl PgQueue {
    /// Connects a pool of at most `max_connections` and verifies it with a
    /// ping.
    pub async fn connect(
        connection_string: &str,
        max_connections: u32,
        use_index: bool,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await
            .map_err(|e| DeliveryError::storage(format!("connecting: {e}")))?;

        info!(max_connections, use_index, "initializing postgresql queue");

        let queue = Self::from_pool(pool, use_index);
        sqlx::query("SELECT 1")
            .persistent(false)
            .execute(&queue.pool)
            .await
            .map_err(|e| DeliveryError::storage(format!("ping: {e}")))?;

        Ok(queue)
    }

    /// Wraps an existing pool. Used by tests that manage their own pool.
    pub fn from_pool(pool: PgPool, use_index: bool) -> Self {
        let select_sql = if use_index { SELECT_WITH_INDEX_SQL } else { SELECT_WITHOUT_INDEX_SQL };
        Self { pool, select_sql }
    }
}

#[async_trait::async_trait]
impl Queue for PgQueue {
    async fn total(&self) -> u64 {
        match sqlx::query_scalar::<_, i64>(COUNT_TOTAL_SQL)
            .persistent(false)
            .fetch_one(&self.pool)
            .await
        {
            Ok(count) => u64::try_from(count).unwrap_or(0),
            Err(error) => {
                debug!(%error, "queue size query failed");
                0
            },
        }
    }

    async fn enqueue(&self, request: &CapturedRequest, attempt: u32) -> Result<()> {
        let headers = serde_json::to_value(request.headers())
            .map_err(|e| DeliveryError::storage(format!("serializing headers: {e}")))?;

        sqlx::query(INSERT_SQL)
            .persistent(false)
            .bind(Uuid::new_v4())
            .bind(request.method())
            .bind(&headers)
            .bind(request.body().as_ref())
            .bind(request.origin_url())
            .bind(i32::try_from(attempt).unwrap_or(i32::MAX))
            .execute(&self.pool)
            .await
            .map_err(|e| DeliveryError::storage(format!("inserting request: {e}")))?;

        Ok(())
    }

    async fn dequeue(&self) -> Result<(CapturedRequest, u32)> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DeliveryError::storage(format!("beginning transaction: {e}")))?;

        let row = sqlx::query(self.select_sql)
            .persistent(false)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| DeliveryError::storage(format!("selecting request: {e}")))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| DeliveryError::storage(format!("rollback: {e}")))?;
            return Err(DeliveryError::Empty);
        };

        let id: Uuid = row
            .try_get("id")
            .map_err(|e| DeliveryError::storage(format!("decoding id: {e}")))?;
        let (request, attempt) = decode_row(&row)?;

        sqlx::query(DELETE_SQL)
            .persistent(false)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| DeliveryError::storage(format!("deleting request {id}: {e}")))?;

        tx.commit().await.map_err(|e| DeliveryError::storage(format!("commit: {e}")))?;

        Ok((request, attempt))
    }

    async fn shutdown(&self) {
        self.pool.close().await;
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<(CapturedRequest, u32)> {
    let method: String = row
        .try_get("method")
        .map_err(|e| DeliveryError::storage(format!("decoding method: {e}")))?;
    let Json(headers): Json<Headers> = row
        .try_get("header")
        .map_err(|e| DeliveryError::storage(format!("decoding headers: {e}")))?;
    let body: Vec<u8> = row
        .try_get("body")
        .map_err(|e| DeliveryError::storage(format!("decoding body: {e}")))?;
    let origin_url: String = row
        .try_get("origin_url")
        .map_err(|e| DeliveryError::storage(format!("decoding origin_url: {e}")))?;
    let attempt: i32 = row
        .try_get("attempt")
        .map_err(|e| DeliveryError::storage(format!("decoding attempt: {e}")))?;

    let request = CapturedRequest::from_parts(method, origin_url, headers, Bytes::from(body));
    Ok((request, u32::try_from(attempt).unwrap_or(0)))
}
