//! Dispatch queue on the durable store.
//!
//! Provides at-least-once delivery of document-analysis dispatches without
//! an in-memory broker: a dispatch row becomes claimable once its
//! `available_at` passes, a claim takes a bounded lease, and a reaper
//! releases expired leases so a crashed worker's dispatch is redelivered.
//! Retry backoff is nothing more than a future `available_at` — the error
//! handler persists intent and the claim query does the scheduling.
//!
//! Claims use an optimistic conditional update rather than a lock, so any
//! number of worker processes can pull from the same queue; losing the race
//! just means claiming the next row.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

/// A claimed dispatch: one attempt of one document task.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub task_id: String,
    pub attempt: i64,
    pub batch_id: String,
}

/// Enqueue a dispatch, visible after `delay_ms`. Re-enqueueing the same
/// `(task_id, attempt)` is a no-op — duplicate delivery is tolerated.
pub async fn enqueue(
    pool: &SqlitePool,
    task_id: &str,
    attempt: i64,
    batch_id: &str,
    delay_ms: i64,
) -> Result<()> {
    let now_ms = chrono::Utc::now().timestamp_millis();

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO dispatches
            (task_id, attempt, batch_id, state, available_at, lease_expires_at, created_at)
        VALUES (?, ?, ?, 'ready', ?, NULL, ?)
        "#,
    )
    .bind(task_id)
    .bind(attempt)
    .bind(batch_id)
    .bind(now_ms + delay_ms)
    .bind(now_ms)
    .execute(pool)
    .await?;

    Ok(())
}

/// Claim the next due dispatch, taking a lease of `lease_secs`. Returns
/// `None` when nothing is claimable right now.
pub async fn claim(pool: &SqlitePool, lease_secs: i64) -> Result<Option<Dispatch>> {
    let now_ms = chrono::Utc::now().timestamp_millis();

    // Optimistic claim: select a candidate, then conditionally flip it to
    // leased. Another worker may win the race; try a few candidates.
    for _ in 0..4 {
        let row = sqlx::query(
            r#"
            SELECT task_id, attempt, batch_id FROM dispatches
            WHERE state = 'ready' AND available_at <= ?
            ORDER BY available_at
            LIMIT 1
            "#,
        )
        .bind(now_ms)
        .fetch_optional(pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let dispatch = Dispatch {
            task_id: row.get("task_id"),
            attempt: row.get("attempt"),
            batch_id: row.get("batch_id"),
        };

        let claimed = sqlx::query(
            r#"
            UPDATE dispatches SET state = 'leased', lease_expires_at = ?
            WHERE task_id = ? AND attempt = ? AND state = 'ready'
            "#,
        )
        .bind(now_ms + lease_secs * 1000)
        .bind(&dispatch.task_id)
        .bind(dispatch.attempt)
        .execute(pool)
        .await?;

        if claimed.rows_affected() == 1 {
            return Ok(Some(dispatch));
        }
    }

    Ok(None)
}

/// Acknowledge a dispatch as fully handled. The row is kept (state `done`)
/// for audit; re-acking is harmless.
pub async fn ack(pool: &SqlitePool, task_id: &str, attempt: i64) -> Result<()> {
    sqlx::query(
        "UPDATE dispatches SET state = 'done', lease_expires_at = NULL WHERE task_id = ? AND attempt = ?",
    )
    .bind(task_id)
    .bind(attempt)
    .execute(pool)
    .await?;
    Ok(())
}

/// Release dispatches whose lease expired without an ack, making them
/// claimable again. Returns the number of rows released.
pub async fn release_expired(pool: &SqlitePool) -> Result<u64> {
    let now_ms = chrono::Utc::now().timestamp_millis();

    let released = sqlx::query(
        r#"
        UPDATE dispatches SET state = 'ready', lease_expires_at = NULL
        WHERE state = 'leased' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?
        "#,
    )
    .bind(now_ms)
    .execute(pool)
    .await?;

    let count = released.rows_affected();
    if count > 0 {
        tracing::warn!(count, "Released expired dispatch leases");
    }
    Ok(count)
}

/// Number of dispatches not yet acked (ready, scheduled, or leased).
pub async fn outstanding_count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM dispatches WHERE state != 'done'")
            .fetch_one(pool)
            .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("queue.sqlite");
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .unwrap()
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        (tmp, pool)
    }

    #[tokio::test]
    async fn claim_ack_cycle() {
        let (_tmp, pool) = test_pool().await;

        enqueue(&pool, "doc-1", 0, "batch-1", 0).await.unwrap();

        let dispatch = claim(&pool, 60).await.unwrap().unwrap();
        assert_eq!(dispatch.task_id, "doc-1");
        assert_eq!(dispatch.attempt, 0);

        // Leased rows are not claimable again
        assert!(claim(&pool, 60).await.unwrap().is_none());

        ack(&pool, "doc-1", 0).await.unwrap();
        assert!(claim(&pool, 60).await.unwrap().is_none());
        assert_eq!(outstanding_count(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_noop() {
        let (_tmp, pool) = test_pool().await;

        enqueue(&pool, "doc-1", 0, "batch-1", 0).await.unwrap();
        enqueue(&pool, "doc-1", 0, "batch-1", 0).await.unwrap();

        assert_eq!(outstanding_count(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delayed_dispatch_is_invisible_until_due() {
        let (_tmp, pool) = test_pool().await;

        enqueue(&pool, "doc-1", 1, "batch-1", 60_000).await.unwrap();
        assert!(claim(&pool, 60).await.unwrap().is_none());

        // A second attempt due now is claimable alongside the delayed one
        enqueue(&pool, "doc-2", 0, "batch-1", 0).await.unwrap();
        let dispatch = claim(&pool, 60).await.unwrap().unwrap();
        assert_eq!(dispatch.task_id, "doc-2");
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let (_tmp, pool) = test_pool().await;

        enqueue(&pool, "doc-1", 0, "batch-1", 0).await.unwrap();

        // Lease of 0 seconds expires immediately
        let first = claim(&pool, 0).await.unwrap().unwrap();
        assert_eq!(first.task_id, "doc-1");

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let released = release_expired(&pool).await.unwrap();
        assert_eq!(released, 1);

        let second = claim(&pool, 60).await.unwrap().unwrap();
        assert_eq!(second.task_id, "doc-1");
        assert_eq!(second.attempt, 0);
    }
}
