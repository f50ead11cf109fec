//! Append-only metrics store.
//!
//! Time-series samples pushed by workers (and by external collectors for
//! the cache layer) land here; the fleet monitor reads them back through
//! windowed aggregates. Samples are never updated or deleted by pipeline
//! logic.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::models::HealthMetric;

/// Push a sample into the store.
pub async fn push(pool: &SqlitePool, sample: &HealthMetric) -> Result<()> {
    sqlx::query(
        "INSERT INTO metrics (metric, value, unit, resource_id, recorded_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&sample.metric)
    .bind(sample.value)
    .bind(&sample.unit)
    .bind(&sample.resource_id)
    .bind(sample.recorded_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a sample at the current time.
pub async fn record(
    pool: &SqlitePool,
    metric: &str,
    value: f64,
    unit: &str,
    resource_id: &str,
) -> Result<()> {
    record_at(pool, metric, value, unit, resource_id, chrono::Utc::now().timestamp()).await
}

/// Record a sample with an explicit timestamp (unix seconds).
pub async fn record_at(
    pool: &SqlitePool,
    metric: &str,
    value: f64,
    unit: &str,
    resource_id: &str,
    recorded_at: i64,
) -> Result<()> {
    push(
        pool,
        &HealthMetric {
            metric: metric.to_string(),
            value,
            unit: unit.to_string(),
            resource_id: resource_id.to_string(),
            recorded_at,
        },
    )
    .await
}

/// Aggregates over one metric series within a time window.
#[derive(Debug, Clone, Copy)]
pub struct SeriesStats {
    pub count: i64,
    pub sum: f64,
    pub avg: f64,
}

/// Windowed aggregates for `(metric, resource_id)` since `since_ts`.
/// Returns `None` when the window holds no samples.
pub async fn window_stats(
    pool: &SqlitePool,
    metric: &str,
    resource_id: &str,
    since_ts: i64,
) -> Result<Option<SeriesStats>> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS count, COALESCE(SUM(value), 0.0) AS sum, COALESCE(AVG(value), 0.0) AS avg
        FROM metrics
        WHERE metric = ? AND resource_id = ? AND recorded_at >= ?
        "#,
    )
    .bind(metric)
    .bind(resource_id)
    .bind(since_ts)
    .fetch_one(pool)
    .await?;

    let count: i64 = row.get("count");
    if count == 0 {
        return Ok(None);
    }

    Ok(Some(SeriesStats {
        count,
        sum: row.get("sum"),
        avg: row.get("avg"),
    }))
}

/// Per-hour averages for a series, oldest first. Buckets are hour-aligned
/// unix timestamps; hours without samples are absent.
pub async fn hourly_averages(
    pool: &SqlitePool,
    metric: &str,
    resource_id: &str,
    since_ts: i64,
) -> Result<Vec<(i64, f64)>> {
    let rows = sqlx::query(
        r#"
        SELECT (recorded_at / 3600) * 3600 AS hour, AVG(value) AS avg
        FROM metrics
        WHERE metric = ? AND resource_id = ? AND recorded_at >= ?
        GROUP BY hour
        ORDER BY hour
        "#,
    )
    .bind(metric)
    .bind(resource_id)
    .bind(since_ts)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| (row.get::<i64, _>("hour"), row.get::<f64, _>("avg")))
        .collect())
}

/// Total number of stored samples (for `veritor stats`).
pub async fn sample_count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metrics")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
