use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent — safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Batches: one row per client submission
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batches (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            total_documents INTEGER NOT NULL,
            processed_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            summary_json TEXT,
            report_ref TEXT,
            created_at INTEGER NOT NULL,
            completed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Document tasks: one row per logical document; attempt is the latest
    // dispatched attempt for the document
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            content_ref TEXT NOT NULL,
            filename TEXT,
            attempt INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL DEFAULT 'queued',
            created_at INTEGER NOT NULL,
            FOREIGN KEY (batch_id) REFERENCES batches(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Dispatch queue: at-least-once delivery with leases and delayed
    // visibility (retry backoff is a future available_at)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dispatches (
            task_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            batch_id TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'ready',
            available_at INTEGER NOT NULL,
            lease_expires_at INTEGER,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (task_id, attempt)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Analysis results: immutable, one per successful attempt
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS results (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            accuracy REAL NOT NULL,
            risk_level TEXT NOT NULL,
            flags_json TEXT NOT NULL DEFAULT '[]',
            verification_sources INTEGER NOT NULL DEFAULT 0,
            processing_time_ms INTEGER NOT NULL DEFAULT 0,
            fallback INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE(document_id, attempt)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Completion records: the durable events the aggregator recounts.
    // Keyed by (document_id, attempt) so duplicate delivery is a no-op.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS completions (
            document_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            batch_id TEXT NOT NULL,
            outcome TEXT NOT NULL,
            result_id TEXT,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (document_id, attempt)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Error records: one per failed attempt
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS error_records (
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            category TEXT NOT NULL,
            severity TEXT NOT NULL,
            message TEXT NOT NULL,
            recoverable INTEGER NOT NULL,
            retryable INTEGER NOT NULL,
            retry_delay_ms INTEGER,
            max_retries INTEGER,
            resolved INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Health metrics: append-only time series
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metrics (
            metric TEXT NOT NULL,
            value REAL NOT NULL,
            unit TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            recorded_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_batch_id ON tasks(batch_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dispatches_claim ON dispatches(state, available_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_results_batch_id ON results(batch_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_completions_batch_id ON completions(batch_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_error_records_document ON error_records(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_metrics_series ON metrics(metric, resource_id, recorded_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
