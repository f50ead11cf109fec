//! Document worker: claims dispatches and runs the per-attempt pipeline.
//!
//! Each attempt moves through Fetching → Analyzing → Persisting. Exactly one
//! of two things happens per attempt: an analysis result is persisted (with
//! its completion record), or a classified failure is forwarded to the
//! error handler — never both, and never a silent local retry. Idempotency
//! is carried by the store: results and completions are keyed by
//! `(document_id, attempt)`, so a redelivered dispatch re-runs harmlessly.
//!
//! Workers share nothing in process. Any number of `veritor work` processes
//! can point at the same database; coordination is entirely the queue's
//! leases and the aggregator's conditional updates.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::aggregator;
use crate::analyzer::{self, AnalysisOptions};
use crate::config::Config;
use crate::failure::{self, FailureInfo, WorkerError, WorkerStage};
use crate::metrics;
use crate::models::{DocumentTask, TaskState};
use crate::queue::{self, Dispatch};
use crate::store::ContentStore;

/// Set on the first claim of this process; the monitor derives the
/// cold-start rate from it.
static WARMED_UP: AtomicBool = AtomicBool::new(false);

/// Run the worker pool until Ctrl-C: `concurrency` claim loops plus a lease
/// reaper that makes crashed workers' dispatches claimable again.
pub async fn run_worker_pool(
    config: &Config,
    pool: &SqlitePool,
    store: Arc<dyn ContentStore>,
) -> Result<()> {
    let mut handles = Vec::new();

    for worker_id in 0..config.worker.concurrency {
        let config = config.clone();
        let pool = pool.clone();
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(worker_id, &config, &pool, store.as_ref()).await;
        }));
    }

    {
        let pool = pool.clone();
        let lease_secs = config.worker.lease_secs;
        handles.push(tokio::spawn(async move {
            reaper_loop(&pool, lease_secs).await;
        }));
    }

    tracing::info!(
        concurrency = config.worker.concurrency,
        "Worker pool started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down worker pool");
    for handle in &handles {
        handle.abort();
    }
    Ok(())
}

/// Process dispatches until the queue has nothing claimable, then return
/// the number handled. Used by `veritor work --drain` and tests.
pub async fn drain(config: &Config, pool: &SqlitePool, store: &dyn ContentStore) -> Result<u64> {
    let mut handled = 0u64;
    loop {
        queue::release_expired(pool).await?;
        let Some(dispatch) = queue::claim(pool, config.worker.lease_secs).await? else {
            return Ok(handled);
        };
        process_dispatch(config, pool, store, &dispatch).await?;
        handled += 1;
    }
}

async fn worker_loop(worker_id: usize, config: &Config, pool: &SqlitePool, store: &dyn ContentStore) {
    let poll = Duration::from_millis(config.worker.poll_interval_ms);
    loop {
        match queue::claim(pool, config.worker.lease_secs).await {
            Ok(Some(dispatch)) => {
                if let Err(e) = process_dispatch(config, pool, store, &dispatch).await {
                    tracing::error!(
                        worker_id,
                        task_id = %dispatch.task_id,
                        error = %e,
                        "Dispatch processing error"
                    );
                }
            }
            Ok(None) => tokio::time::sleep(poll).await,
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Queue claim failed");
                tokio::time::sleep(poll).await;
            }
        }
    }
}

async fn reaper_loop(pool: &SqlitePool, lease_secs: i64) {
    let period = Duration::from_secs((lease_secs as u64 / 2).max(1));
    loop {
        tokio::time::sleep(period).await;
        if let Err(e) = queue::release_expired(pool).await {
            tracing::error!(error = %e, "Lease reaper failed");
        }
    }
}

/// Handle one claimed dispatch end to end. Always acks the dispatch: a
/// failed attempt is consumed here and any retry is a brand-new dispatch
/// scheduled by the error handler.
pub async fn process_dispatch(
    config: &Config,
    pool: &SqlitePool,
    store: &dyn ContentStore,
    dispatch: &Dispatch,
) -> Result<()> {
    let cold_start = !WARMED_UP.swap(true, Ordering::Relaxed);
    let started = Instant::now();

    let skip = preflight(pool, dispatch).await?;
    let Some(task) = skip else {
        queue::ack(pool, &dispatch.task_id, dispatch.attempt).await?;
        return Ok(());
    };

    tracing::info!(
        batch_id = %dispatch.batch_id,
        document_id = %dispatch.task_id,
        attempt = dispatch.attempt,
        "Processing document"
    );

    let outcome = run_attempt(config, pool, store, dispatch, &task).await;
    let duration_ms = started.elapsed().as_millis() as f64;
    let failed = outcome.is_err();

    match outcome {
        Ok(()) => {
            aggregator::check_and_finalize(pool, store, &dispatch.batch_id).await?;
        }
        Err((stage, error)) => {
            let info = FailureInfo {
                batch_id: dispatch.batch_id.clone(),
                document_id: dispatch.task_id.clone(),
                attempt: dispatch.attempt,
                stage,
                error,
            };
            failure::handle_failure(pool, store, &info).await?;
        }
    }

    record_attempt_metrics(config, pool, duration_ms, failed, cold_start).await;

    queue::ack(pool, &dispatch.task_id, dispatch.attempt).await?;
    Ok(())
}

/// Load the task and decide whether this dispatch should run at all.
/// Stale dispatches (superseded attempt, already-terminal task or batch)
/// are dropped without output — late deliveries are tolerated, not errors.
async fn preflight(pool: &SqlitePool, dispatch: &Dispatch) -> Result<Option<DocumentTask>> {
    let row = sqlx::query(
        r#"
        SELECT id, batch_id, owner_id, content_ref, filename, attempt, state, created_at
        FROM tasks WHERE id = ?
        "#,
    )
    .bind(&dispatch.task_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        tracing::warn!(task_id = %dispatch.task_id, "Dispatch for unknown task dropped");
        return Ok(None);
    };

    let state_str: String = row.get("state");
    let task = DocumentTask {
        id: row.get("id"),
        batch_id: row.get("batch_id"),
        owner_id: row.get("owner_id"),
        content_ref: row.get("content_ref"),
        filename: row.get("filename"),
        attempt: row.get("attempt"),
        state: TaskState::parse(&state_str).unwrap_or(TaskState::Queued),
        created_at: row.get("created_at"),
    };

    if task.attempt > dispatch.attempt {
        tracing::debug!(
            task_id = %dispatch.task_id,
            dispatch_attempt = dispatch.attempt,
            current_attempt = task.attempt,
            "Superseded dispatch dropped"
        );
        return Ok(None);
    }

    if matches!(
        task.state,
        TaskState::Completed | TaskState::Failed | TaskState::Intervene
    ) {
        return Ok(None);
    }

    let batch_status: Option<String> =
        sqlx::query_scalar("SELECT status FROM batches WHERE id = ?")
            .bind(&dispatch.batch_id)
            .fetch_optional(pool)
            .await?;

    match batch_status.as_deref() {
        Some("pending") => {
            // First activity on the batch moves it forward.
            sqlx::query(
                "UPDATE batches SET status = 'processing' WHERE id = ? AND status = 'pending'",
            )
            .bind(&dispatch.batch_id)
            .execute(pool)
            .await?;
        }
        Some("processing") | Some("finalizing") => {}
        Some(_) | None => {
            // Terminal or missing batch: ignore this late dispatch.
            return Ok(None);
        }
    }

    sqlx::query("UPDATE tasks SET state = 'processing' WHERE id = ?")
        .bind(&dispatch.task_id)
        .execute(pool)
        .await?;

    Ok(Some(task))
}

/// The per-attempt pipeline. Returns the failing stage and typed error so
/// the caller can forward full context to the error handler.
async fn run_attempt(
    config: &Config,
    pool: &SqlitePool,
    store: &dyn ContentStore,
    dispatch: &Dispatch,
    task: &DocumentTask,
) -> Result<(), (WorkerStage, WorkerError)> {
    // Fetching
    let bytes = store
        .get(&task.content_ref)
        .await
        .map_err(|e| (WorkerStage::Fetching, WorkerError::Other(e.to_string())))?;
    let content = String::from_utf8_lossy(&bytes);
    if content.trim().is_empty() {
        return Err((
            WorkerStage::Fetching,
            WorkerError::Validation("document content is empty after fetch".to_string()),
        ));
    }

    // Analyzing, under the per-attempt budget
    let budget = Duration::from_secs(config.worker.task_timeout_secs);
    let verdict = match tokio::time::timeout(
        budget,
        analyzer::analyze(&config.analyzer, &content, &AnalysisOptions::default()),
    )
    .await
    {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(e)) => return Err((WorkerStage::Analyzing, e)),
        Err(_) => {
            return Err((
                WorkerStage::Analyzing,
                WorkerError::Timeout(format!(
                    "analysis exceeded the {}s attempt budget",
                    config.worker.task_timeout_secs
                )),
            ))
        }
    };

    // Persisting
    persist_success(pool, dispatch, task, &verdict)
        .await
        .map_err(|e| (WorkerStage::Persisting, WorkerError::Other(e.to_string())))?;

    Ok(())
}

/// Write the result and its completion record, keyed by
/// `(document_id, attempt)`. Redelivery hits the unique keys and becomes a
/// no-op.
async fn persist_success(
    pool: &SqlitePool,
    dispatch: &Dispatch,
    task: &DocumentTask,
    verdict: &crate::models::Verdict,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let result_id = Uuid::new_v4().to_string();
    let flags_json = serde_json::to_string(&verdict.flags)?;

    let inserted = sqlx::query(
        r#"
        INSERT OR IGNORE INTO results
            (id, document_id, batch_id, attempt, accuracy, risk_level, flags_json,
             verification_sources, processing_time_ms, fallback, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&result_id)
    .bind(&dispatch.task_id)
    .bind(&dispatch.batch_id)
    .bind(dispatch.attempt)
    .bind(verdict.accuracy)
    .bind(verdict.risk_level.as_str())
    .bind(&flags_json)
    .bind(verdict.verification_sources)
    .bind(verdict.processing_time_ms)
    .bind(verdict.source == crate::models::VerdictSource::Heuristic)
    .bind(now)
    .execute(pool)
    .await?;

    let result_id = if inserted.rows_affected() == 0 {
        // Duplicate delivery: reuse the result the first delivery wrote.
        sqlx::query_scalar("SELECT id FROM results WHERE document_id = ? AND attempt = ?")
            .bind(&dispatch.task_id)
            .bind(dispatch.attempt)
            .fetch_one(pool)
            .await?
    } else {
        result_id
    };

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO completions (document_id, attempt, batch_id, outcome, result_id, created_at)
        VALUES (?, ?, ?, 'success', ?, ?)
        "#,
    )
    .bind(&dispatch.task_id)
    .bind(dispatch.attempt)
    .bind(&dispatch.batch_id)
    .bind(&result_id)
    .bind(now)
    .execute(pool)
    .await?;

    sqlx::query("UPDATE tasks SET state = 'completed' WHERE id = ?")
        .bind(&dispatch.task_id)
        .execute(pool)
        .await?;

    // A success resolves any error records left by earlier attempts.
    failure::resolve_document_errors(pool, &dispatch.task_id).await?;

    tracing::info!(
        batch_id = %dispatch.batch_id,
        document_id = %dispatch.task_id,
        attempt = dispatch.attempt,
        accuracy = verdict.accuracy,
        risk = verdict.risk_level.as_str(),
        fallback = verdict.source == crate::models::VerdictSource::Heuristic,
        filename = task.filename.as_deref().unwrap_or(""),
        "Document analyzed"
    );

    Ok(())
}

/// Push per-attempt fleet metrics. Best-effort: metrics failures are logged
/// and never fail the attempt.
async fn record_attempt_metrics(
    config: &Config,
    pool: &SqlitePool,
    duration_ms: f64,
    failed: bool,
    cold_start: bool,
) {
    let resource = config
        .monitor
        .worker_resources
        .first()
        .map(String::as_str)
        .unwrap_or("worker-fleet");

    let samples = [
        ("worker.invocations", 1.0, "count"),
        ("worker.duration_ms", duration_ms, "ms"),
        ("worker.errors", if failed { 1.0 } else { 0.0 }, "count"),
        ("worker.cold_start", if cold_start { 1.0 } else { 0.0 }, "count"),
    ];

    for (metric, value, unit) in samples {
        if let Err(e) = metrics::record(pool, metric, value, unit, resource).await {
            tracing::warn!(metric, error = %e, "Failed to record worker metric");
        }
    }
}
