//! Batch operations exposed to external callers.
//!
//! These are the three operations in the product surface — submit, status,
//! report — plus external cancellation. Both the CLI and the HTTP server
//! call through here. Callers are never blocked on analysis: submission
//! returns as soon as the batch and its dispatches are durable, and
//! progress is observed by polling status.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::models::{Batch, BatchStatus, BatchSummary};
use crate::queue;
use crate::store::{self, ContentStore};

/// One document in a submission.
#[derive(Debug, Clone)]
pub struct DocumentSubmission {
    pub filename: Option<String>,
    pub content: Vec<u8>,
}

/// Create a batch: persist the batch record, store every document's
/// content, create one task per document, and enqueue the initial
/// dispatches. Returns the batch id immediately — analysis happens in the
/// workers.
pub async fn submit_batch(
    pool: &SqlitePool,
    store: &dyn ContentStore,
    storage: &StorageConfig,
    owner_id: &str,
    documents: Vec<DocumentSubmission>,
) -> Result<String> {
    if documents.is_empty() {
        bail!("batch must contain at least one document");
    }

    let batch_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO batches (id, owner_id, total_documents, status, created_at)
        VALUES (?, ?, ?, 'pending', ?)
        "#,
    )
    .bind(&batch_id)
    .bind(owner_id)
    .bind(documents.len() as i64)
    .bind(now)
    .execute(pool)
    .await?;

    for doc in &documents {
        let task_id = Uuid::new_v4().to_string();
        let content_ref = store::store_document(store, storage, &doc.content).await?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, batch_id, owner_id, content_ref, filename, attempt, state, created_at)
            VALUES (?, ?, ?, ?, ?, 0, 'queued', ?)
            "#,
        )
        .bind(&task_id)
        .bind(&batch_id)
        .bind(owner_id)
        .bind(&content_ref)
        .bind(&doc.filename)
        .bind(now)
        .execute(pool)
        .await?;

        queue::enqueue(pool, &task_id, 0, &batch_id, 0).await?;
    }

    tracing::info!(
        batch_id = %batch_id,
        owner_id = %owner_id,
        documents = documents.len(),
        "Batch submitted"
    );

    Ok(batch_id)
}

/// Load a batch record by id.
pub async fn load_batch(pool: &SqlitePool, batch_id: &str) -> Result<Option<Batch>> {
    let row = sqlx::query(
        r#"
        SELECT id, owner_id, total_documents, processed_count, failed_count,
               status, summary_json, report_ref, created_at, completed_at
        FROM batches WHERE id = ?
        "#,
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let status_str: String = row.get("status");
    let summary_json: Option<String> = row.get("summary_json");

    Ok(Some(Batch {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        total_documents: row.get("total_documents"),
        processed_count: row.get("processed_count"),
        failed_count: row.get("failed_count"),
        status: BatchStatus::parse(&status_str).unwrap_or(BatchStatus::Pending),
        summary: summary_json.and_then(|s| serde_json::from_str(&s).ok()),
        report_ref: row.get("report_ref"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    }))
}

/// Point-in-time view of a batch for polling clients.
#[derive(Debug, Clone)]
pub struct BatchStatusView {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total_documents: i64,
    pub processed_count: i64,
    pub failed_count: i64,
    /// Documents parked for manual intervention; nonzero means the batch
    /// cannot finalize as completed until an operator acts.
    pub intervene_count: i64,
    pub summary: Option<BatchSummary>,
}

pub async fn get_batch_status(
    pool: &SqlitePool,
    batch_id: &str,
) -> Result<Option<BatchStatusView>> {
    let Some(batch) = load_batch(pool, batch_id).await? else {
        return Ok(None);
    };

    let intervene_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks WHERE batch_id = ? AND state = 'intervene'",
    )
    .bind(batch_id)
    .fetch_one(pool)
    .await?;

    Ok(Some(BatchStatusView {
        batch_id: batch.id,
        status: batch.status,
        total_documents: batch.total_documents,
        processed_count: batch.processed_count,
        failed_count: batch.failed_count,
        intervene_count,
        summary: batch.summary,
    }))
}

/// Result of asking for a batch report.
#[derive(Debug)]
pub enum ReportFetch {
    Ready(serde_json::Value),
    NotReady { status: BatchStatus },
    NotFound,
}

/// Fetch the durable report artifact for a finalized batch. Batches that
/// have not reached `completed` or `failed` yet answer `NotReady` — polling
/// again later is the expected protocol, not an error.
pub async fn get_batch_report(
    pool: &SqlitePool,
    store: &dyn ContentStore,
    batch_id: &str,
) -> Result<ReportFetch> {
    let Some(batch) = load_batch(pool, batch_id).await? else {
        return Ok(ReportFetch::NotFound);
    };

    match (batch.status, batch.report_ref) {
        (BatchStatus::Completed | BatchStatus::Failed, Some(reference)) => {
            let bytes = store.get(&reference).await?;
            let report = serde_json::from_slice(&bytes)?;
            Ok(ReportFetch::Ready(report))
        }
        (status, _) => Ok(ReportFetch::NotReady { status }),
    }
}

/// Externally cancel a batch. Guarded so a terminal batch is never
/// reopened; in-flight workers are not force-killed, their late completions
/// are simply ignored by the aggregator. Returns whether the transition
/// happened.
pub async fn cancel_batch(pool: &SqlitePool, batch_id: &str) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let updated = sqlx::query(
        r#"
        UPDATE batches SET status = 'cancelled', completed_at = ?
        WHERE id = ? AND status IN ('pending', 'processing')
        "#,
    )
    .bind(now)
    .bind(batch_id)
    .execute(pool)
    .await?;

    let cancelled = updated.rows_affected() == 1;
    if cancelled {
        tracing::info!(batch_id = %batch_id, "Batch cancelled");
    }
    Ok(cancelled)
}
