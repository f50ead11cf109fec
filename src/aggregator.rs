//! Batch aggregation and finalization.
//!
//! Completion is never tracked in process memory: every invocation recounts
//! the stored terminal outcomes for the batch and compares them against the
//! recorded document total. That makes [`check_and_finalize`] safe to call
//! repeatedly and concurrently — from every worker completion, from the
//! error handler, or from a periodic sweep — and resumable after a crash.
//!
//! The first caller to observe a complete batch claims the `finalizing`
//! guard via a conditional status update; racing callers see zero rows
//! affected and return the current state. Documents parked in the
//! `intervene` state have no terminal outcome, so a batch containing one
//! simply never counts as complete.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::batches;
use crate::models::{
    AnalysisResult, BatchStatus, BatchSummary, ErrorRecord, RiskHistogram, RiskLevel, Severity,
};
use crate::store::ContentStore;

/// Snapshot returned by [`check_and_finalize`].
#[derive(Debug, Clone)]
pub struct BatchCheck {
    pub status: BatchStatus,
    pub processed: i64,
    pub failed: i64,
    pub total: i64,
}

/// Re-derive batch progress from stored outcomes and finalize if complete.
///
/// Invoking this before all outcomes are in returns the current counts —
/// that is not an error. Invoking it against a batch that is already
/// terminal (completed, failed, or cancelled) is a no-op; late completions
/// are tolerated and ignored.
pub async fn check_and_finalize(
    pool: &SqlitePool,
    store: &dyn ContentStore,
    batch_id: &str,
) -> Result<BatchCheck> {
    let Some(batch) = batches::load_batch(pool, batch_id).await? else {
        anyhow::bail!("batch not found: {}", batch_id);
    };

    let total = batch.total_documents;
    let status = batch.status;

    let (processed, failed) = count_outcomes(pool, batch_id).await?;

    if status.is_terminal() {
        return Ok(BatchCheck {
            status,
            processed,
            failed,
            total,
        });
    }

    // Keep the stored counters in step with the recount. Guarded so a
    // concurrent finalizer's terminal write is never clobbered.
    sqlx::query(
        r#"
        UPDATE batches SET processed_count = ?, failed_count = ?
        WHERE id = ? AND status IN ('pending', 'processing')
        "#,
    )
    .bind(processed)
    .bind(failed)
    .bind(batch_id)
    .execute(pool)
    .await?;

    if processed + failed < total {
        // Forward-only: first observed activity moves pending → processing.
        if processed + failed > 0 {
            sqlx::query("UPDATE batches SET status = 'processing' WHERE id = ? AND status = 'pending'")
                .bind(batch_id)
                .execute(pool)
                .await?;
        }
        let status = if processed + failed > 0 {
            BatchStatus::Processing
        } else {
            status
        };
        return Ok(BatchCheck {
            status,
            processed,
            failed,
            total,
        });
    }

    // All outcomes are in. Claim the finalizing guard; losing the race to
    // an external cancellation means someone else owns the transition and
    // we just report what we see. A batch already in `finalizing` (a
    // crashed finalizer) is re-claimable: summary and report writes are
    // idempotent, and the terminal transition below is still guarded to
    // happen exactly once.
    let claimed = sqlx::query(
        "UPDATE batches SET status = 'finalizing' WHERE id = ? AND status IN ('pending', 'processing', 'finalizing')",
    )
    .bind(batch_id)
    .execute(pool)
    .await?;

    if claimed.rows_affected() == 0 {
        let current: String = sqlx::query_scalar("SELECT status FROM batches WHERE id = ?")
            .bind(batch_id)
            .fetch_one(pool)
            .await?;
        let status = BatchStatus::parse(&current).unwrap_or(BatchStatus::Processing);
        return Ok(BatchCheck {
            status,
            processed,
            failed,
            total,
        });
    }

    let results = load_results(pool, batch_id).await?;
    let summary = summarize(&results);

    let report =
        build_report(pool, batch_id, &batch.owner_id, total, processed, failed, &summary).await?;
    let report_key = format!("reports/{}.json", batch_id);
    let report_ref = store
        .put(&report_key, &serde_json::to_vec_pretty(&report)?)
        .await?;

    // Every document failed → the batch failed. Partial failure is a
    // completed batch with a nonzero failed count.
    let final_status = if total > 0 && failed == total {
        BatchStatus::Failed
    } else {
        BatchStatus::Completed
    };

    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        UPDATE batches
        SET status = ?, summary_json = ?, report_ref = ?,
            processed_count = ?, failed_count = ?, completed_at = ?
        WHERE id = ? AND status = 'finalizing'
        "#,
    )
    .bind(final_status.as_str())
    .bind(serde_json::to_string(&summary)?)
    .bind(&report_ref)
    .bind(processed)
    .bind(failed)
    .bind(now)
    .bind(batch_id)
    .execute(pool)
    .await?;

    tracing::info!(
        batch_id = %batch_id,
        status = final_status.as_str(),
        processed,
        failed,
        total,
        "Batch finalized"
    );

    Ok(BatchCheck {
        status: final_status,
        processed,
        failed,
        total,
    })
}

/// Count distinct documents with a terminal outcome, per outcome kind.
async fn count_outcomes(pool: &SqlitePool, batch_id: &str) -> Result<(i64, i64)> {
    let processed: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT document_id) FROM completions WHERE batch_id = ? AND outcome = 'success'",
    )
    .bind(batch_id)
    .fetch_one(pool)
    .await?;

    let failed: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT document_id) FROM completions WHERE batch_id = ? AND outcome = 'failed'",
    )
    .bind(batch_id)
    .fetch_one(pool)
    .await?;

    Ok((processed, failed))
}

async fn load_results(pool: &SqlitePool, batch_id: &str) -> Result<Vec<AnalysisResult>> {
    let rows = sqlx::query(
        r#"
        SELECT id, document_id, batch_id, attempt, accuracy, risk_level, flags_json,
               verification_sources, processing_time_ms, fallback, created_at
        FROM results WHERE batch_id = ?
        ORDER BY created_at
        "#,
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;

    let mut results = Vec::with_capacity(rows.len());
    for row in &rows {
        let risk_str: String = row.get("risk_level");
        let flags_json: String = row.get("flags_json");
        results.push(AnalysisResult {
            id: row.get("id"),
            document_id: row.get("document_id"),
            batch_id: row.get("batch_id"),
            attempt: row.get("attempt"),
            accuracy: row.get("accuracy"),
            risk_level: RiskLevel::parse(&risk_str).unwrap_or(RiskLevel::Critical),
            flags: serde_json::from_str(&flags_json).unwrap_or_default(),
            verification_sources: row.get("verification_sources"),
            processing_time_ms: row.get("processing_time_ms"),
            fallback: row.get("fallback"),
            created_at: row.get("created_at"),
        });
    }
    Ok(results)
}

/// Compute aggregate statistics over the batch's successful results.
pub fn summarize(results: &[AnalysisResult]) -> BatchSummary {
    let mut histogram = RiskHistogram::default();
    let mut accuracy_sum = 0.0;
    let mut total_flags = 0i64;
    let mut total_time_ms = 0i64;

    for result in results {
        histogram.bump(result.risk_level);
        accuracy_sum += result.accuracy;
        total_flags += result.flags.len() as i64;
        total_time_ms += result.processing_time_ms;
    }

    let count = results.len() as f64;
    BatchSummary {
        average_accuracy: if results.is_empty() {
            0.0
        } else {
            accuracy_sum / count
        },
        total_flags,
        risk_histogram: histogram,
        average_processing_time_ms: if results.is_empty() {
            0.0
        } else {
            total_time_ms as f64 / count
        },
        total_processing_time_ms: total_time_ms,
    }
}

/// Assemble the durable per-document report artifact.
async fn build_report(
    pool: &SqlitePool,
    batch_id: &str,
    owner_id: &str,
    total: i64,
    processed: i64,
    failed: i64,
    summary: &BatchSummary,
) -> Result<serde_json::Value> {
    let task_rows = sqlx::query(
        "SELECT id, filename, state FROM tasks WHERE batch_id = ? ORDER BY created_at, id",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;

    let results = load_results(pool, batch_id).await?;

    let mut documents = Vec::with_capacity(task_rows.len());
    for row in &task_rows {
        let document_id: String = row.get("id");
        let filename: Option<String> = row.get("filename");
        let state: String = row.get("state");

        let mut doc = serde_json::json!({
            "document_id": document_id,
            "filename": filename,
            "outcome": state,
        });

        if let Some(result) = results.iter().find(|r| r.document_id == document_id) {
            doc["accuracy"] = serde_json::json!(result.accuracy);
            doc["risk_level"] = serde_json::json!(result.risk_level.as_str());
            doc["flags"] = serde_json::to_value(&result.flags)?;
            doc["fallback"] = serde_json::json!(result.fallback);
        } else if let Some(error) = latest_unresolved_error(pool, &document_id).await? {
            doc["error_category"] = serde_json::json!(error.category);
            doc["error_message"] = serde_json::json!(error.message);
        }

        documents.push(doc);
    }

    Ok(serde_json::json!({
        "batch_id": batch_id,
        "owner_id": owner_id,
        "generated_at": chrono::Utc::now().timestamp(),
        "total_documents": total,
        "processed_count": processed,
        "failed_count": failed,
        "summary": summary,
        "documents": documents,
    }))
}

async fn latest_unresolved_error(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Option<ErrorRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, batch_id, document_id, attempt, category, severity, message,
               recoverable, retryable, retry_delay_ms, max_retries, resolved, created_at
        FROM error_records
        WHERE document_id = ? AND resolved = 0
        ORDER BY attempt DESC, created_at DESC
        LIMIT 1
        "#,
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| {
        let severity_str: String = r.get("severity");
        ErrorRecord {
            id: r.get("id"),
            batch_id: r.get("batch_id"),
            document_id: r.get("document_id"),
            attempt: r.get("attempt"),
            category: r.get("category"),
            severity: Severity::parse(&severity_str).unwrap_or(Severity::High),
            message: r.get("message"),
            recoverable: r.get("recoverable"),
            retryable: r.get("retryable"),
            retry_delay_ms: r.get("retry_delay_ms"),
            max_retries: r.get("max_retries"),
            resolved: r.get("resolved"),
            created_at: r.get("created_at"),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Flag;

    fn loaded(document_id: &str, accuracy: f64, flag_count: usize, time_ms: i64) -> AnalysisResult {
        AnalysisResult {
            id: format!("r-{}", document_id),
            document_id: document_id.to_string(),
            batch_id: "b1".to_string(),
            attempt: 0,
            accuracy,
            risk_level: RiskLevel::from_accuracy(accuracy),
            flags: (0..flag_count)
                .map(|i| Flag {
                    excerpt: format!("span {}", i),
                    reason: "test".to_string(),
                })
                .collect(),
            verification_sources: 0,
            processing_time_ms: time_ms,
            fallback: false,
            created_at: 0,
        }
    }

    #[test]
    fn summary_over_mixed_accuracies() {
        let results = vec![
            loaded("a", 95.0, 0, 100),
            loaded("b", 82.0, 2, 250),
            loaded("c", 60.0, 5, 400),
        ];
        let summary = summarize(&results);

        assert!((summary.average_accuracy - 79.0).abs() < 1e-9);
        assert_eq!(summary.total_flags, 7);
        assert_eq!(summary.risk_histogram.low, 1);
        assert_eq!(summary.risk_histogram.medium, 1);
        assert_eq!(summary.risk_histogram.high, 0);
        assert_eq!(summary.risk_histogram.critical, 1);
        assert_eq!(summary.total_processing_time_ms, 750);
        assert!((summary.average_processing_time_ms - 250.0).abs() < 1e-9);
    }

    #[test]
    fn summary_of_empty_results() {
        let summary = summarize(&[]);
        assert_eq!(summary.average_accuracy, 0.0);
        assert_eq!(summary.total_flags, 0);
        assert_eq!(summary.total_processing_time_ms, 0);
    }
}
