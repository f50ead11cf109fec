//! Failure classification and handling.
//!
//! Workers never decide retry policy themselves: every failed attempt is
//! forwarded here with full task context. [`classify`] is a pure mapping
//! from a failure to its category and fixed policy tuple, so retry behavior
//! is auditable and testable in isolation. [`handle_failure`] applies the
//! three-way split that determines whether a batch can reach a terminal
//! state:
//!
//! - **retry** — persist intent and schedule a re-dispatch after a jittered
//!   backoff; the document stays outstanding and batch counters are untouched.
//! - **intervene** — park the document in the explicit stuck state; the
//!   batch cannot finalize as completed until an operator acts.
//! - **terminal failure** — record the document as failed and poke the
//!   aggregator, which may finalize the batch.
//!
//! | category | recoverable | retryable | backoff | max retries |
//! |---|---|---|---|---|
//! | throttling | yes | yes | 60s | 3 |
//! | timeout | yes | yes | 30s | 2 |
//! | service_unavailable | yes | yes | 300s | 2 |
//! | authorization | yes | no | — | — |
//! | validation | no | no | — | — |
//! | unknown | no | no | — | — |
//!
//! Unclassified failures are never auto-retried; a retry storm on an
//! unrecognized failure mode is worse than a stuck document.

use anyhow::Result;
use rand::Rng;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::aggregator;
use crate::models::Severity;
use crate::queue;
use crate::store::ContentStore;

/// Typed failure raised by a document worker attempt.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("authorization: {0}")]
    Authorization(String),
    #[error("{0}")]
    Other(String),
}

/// Pipeline stage an attempt was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStage {
    Dispatched,
    Fetching,
    Analyzing,
    Persisting,
}

impl WorkerStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStage::Dispatched => "dispatched",
            WorkerStage::Fetching => "fetching",
            WorkerStage::Analyzing => "analyzing",
            WorkerStage::Persisting => "persisting",
        }
    }
}

/// A failed attempt with full task context, as forwarded by a worker.
#[derive(Debug)]
pub struct FailureInfo {
    pub batch_id: String,
    pub document_id: String,
    pub attempt: i64,
    pub stage: WorkerStage,
    pub error: WorkerError,
}

/// Error category with a fixed retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Throttling,
    Timeout,
    ServiceUnavailable,
    Authorization,
    Validation,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Throttling => "throttling",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ServiceUnavailable => "service_unavailable",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// The classification verdict: category plus its policy tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorAnalysis {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recoverable: bool,
    pub retryable: bool,
    pub retry_delay_ms: Option<i64>,
    pub max_retries: Option<i64>,
}

/// Classify a worker failure. Pure and deterministic: the same error always
/// yields the same policy tuple.
pub fn classify(error: &WorkerError) -> ErrorAnalysis {
    let category = match error {
        WorkerError::Validation(_) => ErrorCategory::Validation,
        WorkerError::Throttled(_) => ErrorCategory::Throttling,
        WorkerError::Timeout(_) => ErrorCategory::Timeout,
        WorkerError::Unavailable(_) => ErrorCategory::ServiceUnavailable,
        WorkerError::Authorization(_) => ErrorCategory::Authorization,
        WorkerError::Other(message) => category_from_message(message),
    };
    analysis_for(category)
}

/// Fallback classification for untyped failures, by message substring.
fn category_from_message(message: &str) -> ErrorCategory {
    let msg = message.to_lowercase();

    if msg.contains("throttl") || msg.contains("rate limit") || msg.contains("too many requests") {
        ErrorCategory::Throttling
    } else if msg.contains("timed out") || msg.contains("timeout") {
        ErrorCategory::Timeout
    } else if msg.contains("unavailable") || msg.contains("connection refused") {
        ErrorCategory::ServiceUnavailable
    } else if msg.contains("unauthorized")
        || msg.contains("forbidden")
        || msg.contains("access denied")
    {
        ErrorCategory::Authorization
    } else if msg.contains("invalid") || msg.contains("empty") || msg.contains("malformed") {
        ErrorCategory::Validation
    } else {
        ErrorCategory::Unknown
    }
}

/// The fixed policy table.
fn analysis_for(category: ErrorCategory) -> ErrorAnalysis {
    match category {
        ErrorCategory::Throttling => ErrorAnalysis {
            category,
            severity: Severity::Medium,
            recoverable: true,
            retryable: true,
            retry_delay_ms: Some(60_000),
            max_retries: Some(3),
        },
        ErrorCategory::Timeout => ErrorAnalysis {
            category,
            severity: Severity::Medium,
            recoverable: true,
            retryable: true,
            retry_delay_ms: Some(30_000),
            max_retries: Some(2),
        },
        ErrorCategory::ServiceUnavailable => ErrorAnalysis {
            category,
            severity: Severity::High,
            recoverable: true,
            retryable: true,
            retry_delay_ms: Some(300_000),
            max_retries: Some(2),
        },
        ErrorCategory::Authorization => ErrorAnalysis {
            category,
            severity: Severity::High,
            recoverable: true,
            retryable: false,
            retry_delay_ms: None,
            max_retries: None,
        },
        ErrorCategory::Validation => ErrorAnalysis {
            category,
            severity: Severity::Low,
            recoverable: false,
            retryable: false,
            retry_delay_ms: None,
            max_retries: None,
        },
        ErrorCategory::Unknown => ErrorAnalysis {
            category,
            severity: Severity::High,
            recoverable: false,
            retryable: false,
            retry_delay_ms: None,
            max_retries: None,
        },
    }
}

/// What the handler decided for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// A new attempt was scheduled after the given delay.
    Retry { delay_ms: i64, next_attempt: i64 },
    /// The document was parked for manual intervention.
    Intervene,
    /// The document terminally failed and the batch was re-checked.
    TerminalFailure,
}

/// Apply backoff jitter: uniform in `[0.75, 1.25] × base`.
pub fn jittered_delay_ms(base_ms: i64) -> i64 {
    let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
    (base_ms as f64 * factor) as i64
}

/// Handle a classified failure. Persists an error record for every failed
/// attempt, then applies the three-way retry / intervene / fail split.
///
/// Scheduling a retry only persists intent (a future-dated dispatch row);
/// this function never sleeps through a backoff.
pub async fn handle_failure(
    pool: &SqlitePool,
    store: &dyn ContentStore,
    info: &FailureInfo,
) -> Result<FailureOutcome> {
    let analysis = classify(&info.error);

    persist_error_record(pool, info, &analysis).await?;

    tracing::warn!(
        batch_id = %info.batch_id,
        document_id = %info.document_id,
        attempt = info.attempt,
        stage = info.stage.as_str(),
        category = analysis.category.as_str(),
        "Worker attempt failed"
    );

    if analysis.retryable {
        let max_retries = analysis.max_retries.unwrap_or(0);
        if info.attempt < max_retries {
            let delay_ms = jittered_delay_ms(analysis.retry_delay_ms.unwrap_or(0));
            let next_attempt = info.attempt + 1;

            sqlx::query("UPDATE tasks SET attempt = ?, state = 'queued' WHERE id = ?")
                .bind(next_attempt)
                .bind(&info.document_id)
                .execute(pool)
                .await?;
            queue::enqueue(pool, &info.document_id, next_attempt, &info.batch_id, delay_ms)
                .await?;

            tracing::info!(
                document_id = %info.document_id,
                next_attempt,
                delay_ms,
                "Scheduled retry"
            );
            return Ok(FailureOutcome::Retry {
                delay_ms,
                next_attempt,
            });
        }
    }

    if analysis.recoverable && !analysis.retryable {
        // Stuck: the document is neither outstanding work nor a failure.
        // It blocks batch completion until an operator resolves it.
        sqlx::query("UPDATE tasks SET state = 'intervene' WHERE id = ?")
            .bind(&info.document_id)
            .execute(pool)
            .await?;
        tracing::warn!(
            document_id = %info.document_id,
            category = analysis.category.as_str(),
            "Document parked for manual intervention"
        );
        return Ok(FailureOutcome::Intervene);
    }

    // Terminal failure: either non-recoverable or retries exhausted.
    sqlx::query("UPDATE tasks SET state = 'failed' WHERE id = ?")
        .bind(&info.document_id)
        .execute(pool)
        .await?;

    // Earlier attempts' records are superseded by this terminal outcome;
    // the terminal record itself stays unresolved.
    sqlx::query("UPDATE error_records SET resolved = 1 WHERE document_id = ? AND attempt < ?")
        .bind(&info.document_id)
        .bind(info.attempt)
        .execute(pool)
        .await?;

    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO completions (document_id, attempt, batch_id, outcome, result_id, created_at)
        VALUES (?, ?, ?, 'failed', NULL, ?)
        "#,
    )
    .bind(&info.document_id)
    .bind(info.attempt)
    .bind(&info.batch_id)
    .bind(now)
    .execute(pool)
    .await?;

    aggregator::check_and_finalize(pool, store, &info.batch_id).await?;

    Ok(FailureOutcome::TerminalFailure)
}

/// Mark every error record for a document resolved. Called when a later
/// attempt succeeds.
pub async fn resolve_document_errors(pool: &SqlitePool, document_id: &str) -> Result<()> {
    sqlx::query("UPDATE error_records SET resolved = 1 WHERE document_id = ?")
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn persist_error_record(
    pool: &SqlitePool,
    info: &FailureInfo,
    analysis: &ErrorAnalysis,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let message = format!("{}: {}", info.stage.as_str(), info.error);

    sqlx::query(
        r#"
        INSERT INTO error_records
            (id, batch_id, document_id, attempt, category, severity, message,
             recoverable, retryable, retry_delay_ms, max_retries, resolved, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&info.batch_id)
    .bind(&info.document_id)
    .bind(info.attempt)
    .bind(analysis.category.as_str())
    .bind(analysis.severity.as_str())
    .bind(&message)
    .bind(analysis.recoverable)
    .bind(analysis.retryable)
    .bind(analysis.retry_delay_ms)
    .bind(analysis.max_retries)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_deterministic() {
        for _ in 0..3 {
            let a = classify(&WorkerError::Throttled("429 from model endpoint".into()));
            assert_eq!(a.category, ErrorCategory::Throttling);
            assert!(a.recoverable);
            assert!(a.retryable);
            assert_eq!(a.retry_delay_ms, Some(60_000));
            assert_eq!(a.max_retries, Some(3));
        }
    }

    #[test]
    fn policy_table_matches_fixed_values() {
        let timeout = classify(&WorkerError::Timeout("attempt budget exceeded".into()));
        assert_eq!(timeout.retry_delay_ms, Some(30_000));
        assert_eq!(timeout.max_retries, Some(2));

        let unavailable = classify(&WorkerError::Unavailable("502 from model".into()));
        assert_eq!(unavailable.retry_delay_ms, Some(300_000));
        assert_eq!(unavailable.max_retries, Some(2));

        let auth = classify(&WorkerError::Authorization("key rejected".into()));
        assert!(auth.recoverable);
        assert!(!auth.retryable);
        assert_eq!(auth.retry_delay_ms, None);

        let validation = classify(&WorkerError::Validation("empty content".into()));
        assert!(!validation.recoverable);
        assert!(!validation.retryable);

        let unknown = classify(&WorkerError::Other("segfault in the matrix".into()));
        assert_eq!(unknown.category, ErrorCategory::Unknown);
        assert!(!unknown.retryable);
    }

    #[test]
    fn untyped_failures_classify_by_message() {
        let cases = [
            ("rate limit exceeded", ErrorCategory::Throttling),
            ("request timed out after 30s", ErrorCategory::Timeout),
            ("upstream unavailable", ErrorCategory::ServiceUnavailable),
            ("connection refused", ErrorCategory::ServiceUnavailable),
            ("401 unauthorized", ErrorCategory::Authorization),
            ("invalid document encoding", ErrorCategory::Validation),
            ("something odd happened", ErrorCategory::Unknown),
        ];
        for (message, expected) in cases {
            let analysis = classify(&WorkerError::Other(message.to_string()));
            assert_eq!(analysis.category, expected, "message: {}", message);
        }
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..200 {
            let delay = jittered_delay_ms(60_000);
            assert!((45_000..=75_000).contains(&delay), "delay {}", delay);
        }
    }
}
