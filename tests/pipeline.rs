//! End-to-end pipeline tests against a temporary SQLite database.
//!
//! These exercise the library the way the CLI and server do: submit a
//! batch, run the worker until the queue is idle, and observe the batch
//! through the status and report operations.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tempfile::TempDir;

use veritor::aggregator;
use veritor::batches::{self, DocumentSubmission, ReportFetch};
use veritor::config::{
    AnalyzerConfig, Config, DbConfig, MonitorConfig, ServerConfig, StorageConfig, WorkerConfig,
};
use veritor::failure::{self, FailureInfo, FailureOutcome, WorkerError, WorkerStage};
use veritor::metrics;
use veritor::migrate;
use veritor::models::{Alert, BatchStatus, RiskLevel, Severity};
use veritor::monitor::{self, AlertSink};
use veritor::queue;
use veritor::store::FsContentStore;
use veritor::worker;

async fn setup() -> (TempDir, Config, SqlitePool, FsContentStore) {
    let tmp = TempDir::new().unwrap();

    let config = Config {
        db: DbConfig {
            path: tmp.path().join("data/veritor.sqlite"),
        },
        storage: StorageConfig {
            root: tmp.path().join("storage"),
            inline_max_bytes: 1024,
        },
        analyzer: AnalyzerConfig::default(),
        worker: WorkerConfig::default(),
        monitor: MonitorConfig::default(),
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
    };

    let pool = veritor::db::connect(&config).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    let store = FsContentStore::new(&config.storage);

    (tmp, config, pool, store)
}

async fn submit(
    pool: &SqlitePool,
    store: &FsContentStore,
    config: &Config,
    docs: &[(&str, &str)],
) -> String {
    let documents = docs
        .iter()
        .map(|(name, content)| DocumentSubmission {
            filename: Some(name.to_string()),
            content: content.as_bytes().to_vec(),
        })
        .collect();

    batches::submit_batch(pool, store, &config.storage, "tester", documents)
        .await
        .unwrap()
}

async fn task_id_for(pool: &SqlitePool, batch_id: &str, filename: &str) -> String {
    sqlx::query_scalar("SELECT id FROM tasks WHERE batch_id = ? AND filename = ?")
        .bind(batch_id)
        .bind(filename)
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Make every scheduled dispatch immediately claimable, as if its backoff
/// had elapsed.
async fn fast_forward_backoffs(pool: &SqlitePool) {
    sqlx::query("UPDATE dispatches SET available_at = 0 WHERE state = 'ready'")
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn full_pipeline_processes_a_batch_to_completion() {
    let (_tmp, config, pool, store) = setup().await;

    let batch_id = submit(
        &pool,
        &store,
        &config,
        &[
            ("clean.txt", "The committee reviewed the figures and found them plausible."),
            (
                "hedged.txt",
                "The results are definitely reliable and scientifically proven.",
            ),
            (
                "wild.txt",
                "This is definitely true, guaranteed, 100% accurate, undeniable, \
                 scientifically proven, and everyone knows it never fails.",
            ),
        ],
    )
    .await;

    let handled = worker::drain(&config, &pool, &store).await.unwrap();
    assert_eq!(handled, 3);

    let view = batches::get_batch_status(&pool, &batch_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.status, BatchStatus::Completed);
    assert_eq!(view.processed_count, 3);
    assert_eq!(view.failed_count, 0);
    assert_eq!(view.intervene_count, 0);

    // Terminal invariant: counts add up to the total
    assert_eq!(
        view.processed_count + view.failed_count,
        view.total_documents
    );

    let summary = view.summary.expect("completed batch has a summary");
    let histogram = &summary.risk_histogram;
    assert_eq!(
        histogram.low + histogram.medium + histogram.high + histogram.critical,
        3
    );

    match batches::get_batch_report(&pool, &store, &batch_id)
        .await
        .unwrap()
    {
        ReportFetch::Ready(report) => {
            let documents = report["documents"].as_array().unwrap();
            assert_eq!(documents.len(), 3);
            for doc in documents {
                assert_eq!(doc["outcome"], "completed");
                assert!(doc["accuracy"].is_number());
            }
        }
        other => panic!("expected a ready report, got {:?}", other),
    }
}

#[tokio::test]
async fn scenario_a_summary_for_known_accuracies() {
    let (_tmp, _config, pool, store) = setup().await;

    // Batch of 3 with accuracies {95, 82, 60}, written as workers would
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "INSERT INTO batches (id, owner_id, total_documents, status, created_at) VALUES ('b1', 'tester', 3, 'processing', ?)",
    )
    .bind(now)
    .execute(&pool)
    .await
    .unwrap();

    for (doc, accuracy) in [("d1", 95.0f64), ("d2", 82.0), ("d3", 60.0)] {
        sqlx::query(
            "INSERT INTO tasks (id, batch_id, owner_id, content_ref, attempt, state, created_at) VALUES (?, 'b1', 'tester', 'inline:', 0, 'completed', ?)",
        )
        .bind(doc)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query(
            r#"
            INSERT INTO results (id, document_id, batch_id, attempt, accuracy, risk_level, flags_json, verification_sources, processing_time_ms, fallback, created_at)
            VALUES (?, ?, 'b1', 0, ?, ?, '[]', 0, 100, 0, ?)
            "#,
        )
        .bind(format!("r-{}", doc))
        .bind(doc)
        .bind(accuracy)
        .bind(RiskLevel::from_accuracy(accuracy).as_str())
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO completions (document_id, attempt, batch_id, outcome, result_id, created_at) VALUES (?, 0, 'b1', 'success', ?, ?)",
        )
        .bind(doc)
        .bind(format!("r-{}", doc))
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();
    }

    let check = aggregator::check_and_finalize(&pool, &store, "b1")
        .await
        .unwrap();
    assert_eq!(check.status, BatchStatus::Completed);
    assert_eq!(check.processed, 3);
    assert_eq!(check.failed, 0);

    let view = batches::get_batch_status(&pool, "b1").await.unwrap().unwrap();
    let summary = view.summary.unwrap();
    assert!((summary.average_accuracy - 79.0).abs() < 1e-9);
    assert_eq!(summary.risk_histogram.low, 1);
    assert_eq!(summary.risk_histogram.medium, 1);
    assert_eq!(summary.risk_histogram.high, 0);
    assert_eq!(summary.risk_histogram.critical, 1);
}

#[tokio::test]
async fn scenario_b_retry_success_and_permanent_validation_failure() {
    let (_tmp, config, pool, store) = setup().await;

    // doc2 is empty: the worker rejects it after fetch as a validation
    // error, which is never retried
    let batch_id = submit(
        &pool,
        &store,
        &config,
        &[("doc1.txt", "An ordinary factual paragraph."), ("doc2.txt", "")],
    )
    .await;
    let doc1 = task_id_for(&pool, &batch_id, "doc1.txt").await;

    // doc1's first attempt hits throttling (as a worker would report it)
    let outcome = failure::handle_failure(
        &pool,
        &store,
        &FailureInfo {
            batch_id: batch_id.clone(),
            document_id: doc1.clone(),
            attempt: 0,
            stage: WorkerStage::Analyzing,
            error: WorkerError::Throttled("model endpoint rate limited".to_string()),
        },
    )
    .await
    .unwrap();
    assert!(matches!(
        outcome,
        FailureOutcome::Retry { next_attempt: 1, .. }
    ));

    // The retry is scheduled with backoff; fast-forward it and process
    fast_forward_backoffs(&pool).await;
    worker::drain(&config, &pool, &store).await.unwrap();

    let view = batches::get_batch_status(&pool, &batch_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.status, BatchStatus::Completed);
    assert_eq!(view.processed_count, 1);
    assert_eq!(view.failed_count, 1);
    assert_eq!(
        view.processed_count + view.failed_count,
        view.total_documents
    );

    // doc1's throttling record resolved by the later success
    let doc1_unresolved: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM error_records WHERE document_id = ? AND resolved = 0",
    )
    .bind(&doc1)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(doc1_unresolved, 0);

    // doc2 keeps its terminal validation record
    let validation_errors: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM error_records WHERE batch_id = ? AND category = 'validation' AND resolved = 0",
    )
    .bind(&batch_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(validation_errors, 1);

    // The report names the failure
    match batches::get_batch_report(&pool, &store, &batch_id)
        .await
        .unwrap()
    {
        ReportFetch::Ready(report) => {
            let failed_doc = report["documents"]
                .as_array()
                .unwrap()
                .iter()
                .find(|d| d["outcome"] == "failed")
                .expect("one failed document in report");
            assert_eq!(failed_doc["error_category"], "validation");
        }
        other => panic!("expected a ready report, got {:?}", other),
    }
}

#[tokio::test]
async fn scenario_c_exhausted_timeouts_fail_the_whole_batch() {
    let (_tmp, config, pool, store) = setup().await;

    let batch_id = submit(&pool, &store, &config, &[("only.txt", "some content")]).await;
    let doc = task_id_for(&pool, &batch_id, "only.txt").await;

    // Consume the initial dispatch as a worker would before failing
    let dispatch = queue::claim(&pool, config.worker.lease_secs)
        .await
        .unwrap()
        .unwrap();
    queue::ack(&pool, &dispatch.task_id, dispatch.attempt)
        .await
        .unwrap();

    // Timeout policy: max_retries = 2, so attempts 0 and 1 retry and
    // attempt 2 is terminal — never more than maxRetries + 1 attempts.
    for (attempt, expect_retry) in [(0i64, true), (1, true), (2, false)] {
        let outcome = failure::handle_failure(
            &pool,
            &store,
            &FailureInfo {
                batch_id: batch_id.clone(),
                document_id: doc.clone(),
                attempt,
                stage: WorkerStage::Analyzing,
                error: WorkerError::Timeout("analysis exceeded the attempt budget".to_string()),
            },
        )
        .await
        .unwrap();

        if expect_retry {
            assert!(matches!(outcome, FailureOutcome::Retry { .. }));
        } else {
            assert_eq!(outcome, FailureOutcome::TerminalFailure);
        }
    }

    // Attempt counter on the task never exceeded maxRetries + 1
    let attempt: i64 = sqlx::query_scalar("SELECT attempt FROM tasks WHERE id = ?")
        .bind(&doc)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(attempt <= 2);

    // 100% of documents failed: the batch is failed, not stuck in
    // processing
    let view = batches::get_batch_status(&pool, &batch_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.status, BatchStatus::Failed);
    assert_eq!(view.processed_count, 0);
    assert_eq!(view.failed_count, 1);
}

#[tokio::test]
async fn scenario_d_duplicate_completion_delivery_counts_once() {
    let (_tmp, config, pool, store) = setup().await;

    let batch_id = submit(&pool, &store, &config, &[("doc.txt", "plain content")]).await;
    let doc = task_id_for(&pool, &batch_id, "doc.txt").await;

    worker::drain(&config, &pool, &store).await.unwrap();

    let view = batches::get_batch_status(&pool, &batch_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.processed_count, 1);

    // Redeliver the same completion event; the (document_id, attempt) key
    // makes it a no-op
    sqlx::query(
        "INSERT OR IGNORE INTO completions (document_id, attempt, batch_id, outcome, result_id, created_at) VALUES (?, 0, ?, 'success', 'dup', 0)",
    )
    .bind(&doc)
    .bind(&batch_id)
    .execute(&pool)
    .await
    .unwrap();
    aggregator::check_and_finalize(&pool, &store, &batch_id)
        .await
        .unwrap();

    // Redeliver the dispatch itself, as an at-least-once queue may
    sqlx::query("UPDATE dispatches SET state = 'ready', available_at = 0 WHERE task_id = ?")
        .bind(&doc)
        .execute(&pool)
        .await
        .unwrap();
    worker::drain(&config, &pool, &store).await.unwrap();

    let view = batches::get_batch_status(&pool, &batch_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.processed_count, 1, "duplicate delivery double-counted");
    assert_eq!(view.status, BatchStatus::Completed);

    let result_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM results WHERE document_id = ?")
        .bind(&doc)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(result_count, 1);
}

#[tokio::test]
async fn finalize_is_idempotent_across_repeated_calls() {
    let (_tmp, config, pool, store) = setup().await;

    let batch_id = submit(&pool, &store, &config, &[("doc.txt", "content")]).await;
    worker::drain(&config, &pool, &store).await.unwrap();

    let first = aggregator::check_and_finalize(&pool, &store, &batch_id)
        .await
        .unwrap();
    let second = aggregator::check_and_finalize(&pool, &store, &batch_id)
        .await
        .unwrap();

    assert_eq!(first.status, BatchStatus::Completed);
    assert_eq!(second.status, BatchStatus::Completed);
    assert_eq!(second.processed, first.processed);
}

#[tokio::test]
async fn checking_an_incomplete_batch_reports_pending_counts() {
    let (_tmp, config, pool, store) = setup().await;

    let batch_id = submit(
        &pool,
        &store,
        &config,
        &[("a.txt", "content a"), ("b.txt", "content b")],
    )
    .await;

    // No outcomes yet: not an error, just current counts
    let check = aggregator::check_and_finalize(&pool, &store, &batch_id)
        .await
        .unwrap();
    assert!(!check.status.is_terminal());
    assert_eq!(check.processed, 0);
    assert_eq!(check.failed, 0);
    assert_eq!(check.total, 2);
}

#[tokio::test]
async fn stuck_document_blocks_completion_without_failing_the_batch() {
    let (_tmp, config, pool, store) = setup().await;

    let batch_id = submit(&pool, &store, &config, &[("doc.txt", "content")]).await;
    let doc = task_id_for(&pool, &batch_id, "doc.txt").await;

    let dispatch = queue::claim(&pool, config.worker.lease_secs)
        .await
        .unwrap()
        .unwrap();
    queue::ack(&pool, &dispatch.task_id, dispatch.attempt)
        .await
        .unwrap();

    let outcome = failure::handle_failure(
        &pool,
        &store,
        &FailureInfo {
            batch_id: batch_id.clone(),
            document_id: doc.clone(),
            attempt: 0,
            stage: WorkerStage::Analyzing,
            error: WorkerError::Authorization("model endpoint rejected credentials".to_string()),
        },
    )
    .await
    .unwrap();
    assert_eq!(outcome, FailureOutcome::Intervene);

    // The batch cannot finalize while the document awaits an operator
    let check = aggregator::check_and_finalize(&pool, &store, &batch_id)
        .await
        .unwrap();
    assert!(!check.status.is_terminal());
    assert_eq!(check.failed, 0);

    let view = batches::get_batch_status(&pool, &batch_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.intervene_count, 1);
}

#[tokio::test]
async fn cancelled_batch_ignores_late_completions() {
    let (_tmp, config, pool, store) = setup().await;

    let batch_id = submit(&pool, &store, &config, &[("doc.txt", "content")]).await;

    assert!(batches::cancel_batch(&pool, &batch_id).await.unwrap());
    // Cancelling twice is a guarded no-op
    assert!(!batches::cancel_batch(&pool, &batch_id).await.unwrap());

    // A late worker pass finds the batch terminal and drops the dispatch
    worker::drain(&config, &pool, &store).await.unwrap();

    let view = batches::get_batch_status(&pool, &batch_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.status, BatchStatus::Cancelled);
    assert_eq!(view.processed_count, 0);

    match batches::get_batch_report(&pool, &store, &batch_id)
        .await
        .unwrap()
    {
        ReportFetch::NotReady { status } => assert_eq!(status, BatchStatus::Cancelled),
        other => panic!("expected not-ready report, got {:?}", other),
    }
}

#[tokio::test]
async fn worker_attempts_record_fleet_metrics() {
    let (_tmp, config, pool, store) = setup().await;

    let batch_id = submit(&pool, &store, &config, &[("doc.txt", "content")]).await;
    worker::drain(&config, &pool, &store).await.unwrap();

    let resource = config.monitor.worker_resources.first().unwrap();
    let since = chrono::Utc::now().timestamp() - 60;
    let invocations = metrics::window_stats(&pool, "worker.invocations", resource, since)
        .await
        .unwrap()
        .expect("invocation samples recorded");
    assert!(invocations.sum >= 1.0);

    let _ = batch_id;
}

struct CollectingSink {
    alerts: Mutex<Vec<Alert>>,
}

#[async_trait]
impl AlertSink for CollectingSink {
    async fn push(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

#[tokio::test]
async fn monitor_alerts_on_degraded_cache_hit_rate_only() {
    let (_tmp, config, pool, _store) = setup().await;

    metrics::record(&pool, "cache.hit_rate", 60.0, "percent", "cache")
        .await
        .unwrap();

    let sink = CollectingSink {
        alerts: Mutex::new(Vec::new()),
    };
    let report = monitor::run_cycle(&pool, &config, &sink).await.unwrap();

    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.alerts[0].severity, Severity::Medium);
    assert!(report.alerts[0].message.contains("hit rate"));
    assert_eq!(sink.alerts.lock().unwrap().len(), 1);

    // A second cycle re-evaluates independently and alerts again
    let report = monitor::run_cycle(&pool, &config, &sink).await.unwrap();
    assert_eq!(report.alerts.len(), 1);
}

#[tokio::test]
async fn monitor_is_quiet_on_a_healthy_cache() {
    let (_tmp, config, pool, _store) = setup().await;

    metrics::record(&pool, "cache.hit_rate", 85.0, "percent", "cache")
        .await
        .unwrap();

    let sink = CollectingSink {
        alerts: Mutex::new(Vec::new()),
    };
    let report = monitor::run_cycle(&pool, &config, &sink).await.unwrap();
    assert!(report.alerts.is_empty());
}

#[tokio::test]
async fn monitor_recommends_from_hourly_history() {
    let (_tmp, config, pool, _store) = setup().await;

    // Eight hours of rising invocation history
    let now = chrono::Utc::now().timestamp();
    let resource = config.monitor.worker_resources.first().unwrap();
    for (i, load) in [10.0, 12.0, 11.0, 20.0, 40.0, 60.0, 80.0, 100.0]
        .iter()
        .enumerate()
    {
        let ts = now - (8 - i as i64) * 3600;
        metrics::record_at(&pool, "worker.invocations", *load, "count", resource, ts)
            .await
            .unwrap();
    }

    let sink = CollectingSink {
        alerts: Mutex::new(Vec::new()),
    };
    let report = monitor::run_cycle(&pool, &config, &sink).await.unwrap();

    let rec = report
        .recommendations
        .iter()
        .find(|r| &r.resource_id == resource)
        .expect("a recommendation for the worker fleet");
    assert_eq!(rec.action, monitor::ScaleAction::Out);
    assert!(rec.confidence >= 0.7);
    assert!(rec.applied);
}

#[tokio::test]
async fn submitting_an_empty_batch_is_rejected() {
    let (_tmp, _config, pool, store) = setup().await;

    let result = batches::submit_batch(
        &pool,
        &store,
        &StorageConfig {
            root: std::path::PathBuf::from("/tmp/unused"),
            inline_max_bytes: 1024,
        },
        "tester",
        Vec::new(),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn status_row_counts_match_stored_rows_at_terminal() {
    let (_tmp, config, pool, store) = setup().await;

    let batch_id = submit(
        &pool,
        &store,
        &config,
        &[("a.txt", "content a"), ("b.txt", ""), ("c.txt", "content c")],
    )
    .await;

    worker::drain(&config, &pool, &store).await.unwrap();

    let view = batches::get_batch_status(&pool, &batch_id)
        .await
        .unwrap()
        .unwrap();
    assert!(view.status.is_terminal());
    assert_eq!(
        view.processed_count + view.failed_count,
        view.total_documents
    );

    // Exactly one terminal record per document: a result XOR an unresolved
    // error
    let rows = sqlx::query("SELECT id FROM tasks WHERE batch_id = ?")
        .bind(&batch_id)
        .fetch_all(&pool)
        .await
        .unwrap();
    for row in rows {
        let doc: String = row.get("id");
        let results: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM results WHERE document_id = ?")
            .bind(&doc)
            .fetch_one(&pool)
            .await
            .unwrap();
        let unresolved: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM error_records WHERE document_id = ? AND resolved = 0",
        )
        .bind(&doc)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(
            results + unresolved,
            1,
            "document {} should have exactly one terminal record",
            doc
        );
    }
}
