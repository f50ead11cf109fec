//! Database statistics and pipeline overview.
//!
//! Provides a quick summary of pipeline state: batch counts by status,
//! document and result totals, unresolved errors by category, and metric
//! sample counts. Used by `veritor stats` to give confidence that workers
//! and the monitor are keeping up.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::queue;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_batches: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batches")
        .fetch_one(&pool)
        .await?;
    let total_tasks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
        .fetch_one(&pool)
        .await?;
    let total_results: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM results")
        .fetch_one(&pool)
        .await?;
    let fallback_results: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM results WHERE fallback = 1")
            .fetch_one(&pool)
            .await?;
    let metric_samples: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metrics")
        .fetch_one(&pool)
        .await?;
    let outstanding = queue::outstanding_count(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Veritor — Pipeline Stats");
    println!("========================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!();
    println!("  Batches:      {}", total_batches);
    println!("  Documents:    {}", total_tasks);
    println!(
        "  Results:      {} ({} heuristic fallback)",
        total_results, fallback_results
    );
    println!("  Outstanding:  {} dispatches", outstanding);
    println!("  Metrics:      {} samples", metric_samples);

    // Batches by status
    let status_rows = sqlx::query(
        "SELECT status, COUNT(*) AS count FROM batches GROUP BY status ORDER BY count DESC",
    )
    .fetch_all(&pool)
    .await?;

    if !status_rows.is_empty() {
        println!();
        println!("  Batches by status:");
        for row in &status_rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            println!("    {:<12} {:>6}", status, count);
        }
    }

    // Stuck documents need an operator
    let intervene_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE state = 'intervene'")
            .fetch_one(&pool)
            .await?;
    if intervene_count > 0 {
        println!();
        println!(
            "  NEEDS ATTENTION: {} document(s) awaiting manual intervention",
            intervene_count
        );
    }

    // Unresolved errors by category
    let error_rows = sqlx::query(
        r#"
        SELECT category, COUNT(*) AS count FROM error_records
        WHERE resolved = 0
        GROUP BY category ORDER BY count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if !error_rows.is_empty() {
        println!();
        println!("  Unresolved errors:");
        println!("    {:<24} {:>6}", "CATEGORY", "COUNT");
        println!("    {}", "-".repeat(32));
        for row in &error_rows {
            let category: String = row.get("category");
            let count: i64 = row.get("count");
            println!("    {:<24} {:>6}", category, count);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
