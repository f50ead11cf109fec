//! Fleet health monitor.
//!
//! Runs on a fixed interval, entirely outside the document-processing path:
//! a slow cycle or an empty metrics backend never delays batch completion.
//! Each cycle pulls recent samples for every tracked worker-fleet and cache
//! resource, evaluates the fixed threshold rules, and pushes one alert per
//! breach to the configured [`AlertSink`]. Evaluation is stateless — there
//! is no deduplication or suppression here, so a persistent breach re-alerts
//! every cycle.
//!
//! A secondary predictive pass looks at per-hour historical load averages,
//! forecasts the next hour, and produces a scaling recommendation.
//! Recommendations under the confidence floor are report-only.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::metrics;
use crate::models::{Alert, Severity};

// Threshold constants are fixed at the product level; only the evaluation
// window and cadence are configurable.
const ERROR_RATE_MAX: f64 = 0.05;
const DURATION_TIMEOUT_FRACTION: f64 = 0.8;
const MEMORY_PCT_MAX: f64 = 80.0;
const COLD_START_RATE_MAX: f64 = 0.3;
const CACHE_HIT_RATE_MIN_PCT: f64 = 80.0;
const CACHE_MEMORY_WARN_PCT: f64 = 80.0;
const CACHE_MEMORY_CRIT_PCT: f64 = 90.0;
const CACHE_CPU_MAX_PCT: f64 = 75.0;
const CACHE_LATENCY_MAX_MS: f64 = 1.0;
const CACHE_EVICTIONS_MAX: f64 = 10.0;
const CACHE_EVICTION_WINDOW_SECS: i64 = 300;

const FORECAST_CONFIDENCE_WEIGHT: f64 = 0.9;
const FORECAST_RECENT_BUCKETS: usize = 3;
const FORECAST_FULL_CONFIDENCE_BUCKETS: f64 = 6.0;
const CONFIDENCE_FLOOR: f64 = 0.7;
const SCALE_OUT_PEAK_FRACTION: f64 = 0.8;
const SCALE_IN_MEAN_FRACTION: f64 = 0.3;

/// Destination for alert notifications. Alerts are ephemeral — pushing one
/// never mutates pipeline state.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn push(&self, alert: &Alert) -> Result<()>;
}

/// Emits alerts as structured log events (service mode).
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn push(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            Severity::Critical | Severity::High => tracing::error!(
                severity = alert.severity.as_str(),
                subject = %alert.subject,
                "{}",
                alert.message
            ),
            Severity::Medium => tracing::warn!(
                severity = alert.severity.as_str(),
                subject = %alert.subject,
                "{}",
                alert.message
            ),
            Severity::Low => tracing::info!(
                severity = alert.severity.as_str(),
                subject = %alert.subject,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Prints alerts to stdout (`veritor monitor` CLI mode).
pub struct ConsoleAlertSink;

#[async_trait]
impl AlertSink for ConsoleAlertSink {
    async fn push(&self, alert: &Alert) -> Result<()> {
        println!(
            "[{}] {}: {}",
            alert.severity.as_str().to_uppercase(),
            alert.subject,
            alert.message
        );
        Ok(())
    }
}

/// Recent samples for one worker-fleet resource.
#[derive(Debug, Clone, Default)]
pub struct WorkerFleetSnapshot {
    pub resource_id: String,
    pub invocations: f64,
    pub errors: f64,
    pub avg_duration_ms: Option<f64>,
    pub avg_memory_pct: Option<f64>,
    pub cold_starts: f64,
    /// Per-attempt budget in milliseconds, for the duration rule.
    pub timeout_ms: f64,
}

/// Recent samples for one cache resource.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub resource_id: String,
    pub avg_hit_rate_pct: Option<f64>,
    pub avg_memory_pct: Option<f64>,
    pub avg_cpu_pct: Option<f64>,
    pub avg_get_latency_ms: Option<f64>,
    pub avg_set_latency_ms: Option<f64>,
    pub evictions_5m: f64,
}

fn alert(severity: Severity, subject: &str, message: String) -> Alert {
    Alert {
        severity,
        subject: subject.to_string(),
        message,
        timestamp: chrono::Utc::now().timestamp(),
    }
}

/// Evaluate the worker-fleet threshold rules against one snapshot.
pub fn evaluate_worker_rules(snapshot: &WorkerFleetSnapshot) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let subject = snapshot.resource_id.as_str();

    if snapshot.invocations > 0.0 {
        let error_rate = snapshot.errors / snapshot.invocations;
        if error_rate > ERROR_RATE_MAX {
            alerts.push(alert(
                Severity::High,
                subject,
                format!(
                    "Error rate {:.1}% exceeds {:.0}% over the evaluation window",
                    error_rate * 100.0,
                    ERROR_RATE_MAX * 100.0
                ),
            ));
        }

        let cold_start_rate = snapshot.cold_starts / snapshot.invocations;
        if cold_start_rate > COLD_START_RATE_MAX {
            alerts.push(alert(
                Severity::Medium,
                subject,
                format!(
                    "Cold-start rate {:.1}% exceeds {:.0}%",
                    cold_start_rate * 100.0,
                    COLD_START_RATE_MAX * 100.0
                ),
            ));
        }
    }

    if let Some(avg_ms) = snapshot.avg_duration_ms {
        if snapshot.timeout_ms > 0.0 && avg_ms > snapshot.timeout_ms * DURATION_TIMEOUT_FRACTION {
            alerts.push(alert(
                Severity::Medium,
                subject,
                format!(
                    "Average duration {:.0}ms exceeds {:.0}% of the {:.0}ms timeout",
                    avg_ms,
                    DURATION_TIMEOUT_FRACTION * 100.0,
                    snapshot.timeout_ms
                ),
            ));
        }
    }

    if let Some(memory_pct) = snapshot.avg_memory_pct {
        if memory_pct > MEMORY_PCT_MAX {
            alerts.push(alert(
                Severity::High,
                subject,
                format!(
                    "Memory utilization {:.1}% exceeds {:.0}%",
                    memory_pct, MEMORY_PCT_MAX
                ),
            ));
        }
    }

    alerts
}

/// Evaluate the cache-layer threshold rules against one snapshot.
pub fn evaluate_cache_rules(snapshot: &CacheSnapshot) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let subject = snapshot.resource_id.as_str();

    if let Some(hit_rate) = snapshot.avg_hit_rate_pct {
        if hit_rate < CACHE_HIT_RATE_MIN_PCT {
            alerts.push(alert(
                Severity::Medium,
                subject,
                format!(
                    "Cache hit rate {:.1}% below {:.0}%",
                    hit_rate, CACHE_HIT_RATE_MIN_PCT
                ),
            ));
        }
    }

    if let Some(memory_pct) = snapshot.avg_memory_pct {
        if memory_pct > CACHE_MEMORY_CRIT_PCT {
            alerts.push(alert(
                Severity::Critical,
                subject,
                format!(
                    "Cache memory usage {:.1}% exceeds {:.0}%",
                    memory_pct, CACHE_MEMORY_CRIT_PCT
                ),
            ));
        } else if memory_pct > CACHE_MEMORY_WARN_PCT {
            alerts.push(alert(
                Severity::Medium,
                subject,
                format!(
                    "Cache memory usage {:.1}% exceeds {:.0}%",
                    memory_pct, CACHE_MEMORY_WARN_PCT
                ),
            ));
        }
    }

    if let Some(cpu_pct) = snapshot.avg_cpu_pct {
        if cpu_pct > CACHE_CPU_MAX_PCT {
            alerts.push(alert(
                Severity::High,
                subject,
                format!("Cache CPU {:.1}% exceeds {:.0}%", cpu_pct, CACHE_CPU_MAX_PCT),
            ));
        }
    }

    for (op, latency) in [
        ("get", snapshot.avg_get_latency_ms),
        ("set", snapshot.avg_set_latency_ms),
    ] {
        if let Some(ms) = latency {
            if ms > CACHE_LATENCY_MAX_MS {
                alerts.push(alert(
                    Severity::Low,
                    subject,
                    format!(
                        "Cache {} latency {:.2}ms exceeds {:.0}ms",
                        op, ms, CACHE_LATENCY_MAX_MS
                    ),
                ));
            }
        }
    }

    if snapshot.evictions_5m > CACHE_EVICTIONS_MAX {
        alerts.push(alert(
            Severity::Medium,
            subject,
            format!(
                "{:.0} cache evictions in the last 5 minutes exceeds {:.0}",
                snapshot.evictions_5m, CACHE_EVICTIONS_MAX
            ),
        ));
    }

    alerts
}

/// Next-hour load forecast over per-hour averages.
#[derive(Debug, Clone, Copy)]
pub struct LoadForecast {
    pub next_hour: f64,
    pub recent_mean: f64,
    pub overall_mean: f64,
    pub observed_peak: f64,
    pub confidence: f64,
}

/// Forecast next-hour load from hourly buckets (oldest first). Simple
/// trend-adjusted recent mean; confidence scales with history depth under a
/// fixed weighting.
pub fn forecast_load(buckets: &[(i64, f64)]) -> Option<LoadForecast> {
    if buckets.is_empty() {
        return None;
    }

    let values: Vec<f64> = buckets.iter().map(|(_, v)| *v).collect();
    let overall_mean = values.iter().sum::<f64>() / values.len() as f64;
    let recent: &[f64] = if values.len() > FORECAST_RECENT_BUCKETS {
        &values[values.len() - FORECAST_RECENT_BUCKETS..]
    } else {
        &values
    };
    let recent_mean = recent.iter().sum::<f64>() / recent.len() as f64;
    let observed_peak = values.iter().cloned().fold(f64::MIN, f64::max);

    let trend = recent_mean - overall_mean;
    let next_hour = (recent_mean + trend).max(0.0);

    let depth = (values.len() as f64 / FORECAST_FULL_CONFIDENCE_BUCKETS).min(1.0);
    let confidence = FORECAST_CONFIDENCE_WEIGHT * depth;

    Some(LoadForecast {
        next_hour,
        recent_mean,
        overall_mean,
        observed_peak,
        confidence,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    Out,
    In,
    Hold,
}

impl ScaleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleAction::Out => "scale-out",
            ScaleAction::In => "scale-in",
            ScaleAction::Hold => "hold",
        }
    }
}

/// A scaling recommendation. `applied` is only set when confidence clears
/// the floor; below it the recommendation is reported, never acted on.
#[derive(Debug, Clone)]
pub struct ScalingRecommendation {
    pub resource_id: String,
    pub action: ScaleAction,
    pub forecast_per_hour: f64,
    pub confidence: f64,
    pub applied: bool,
    pub reason: String,
}

/// Turn a forecast into a recommendation for one fleet resource.
pub fn recommend_scaling(resource_id: &str, forecast: &LoadForecast) -> ScalingRecommendation {
    let action = if forecast.observed_peak > 0.0
        && forecast.next_hour > forecast.observed_peak * SCALE_OUT_PEAK_FRACTION
    {
        ScaleAction::Out
    } else if forecast.overall_mean > 0.0
        && forecast.next_hour < forecast.overall_mean * SCALE_IN_MEAN_FRACTION
    {
        ScaleAction::In
    } else {
        ScaleAction::Hold
    };

    let applied = action != ScaleAction::Hold && forecast.confidence >= CONFIDENCE_FLOOR;

    let reason = format!(
        "forecast {:.1}/h vs recent {:.1}/h, overall {:.1}/h, peak {:.1}/h (confidence {:.2})",
        forecast.next_hour,
        forecast.recent_mean,
        forecast.overall_mean,
        forecast.observed_peak,
        forecast.confidence
    );

    ScalingRecommendation {
        resource_id: resource_id.to_string(),
        action,
        forecast_per_hour: forecast.next_hour,
        confidence: forecast.confidence,
        applied,
        reason,
    }
}

/// Output of one monitor cycle.
#[derive(Debug)]
pub struct MonitorReport {
    pub alerts: Vec<Alert>,
    pub recommendations: Vec<ScalingRecommendation>,
}

async fn gather_worker_snapshot(
    pool: &SqlitePool,
    resource_id: &str,
    since_ts: i64,
    timeout_ms: f64,
) -> Result<WorkerFleetSnapshot> {
    let invocations = metrics::window_stats(pool, "worker.invocations", resource_id, since_ts)
        .await?
        .map(|s| s.sum)
        .unwrap_or(0.0);
    let errors = metrics::window_stats(pool, "worker.errors", resource_id, since_ts)
        .await?
        .map(|s| s.sum)
        .unwrap_or(0.0);
    let avg_duration_ms = metrics::window_stats(pool, "worker.duration_ms", resource_id, since_ts)
        .await?
        .map(|s| s.avg);
    let avg_memory_pct = metrics::window_stats(pool, "worker.memory_pct", resource_id, since_ts)
        .await?
        .map(|s| s.avg);
    let cold_starts = metrics::window_stats(pool, "worker.cold_start", resource_id, since_ts)
        .await?
        .map(|s| s.sum)
        .unwrap_or(0.0);

    Ok(WorkerFleetSnapshot {
        resource_id: resource_id.to_string(),
        invocations,
        errors,
        avg_duration_ms,
        avg_memory_pct,
        cold_starts,
        timeout_ms,
    })
}

async fn gather_cache_snapshot(
    pool: &SqlitePool,
    resource_id: &str,
    since_ts: i64,
    now_ts: i64,
) -> Result<CacheSnapshot> {
    let avg = |stats: Option<metrics::SeriesStats>| stats.map(|s| s.avg);

    Ok(CacheSnapshot {
        resource_id: resource_id.to_string(),
        avg_hit_rate_pct: avg(
            metrics::window_stats(pool, "cache.hit_rate", resource_id, since_ts).await?,
        ),
        avg_memory_pct: avg(
            metrics::window_stats(pool, "cache.memory_pct", resource_id, since_ts).await?,
        ),
        avg_cpu_pct: avg(
            metrics::window_stats(pool, "cache.cpu_pct", resource_id, since_ts).await?,
        ),
        avg_get_latency_ms: avg(
            metrics::window_stats(pool, "cache.get_latency_ms", resource_id, since_ts).await?,
        ),
        avg_set_latency_ms: avg(
            metrics::window_stats(pool, "cache.set_latency_ms", resource_id, since_ts).await?,
        ),
        evictions_5m: metrics::window_stats(
            pool,
            "cache.evictions",
            resource_id,
            now_ts - CACHE_EVICTION_WINDOW_SECS,
        )
        .await?
        .map(|s| s.sum)
        .unwrap_or(0.0),
    })
}

/// Run one evaluation cycle: gather snapshots, evaluate thresholds, push
/// alerts, and produce scaling recommendations.
pub async fn run_cycle(
    pool: &SqlitePool,
    config: &Config,
    sink: &dyn AlertSink,
) -> Result<MonitorReport> {
    let monitor = &config.monitor;
    let now = chrono::Utc::now().timestamp();
    let since = now - monitor.window_minutes * 60;
    let timeout_ms = config.worker.task_timeout_secs as f64 * 1000.0;

    let mut alerts = Vec::new();
    let mut recommendations = Vec::new();

    for resource_id in &monitor.worker_resources {
        let snapshot = gather_worker_snapshot(pool, resource_id, since, timeout_ms).await?;
        alerts.extend(evaluate_worker_rules(&snapshot));

        let history_since = now - monitor.history_hours * 3600;
        let buckets =
            metrics::hourly_averages(pool, "worker.invocations", resource_id, history_since)
                .await?;
        if let Some(forecast) = forecast_load(&buckets) {
            recommendations.push(recommend_scaling(resource_id, &forecast));
        }
    }

    for resource_id in &monitor.cache_resources {
        let snapshot = gather_cache_snapshot(pool, resource_id, since, now).await?;
        alerts.extend(evaluate_cache_rules(&snapshot));
    }

    for alert in &alerts {
        sink.push(alert).await?;
    }

    for rec in &recommendations {
        tracing::info!(
            resource = %rec.resource_id,
            action = rec.action.as_str(),
            confidence = rec.confidence,
            applied = rec.applied,
            "Scaling recommendation: {}",
            rec.reason
        );
    }

    Ok(MonitorReport {
        alerts,
        recommendations,
    })
}

/// Run the monitor on its fixed interval until shutdown. Cycle failures are
/// logged, never propagated — the monitor is self-contained by design
/// requirement and must not take anything else down with it.
pub async fn run_monitor(pool: &SqlitePool, config: &Config, sink: &dyn AlertSink) -> Result<()> {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(config.monitor.interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(
        interval_secs = config.monitor.interval_secs,
        "Fleet health monitor started"
    );

    loop {
        interval.tick().await;
        match run_cycle(pool, config, sink).await {
            Ok(report) => {
                tracing::debug!(
                    alerts = report.alerts.len(),
                    recommendations = report.recommendations.len(),
                    "Monitor cycle complete"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Monitor cycle failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_snapshot() -> CacheSnapshot {
        CacheSnapshot {
            resource_id: "cache".to_string(),
            ..CacheSnapshot::default()
        }
    }

    #[test]
    fn low_hit_rate_produces_exactly_one_medium_alert() {
        let mut snapshot = cache_snapshot();
        snapshot.avg_hit_rate_pct = Some(60.0);

        let alerts = evaluate_cache_rules(&snapshot);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Medium);
        assert!(alerts[0].message.contains("hit rate"));
    }

    #[test]
    fn healthy_hit_rate_produces_no_alert() {
        let mut snapshot = cache_snapshot();
        snapshot.avg_hit_rate_pct = Some(85.0);

        assert!(evaluate_cache_rules(&snapshot).is_empty());
    }

    #[test]
    fn cache_memory_tiers() {
        let mut snapshot = cache_snapshot();
        snapshot.avg_memory_pct = Some(85.0);
        let warn = evaluate_cache_rules(&snapshot);
        assert_eq!(warn.len(), 1);
        assert_eq!(warn[0].severity, Severity::Medium);

        snapshot.avg_memory_pct = Some(95.0);
        let crit = evaluate_cache_rules(&snapshot);
        assert_eq!(crit.len(), 1);
        assert_eq!(crit[0].severity, Severity::Critical);
    }

    #[test]
    fn cache_latency_and_evictions() {
        let mut snapshot = cache_snapshot();
        snapshot.avg_get_latency_ms = Some(2.5);
        snapshot.evictions_5m = 25.0;

        let alerts = evaluate_cache_rules(&snapshot);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].severity, Severity::Low);
        assert_eq!(alerts[1].severity, Severity::Medium);
    }

    #[test]
    fn worker_error_rate_rule() {
        let snapshot = WorkerFleetSnapshot {
            resource_id: "worker-fleet".to_string(),
            invocations: 100.0,
            errors: 12.0,
            timeout_ms: 90_000.0,
            ..WorkerFleetSnapshot::default()
        };

        let alerts = evaluate_worker_rules(&snapshot);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::High);
        assert!(alerts[0].message.contains("Error rate"));
    }

    #[test]
    fn worker_duration_rule_uses_timeout_fraction() {
        let snapshot = WorkerFleetSnapshot {
            resource_id: "worker-fleet".to_string(),
            invocations: 10.0,
            avg_duration_ms: Some(80_000.0),
            timeout_ms: 90_000.0,
            ..WorkerFleetSnapshot::default()
        };

        // 80s > 0.8 × 90s = 72s
        let alerts = evaluate_worker_rules(&snapshot);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Medium);
    }

    #[test]
    fn quiet_fleet_produces_no_alerts() {
        let snapshot = WorkerFleetSnapshot {
            resource_id: "worker-fleet".to_string(),
            timeout_ms: 90_000.0,
            ..WorkerFleetSnapshot::default()
        };
        assert!(evaluate_worker_rules(&snapshot).is_empty());
    }

    #[test]
    fn forecast_needs_history_for_confidence() {
        let shallow: Vec<(i64, f64)> = (0..2).map(|h| (h * 3600, 100.0)).collect();
        let forecast = forecast_load(&shallow).unwrap();
        assert!(forecast.confidence < CONFIDENCE_FLOOR);

        let deep: Vec<(i64, f64)> = (0..8).map(|h| (h * 3600, 100.0)).collect();
        let forecast = forecast_load(&deep).unwrap();
        assert!(forecast.confidence >= CONFIDENCE_FLOOR);
    }

    #[test]
    fn rising_load_recommends_scale_out_when_confident() {
        let buckets: Vec<(i64, f64)> = [10.0, 12.0, 11.0, 20.0, 40.0, 60.0, 80.0, 100.0]
            .iter()
            .enumerate()
            .map(|(h, v)| ((h as i64) * 3600, *v))
            .collect();

        let forecast = forecast_load(&buckets).unwrap();
        let rec = recommend_scaling("worker-fleet", &forecast);
        assert_eq!(rec.action, ScaleAction::Out);
        assert!(rec.applied);
    }

    #[test]
    fn low_confidence_recommendation_is_report_only() {
        let buckets: Vec<(i64, f64)> = [10.0, 50.0, 100.0]
            .iter()
            .enumerate()
            .map(|(h, v)| ((h as i64) * 3600, *v))
            .collect();

        let forecast = forecast_load(&buckets).unwrap();
        assert!(forecast.confidence < CONFIDENCE_FLOOR);
        let rec = recommend_scaling("worker-fleet", &forecast);
        assert!(!rec.applied, "below-floor recommendation must not apply");
    }

    #[test]
    fn idle_history_recommends_scale_in() {
        let buckets: Vec<(i64, f64)> = [100.0, 100.0, 100.0, 100.0, 100.0, 5.0, 5.0, 5.0]
            .iter()
            .enumerate()
            .map(|(h, v)| ((h as i64) * 3600, *v))
            .collect();

        let forecast = forecast_load(&buckets).unwrap();
        let rec = recommend_scaling("worker-fleet", &forecast);
        assert_eq!(rec.action, ScaleAction::In);
    }

    #[test]
    fn empty_history_has_no_forecast() {
        assert!(forecast_load(&[]).is_none());
    }
}
