//! Core data models used throughout Veritor.
//!
//! These types represent the batches, document tasks, verdicts, and error
//! records that flow through the analysis pipeline, plus the health metrics
//! and alerts consumed by the fleet monitor.

use serde::{Deserialize, Serialize};

/// Lifecycle of a batch. Transitions only move forward; `finalizing` is the
/// short-lived guard state the aggregator claims before writing the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Finalizing => "finalizing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BatchStatus::Pending),
            "processing" => Some(BatchStatus::Processing),
            "finalizing" => Some(BatchStatus::Finalizing),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            "cancelled" => Some(BatchStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses accept no further counter or status mutation;
    /// late worker completions against them are ignored.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

/// A client-submitted batch of documents analyzed together.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: String,
    pub owner_id: String,
    pub total_documents: i64,
    pub processed_count: i64,
    pub failed_count: i64,
    pub status: BatchStatus,
    pub summary: Option<BatchSummary>,
    pub report_ref: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// Aggregate statistics written onto the batch at finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub average_accuracy: f64,
    pub total_flags: i64,
    pub risk_histogram: RiskHistogram,
    pub average_processing_time_ms: f64,
    pub total_processing_time_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskHistogram {
    pub low: i64,
    pub medium: i64,
    pub high: i64,
    pub critical: i64,
}

impl RiskHistogram {
    pub fn bump(&mut self, level: RiskLevel) {
        match level {
            RiskLevel::Low => self.low += 1,
            RiskLevel::Medium => self.medium += 1,
            RiskLevel::High => self.high += 1,
            RiskLevel::Critical => self.critical += 1,
        }
    }
}

/// Risk classification derived from an accuracy score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Fixed product-level mapping, boundaries inclusive on the lower side:
    /// `>90 → low`, `80–90 → medium`, `70–80 → high`, `<70 → critical`.
    pub fn from_accuracy(accuracy: f64) -> Self {
        if accuracy > 90.0 {
            RiskLevel::Low
        } else if accuracy >= 80.0 {
            RiskLevel::Medium
        } else if accuracy >= 70.0 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

/// Per-document state within a batch. `intervene` is the explicit stuck
/// state for failures that need an operator; such documents keep the batch
/// from finalizing without counting as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Processing,
    Completed,
    Failed,
    Intervene,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Processing => "processing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Intervene => "intervene",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskState::Queued),
            "processing" => Some(TaskState::Processing),
            "completed" => Some(TaskState::Completed),
            "failed" => Some(TaskState::Failed),
            "intervene" => Some(TaskState::Intervene),
            _ => None,
        }
    }
}

/// One logical document task. Created once at submission; `attempt` tracks
/// the latest dispatched attempt (retries re-dispatch with attempt + 1, the
/// earlier attempts' outcomes are retained for audit).
#[derive(Debug, Clone)]
pub struct DocumentTask {
    pub id: String,
    pub batch_id: String,
    pub owner_id: String,
    pub content_ref: String,
    pub filename: Option<String>,
    pub attempt: i64,
    pub state: TaskState,
    pub created_at: i64,
}

/// A span of content flagged by the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flag {
    pub excerpt: String,
    pub reason: String,
}

/// Where a verdict came from. Heuristic verdicts are a degraded-mode signal
/// and are never presented as equivalent-confidence output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Model,
    Heuristic,
}

/// Structured verification output for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Accuracy score in `[0, 100]`.
    pub accuracy: f64,
    pub risk_level: RiskLevel,
    pub flags: Vec<Flag>,
    pub verification_sources: i64,
    pub processing_time_ms: i64,
    pub source: VerdictSource,
}

/// Persisted analysis result. Immutable once written; one exists per
/// successful attempt.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub id: String,
    pub document_id: String,
    pub batch_id: String,
    pub attempt: i64,
    pub accuracy: f64,
    pub risk_level: RiskLevel,
    pub flags: Vec<Flag>,
    pub verification_sources: i64,
    pub processing_time_ms: i64,
    pub fallback: bool,
    pub created_at: i64,
}

/// Shared severity scale for alerts and error records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// Persisted record of one failed attempt.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub id: String,
    pub batch_id: String,
    pub document_id: String,
    pub attempt: i64,
    pub category: String,
    pub severity: Severity,
    pub message: String,
    pub recoverable: bool,
    pub retryable: bool,
    pub retry_delay_ms: Option<i64>,
    pub max_retries: Option<i64>,
    pub resolved: bool,
    pub created_at: i64,
}

/// A single time-series sample pushed to the metrics store.
#[derive(Debug, Clone)]
pub struct HealthMetric {
    pub metric: String,
    pub value: f64,
    pub unit: String,
    pub resource_id: String,
    pub recorded_at: i64,
}

/// An ephemeral notification produced by the fleet monitor. Alerts never
/// gate pipeline progress.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub subject: String,
    pub message: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_mapping_boundaries() {
        assert_eq!(RiskLevel::from_accuracy(95.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_accuracy(90.1), RiskLevel::Low);
        // 90 belongs to the 80–90 band (inclusive on the lower side)
        assert_eq!(RiskLevel::from_accuracy(90.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_accuracy(82.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_accuracy(80.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_accuracy(79.9), RiskLevel::High);
        assert_eq!(RiskLevel::from_accuracy(70.0), RiskLevel::High);
        assert_eq!(RiskLevel::from_accuracy(69.9), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_accuracy(60.0), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_accuracy(0.0), RiskLevel::Critical);
    }

    #[test]
    fn risk_mapping_is_monotonic() {
        fn rank(level: RiskLevel) -> u8 {
            match level {
                RiskLevel::Critical => 0,
                RiskLevel::High => 1,
                RiskLevel::Medium => 2,
                RiskLevel::Low => 3,
            }
        }

        let mut prev = rank(RiskLevel::from_accuracy(0.0));
        let mut acc = 0.0f64;
        while acc <= 100.0 {
            let cur = rank(RiskLevel::from_accuracy(acc));
            assert!(cur >= prev, "risk rank regressed at accuracy {}", acc);
            prev = cur;
            acc += 0.5;
        }
    }

    #[test]
    fn batch_status_roundtrip() {
        for status in [
            BatchStatus::Pending,
            BatchStatus::Processing,
            BatchStatus::Finalizing,
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Cancelled,
        ] {
            assert_eq!(BatchStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BatchStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!BatchStatus::Pending.is_terminal());
        assert!(!BatchStatus::Processing.is_terminal());
        assert!(!BatchStatus::Finalizing.is_terminal());
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::Cancelled.is_terminal());
    }
}
