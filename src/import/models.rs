// ABOUTME: Observable state of an import run: status, progress, errors, logs, summary
// ABOUTME: Everything here is serializable so callers can render or persist it

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::classify::{ErrorCategory, ErrorSeverity};
use super::metrics::ImportMetrics;

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Schema,
    Data,
    Constraints,
    Indexes,
    Functions,
    Policies,
    /// File-order runs execute everything as one phase.
    Other,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Schema => "schema",
            Phase::Data => "data",
            Phase::Constraints => "constraints",
            Phase::Indexes => "indexes",
            Phase::Functions => "functions",
            Phase::Policies => "policies",
            Phase::Other => "other",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Idle,
    Parsing,
    Validating,
    Executing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Idle => "idle",
            ImportStatus::Parsing => "parsing",
            ImportStatus::Validating => "validating",
            ImportStatus::Executing => "executing",
            ImportStatus::Paused => "paused",
            ImportStatus::Completed => "completed",
            ImportStatus::Failed => "failed",
            ImportStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_start(&self) -> bool {
        matches!(
            self,
            ImportStatus::Idle
                | ImportStatus::Completed
                | ImportStatus::Failed
                | ImportStatus::Cancelled
        )
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, ImportStatus::Executing)
    }

    pub fn can_resume(&self) -> bool {
        matches!(self, ImportStatus::Paused)
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self, ImportStatus::Executing | ImportStatus::Paused)
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live progress of the active run.
///
/// `statements_executed + statements_failed` never exceeds `total_statements`
/// and both counters only grow during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub current_batch: usize,
    pub total_batches: usize,
    pub statements_executed: usize,
    pub statements_failed: usize,
    pub total_statements: usize,
    pub current_phase: Option<Phase>,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: u64,
    pub bytes_processed: u64,
    pub total_bytes: u64,
}

impl ImportProgress {
    pub fn statements_done(&self) -> usize {
        self.statements_executed + self.statements_failed
    }

    pub fn statements_remaining(&self) -> usize {
        self.total_statements.saturating_sub(self.statements_done())
    }

    /// Adds batch counts, clamped so the done count never passes the total.
    pub(crate) fn record(&mut self, executed: usize, failed: usize) {
        let executed = executed.min(self.statements_remaining());
        self.statements_executed += executed;
        let failed = failed.min(self.statements_remaining());
        self.statements_failed += failed;
    }

    /// Throughput is measured on successfully executed statements only.
    pub(crate) fn update_timing(&mut self, elapsed_ms: u64) {
        self.elapsed_ms = elapsed_ms;
        let throughput = self.statements_executed as f64 / elapsed_ms.max(1) as f64;
        self.estimated_remaining_ms = if throughput > 0.0 {
            (self.statements_remaining() as f64 / throughput).round() as u64
        } else {
            0
        };
    }
}

/// One failed statement. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportError {
    /// Position within the phase's statement list.
    pub index: usize,
    pub statement: String,
    pub error: String,
    pub timestamp: i64,
    pub phase: Phase,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportLog {
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
    Success,
    Partial,
    Failed,
}

impl SummaryStatus {
    pub fn from_counts(executed: usize, failed: usize) -> Self {
        if failed == 0 {
            SummaryStatus::Success
        } else if executed > 0 {
            SummaryStatus::Partial
        } else {
            SummaryStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCounts {
    pub executed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub status: SummaryStatus,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: i64,
    pub statements_executed: usize,
    pub statements_failed: usize,
    pub errors: Vec<ImportError>,
    pub phases: BTreeMap<Phase, PhaseCounts>,
    pub metrics: ImportMetrics,
}

/// A batch that had at least one failure, kept for a later re-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedBatch {
    pub phase: Phase,
    pub batch_index: usize,
    pub statements: Vec<String>,
    pub failed_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_follow_status() {
        assert!(ImportStatus::Idle.can_start());
        assert!(ImportStatus::Cancelled.can_start());
        assert!(!ImportStatus::Executing.can_start());
        assert!(!ImportStatus::Paused.can_start());

        assert!(ImportStatus::Executing.can_pause());
        assert!(!ImportStatus::Paused.can_pause());
        assert!(ImportStatus::Paused.can_resume());
        assert!(ImportStatus::Paused.can_cancel());
        assert!(!ImportStatus::Completed.can_cancel());
    }

    #[test]
    fn test_summary_status_from_counts() {
        assert_eq!(SummaryStatus::from_counts(10, 0), SummaryStatus::Success);
        assert_eq!(SummaryStatus::from_counts(0, 0), SummaryStatus::Success);
        assert_eq!(SummaryStatus::from_counts(10, 1), SummaryStatus::Partial);
        assert_eq!(SummaryStatus::from_counts(0, 3), SummaryStatus::Failed);
    }

    #[test]
    fn test_progress_never_exceeds_total() {
        let mut progress = ImportProgress {
            total_statements: 10,
            ..Default::default()
        };
        progress.record(8, 0);
        progress.record(5, 5);
        assert_eq!(progress.statements_executed, 10);
        assert_eq!(progress.statements_failed, 0);
        assert_eq!(progress.statements_remaining(), 0);
    }

    #[test]
    fn test_remaining_estimate_guards_zero_throughput() {
        let mut progress = ImportProgress {
            total_statements: 100,
            ..Default::default()
        };
        progress.record(0, 10);
        progress.update_timing(500);
        assert_eq!(progress.estimated_remaining_ms, 0);

        progress.record(40, 0);
        progress.update_timing(1000);
        // 40 stmts/s over the remaining 50
        assert_eq!(progress.estimated_remaining_ms, 1250);
    }

    #[test]
    fn test_phase_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Phase::Constraints).unwrap(), "\"constraints\"");
        assert_eq!(Phase::Other.to_string(), "other");
    }
}
