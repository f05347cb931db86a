//! Batch job records.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::executor::ExecutorConfig;
use crate::output::OutputFormat;
use crate::parser::InputFormat;
use crate::task::TaskStatus;

/// Overall status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl BatchStatus {
    /// Completed, failed and cancelled batches are finished. A finished batch
    /// can still be resumed unless it completed.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_resumable(self) -> bool {
        self != Self::Completed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchCounts {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Tasks not yet in a terminal state.
    pub fn pending(&self) -> usize {
        self.total
            .saturating_sub(self.succeeded + self.failed + self.cancelled)
    }

    pub fn terminal(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }

    /// Count a task that just reached `status`.
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Succeeded => self.succeeded += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            _ => {}
        }
    }

    /// Rebuild counts from a set of task statuses.
    pub fn tally<I: IntoIterator<Item = TaskStatus>>(statuses: I) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            counts.total += 1;
            counts.record(status);
        }
        counts
    }

    /// `succeeded + failed + cancelled` never exceeds the total.
    pub fn is_consistent(&self) -> bool {
        self.terminal() <= self.total
    }
}

/// A persisted batch: what was asked for and where it stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    /// Input file the tasks were parsed from.
    pub source: PathBuf,
    pub input_format: InputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,
    #[serde(default)]
    pub strict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_prompts: Option<usize>,
    #[serde(default)]
    pub settings: ExecutorConfig,
    pub status: BatchStatus,
    pub counts: BatchCounts,
    #[serde(default)]
    pub parse_errors: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl BatchJob {
    pub fn new(
        source: impl Into<PathBuf>,
        input_format: InputFormat,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: new_batch_id(),
            source: source.into(),
            input_format,
            template: None,
            model: model.into(),
            system_prompt: None,
            output_path: None,
            output_format: None,
            strict: false,
            max_prompts: None,
            settings: ExecutorConfig::default(),
            status: BatchStatus::Pending,
            counts: BatchCounts::default(),
            parse_errors: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }

    /// Identifier prefix shown in listings.
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }

    pub fn mark_running(&mut self) {
        self.status = BatchStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
        self.completed_at = None;
        self.last_error = None;
    }

    pub fn mark_finished(&mut self, status: BatchStatus) {
        self.status = status;
        if status.is_finished() {
            self.completed_at = Some(Utc::now());
        }
    }

    /// Fraction of tasks in a terminal state, 0.0 to 100.0.
    pub fn progress_percent(&self) -> f64 {
        if self.counts.total == 0 {
            return 100.0;
        }
        self.counts.terminal() as f64 / self.counts.total as f64 * 100.0
    }
}

/// Generate a new batch identifier.
pub fn new_batch_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_pending_and_consistency() {
        let mut counts = BatchCounts::new(5);
        counts.record(TaskStatus::Succeeded);
        counts.record(TaskStatus::Failed);
        counts.record(TaskStatus::InFlight);
        assert_eq!(counts.pending(), 3);
        assert!(counts.is_consistent());
        assert_eq!(
            counts.succeeded + counts.failed + counts.cancelled + counts.pending(),
            counts.total
        );
    }

    #[test]
    fn test_tally() {
        let counts = BatchCounts::tally([
            TaskStatus::Succeeded,
            TaskStatus::Queued,
            TaskStatus::Cancelled,
        ]);
        assert_eq!(counts.total, 3);
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.cancelled, 1);
        assert_eq!(counts.pending(), 1);
    }

    #[test]
    fn test_job_lifecycle_timestamps() {
        let mut job = BatchJob::new("prompts.csv", InputFormat::Csv, "echo");
        assert_eq!(job.status, BatchStatus::Pending);
        assert_eq!(job.short_id().len(), 8);

        job.mark_running();
        let started = job.started_at;
        assert!(started.is_some());

        job.mark_finished(BatchStatus::Paused);
        assert!(job.completed_at.is_none());

        job.mark_running();
        assert_eq!(job.started_at, started);
        job.mark_finished(BatchStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(!job.status.is_resumable());
    }

    #[test]
    fn test_job_round_trips_through_json() {
        let mut job = BatchJob::new("in.jsonl", InputFormat::Jsonl, "gpt-4o-mini");
        job.template = Some("Q: {q}".to_string());
        job.counts = BatchCounts::new(2);
        let json = serde_json::to_string_pretty(&job).unwrap();
        assert!(json.contains("\"status\": \"pending\""));
        let back: BatchJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
