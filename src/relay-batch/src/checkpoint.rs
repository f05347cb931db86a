//! Durable per-batch progress.
//!
//! Two files live in the batch directory:
//! - `journal.jsonl`: one [`TaskRecord`] per line, appended in batches. A
//!   later record for the same sequence supersedes an earlier one.
//! - `checkpoint.json`: the contiguous marker, rewritten atomically after
//!   every journal flush.
//!
//! The marker covers the longest prefix `1..=n` of succeeded tasks. It never
//! moves backwards within a batch.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{BatchError, Result};
use crate::fs_util::atomic_write;
use crate::task::{TaskResult, TaskStatus};

pub const JOURNAL_FILE: &str = "journal.jsonl";
pub const MARKER_FILE: &str = "checkpoint.json";

/// Terminal state of one task as written to the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub seq: u64,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

/// The marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMarker {
    pub batch_id: String,
    pub last_contiguous: u64,
    pub updated_at: DateTime<Utc>,
}

/// Everything read back from disk at resume time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub batch_id: String,
    pub last_contiguous: u64,
    pub tasks: BTreeMap<u64, TaskRecord>,
}

impl Checkpoint {
    pub fn status_of(&self, seq: u64) -> Option<TaskStatus> {
        self.tasks.get(&seq).map(|r| r.status)
    }

    /// Records of tasks that must not run again.
    pub fn succeeded(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks
            .values()
            .filter(|r| r.status == TaskStatus::Succeeded)
    }
}

/// Debounce policy for journal writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushPolicy {
    /// Flush once this many records are pending.
    pub every: usize,
    /// Flush once the oldest pending record is this old.
    pub interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            every: 16,
            interval: Duration::from_secs(2),
        }
    }
}

/// Tracks the longest prefix of completed sequence numbers.
#[derive(Debug, Clone, Default)]
pub struct ContiguousTracker {
    last: u64,
    ahead: BTreeSet<u64>,
}

impl ContiguousTracker {
    pub fn new(last: u64) -> Self {
        Self {
            last,
            ahead: BTreeSet::new(),
        }
    }

    /// Start from every sequence already known to be done.
    pub fn from_done<I: IntoIterator<Item = u64>>(done: I) -> Self {
        let mut tracker = Self::default();
        for seq in done {
            tracker.mark(seq);
        }
        tracker
    }

    /// Mark `seq` done. Returns true when the marker moved.
    pub fn mark(&mut self, seq: u64) -> bool {
        if seq <= self.last {
            return false;
        }
        self.ahead.insert(seq);
        let before = self.last;
        while self.ahead.remove(&(self.last + 1)) {
            self.last += 1;
        }
        self.last > before
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

/// On-disk checkpoint for one batch.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    batch_id: String,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, batch_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            batch_id: batch_id.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(MARKER_FILE)
    }

    pub fn exists(&self) -> bool {
        self.journal_path().exists() || self.marker_path().exists()
    }

    /// Read the marker file alone.
    pub async fn load_marker(&self) -> Result<Option<CheckpointMarker>> {
        let path = self.marker_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        let marker: CheckpointMarker = serde_json::from_str(&content)
            .map_err(|e| BatchError::Corrupted(format!("{}: {e}", path.display())))?;
        if marker.batch_id != self.batch_id {
            return Err(BatchError::Corrupted(format!(
                "{} belongs to batch {}",
                path.display(),
                marker.batch_id
            )));
        }
        Ok(Some(marker))
    }

    /// Load the checkpoint, or `None` when the batch never wrote one.
    ///
    /// Read-only: a torn trailing journal line is skipped and superseded
    /// records are resolved in memory, but the files are left untouched so
    /// a concurrent writer never loses appended records.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        Ok(self.read().await?.map(|(checkpoint, _)| checkpoint))
    }

    /// Load the checkpoint for the process that will keep writing it.
    ///
    /// Same as [`load`](Self::load), then rewrites the journal without
    /// superseded records or a torn tail. Only the batch's single writer
    /// may call this.
    pub async fn load_for_resume(&self) -> Result<Option<Checkpoint>> {
        let Some((checkpoint, line_count)) = self.read().await? else {
            return Ok(None);
        };

        if line_count > checkpoint.tasks.len() {
            self.compact(&checkpoint.tasks).await?;
            debug!(
                batch_id = %self.batch_id,
                before = line_count,
                after = checkpoint.tasks.len(),
                "Compacted journal"
            );
        }
        Ok(Some(checkpoint))
    }

    async fn read(&self) -> Result<Option<(Checkpoint, usize)>> {
        if !self.exists() {
            return Ok(None);
        }

        let marker = self.load_marker().await?;
        let (tasks, line_count) = self.read_journal().await?;

        let tracker = ContiguousTracker::from_done(
            tasks
                .values()
                .filter(|r| r.status == TaskStatus::Succeeded)
                .map(|r| r.seq),
        );
        let last_contiguous = tracker.last();

        if let Some(marker) = &marker
            && marker.last_contiguous > last_contiguous
        {
            return Err(BatchError::Corrupted(format!(
                "marker claims {} but journal only covers {}",
                marker.last_contiguous, last_contiguous
            )));
        }

        let checkpoint = Checkpoint {
            batch_id: self.batch_id.clone(),
            last_contiguous,
            tasks,
        };
        Ok(Some((checkpoint, line_count)))
    }

    async fn read_journal(&self) -> Result<(BTreeMap<u64, TaskRecord>, usize)> {
        let path = self.journal_path();
        let mut tasks = BTreeMap::new();
        if !path.exists() {
            return Ok((tasks, 0));
        }

        let content = fs::read_to_string(&path).await?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut line_count = 0;

        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<TaskRecord>(line) {
                Ok(record) => {
                    line_count += 1;
                    tasks.insert(record.seq, record);
                }
                Err(e) if i + 1 == lines.len() && !content.ends_with('\n') => {
                    warn!(
                        batch_id = %self.batch_id,
                        error = %e,
                        "Ignoring torn trailing journal line"
                    );
                    // Count it so the rewrite drops it.
                    line_count += 1;
                }
                Err(e) => {
                    return Err(BatchError::Corrupted(format!(
                        "{} line {}: {e}",
                        path.display(),
                        i + 1
                    )));
                }
            }
        }

        Ok((tasks, line_count))
    }

    async fn compact(&self, tasks: &BTreeMap<u64, TaskRecord>) -> Result<()> {
        let mut content = String::new();
        for record in tasks.values() {
            content.push_str(&serde_json::to_string(record)?);
            content.push('\n');
        }
        atomic_write(&self.journal_path(), content.as_bytes()).await?;
        Ok(())
    }

    /// Remove the journal and marker.
    pub async fn clear(&self) -> Result<()> {
        for path in [self.journal_path(), self.marker_path()] {
            if path.exists() {
                fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}

/// Single-writer, debounced appender owned by the executor's coordinator.
#[derive(Debug)]
pub struct CheckpointWriter {
    store: CheckpointStore,
    policy: FlushPolicy,
    tracker: ContiguousTracker,
    pending: Vec<TaskRecord>,
    oldest_pending: Option<Instant>,
    flushed_marker: Option<u64>,
}

impl CheckpointWriter {
    pub fn new(store: CheckpointStore, policy: FlushPolicy) -> Self {
        Self {
            store,
            policy,
            tracker: ContiguousTracker::default(),
            pending: Vec::new(),
            oldest_pending: None,
            flushed_marker: None,
        }
    }

    /// Continue from a loaded checkpoint.
    pub fn resume(store: CheckpointStore, policy: FlushPolicy, checkpoint: &Checkpoint) -> Self {
        let mut writer = Self::new(store, policy);
        writer.tracker = ContiguousTracker::from_done(checkpoint.succeeded().map(|r| r.seq));
        writer.flushed_marker = Some(checkpoint.last_contiguous);
        writer
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Queue a record; nothing touches disk until [`flush`](Self::flush).
    pub fn record(&mut self, record: TaskRecord) {
        if record.status == TaskStatus::Succeeded {
            self.tracker.mark(record.seq);
        }
        self.oldest_pending.get_or_insert_with(Instant::now);
        self.pending.push(record);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// The marker value as of the last recorded success.
    pub fn last_contiguous(&self) -> u64 {
        self.tracker.last()
    }

    /// The marker value that is durably on disk.
    pub fn durable_contiguous(&self) -> u64 {
        self.flushed_marker.unwrap_or(0)
    }

    pub fn should_flush(&self) -> bool {
        if self.pending.len() >= self.policy.every.max(1) {
            return true;
        }
        self.oldest_pending
            .is_some_and(|t| t.elapsed() >= self.policy.interval)
    }

    /// Time at which the interval rule will next demand a flush.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.oldest_pending.map(|t| t + self.policy.interval)
    }

    /// Append pending records, sync them, then rewrite the marker.
    pub async fn flush(&mut self) -> Result<()> {
        let marker = self.tracker.last();
        if self.pending.is_empty() && self.flushed_marker == Some(marker) {
            return Ok(());
        }

        fs::create_dir_all(self.store.dir()).await?;

        if !self.pending.is_empty() {
            let mut buf = String::new();
            for record in &self.pending {
                buf.push_str(&serde_json::to_string(record)?);
                buf.push('\n');
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.store.journal_path())
                .await?;
            file.write_all(buf.as_bytes()).await?;
            file.sync_data().await?;
        }

        let content = serde_json::to_vec_pretty(&CheckpointMarker {
            batch_id: self.store.batch_id().to_string(),
            last_contiguous: marker,
            updated_at: Utc::now(),
        })?;
        atomic_write(&self.store.marker_path(), &content).await?;

        debug!(
            batch_id = %self.store.batch_id(),
            records = self.pending.len(),
            last_contiguous = marker,
            "Flushed checkpoint"
        );
        self.pending.clear();
        self.oldest_pending = None;
        self.flushed_marker = Some(marker);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::PromptTask;
    use tempfile::tempdir;

    fn succeeded(seq: u64) -> TaskRecord {
        let task = PromptTask::new(seq, format!("prompt {seq}"), BTreeMap::new());
        TaskRecord {
            seq,
            status: TaskStatus::Succeeded,
            attempts: 1,
            result: Some(TaskResult::success(
                &task,
                crate::provider::ModelResponse::text("ok"),
            )),
        }
    }

    fn failed(seq: u64) -> TaskRecord {
        TaskRecord {
            seq,
            status: TaskStatus::Failed,
            attempts: 2,
            result: None,
        }
    }

    #[test]
    fn test_tracker_waits_for_gap() {
        let mut tracker = ContiguousTracker::default();
        assert!(!tracker.mark(3));
        assert!(tracker.mark(1));
        assert_eq!(tracker.last(), 1);
        assert!(tracker.mark(2));
        assert_eq!(tracker.last(), 3);
        assert!(!tracker.mark(2));
        assert_eq!(tracker.last(), 3);
    }

    #[tokio::test]
    async fn test_missing_checkpoint_loads_as_none() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "b1");
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_and_load() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "b1");
        let mut writer = CheckpointWriter::new(store.clone(), FlushPolicy::default());

        writer.record(succeeded(1));
        writer.record(failed(2));
        writer.record(succeeded(3));
        assert_eq!(writer.last_contiguous(), 1);
        assert_eq!(writer.durable_contiguous(), 0);
        writer.flush().await.unwrap();
        assert_eq!(writer.durable_contiguous(), 1);

        let checkpoint = store.load().await.unwrap().unwrap();
        assert_eq!(checkpoint.last_contiguous, 1);
        assert_eq!(checkpoint.tasks.len(), 3);
        assert_eq!(checkpoint.status_of(2), Some(TaskStatus::Failed));
        assert_eq!(checkpoint.succeeded().count(), 2);

        let marker = store.load_marker().await.unwrap().unwrap();
        assert_eq!(marker.last_contiguous, 1);
    }

    #[tokio::test]
    async fn test_later_records_supersede_and_compact() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "b1");
        let mut writer = CheckpointWriter::new(store.clone(), FlushPolicy::default());
        writer.record(failed(2));
        writer.flush().await.unwrap();
        writer.record(succeeded(1));
        writer.record(succeeded(2));
        writer.flush().await.unwrap();

        let before = fs::read_to_string(store.journal_path()).await.unwrap();
        let checkpoint = store.load().await.unwrap().unwrap();
        assert_eq!(checkpoint.status_of(2), Some(TaskStatus::Succeeded));
        assert_eq!(checkpoint.last_contiguous, 2);
        assert_eq!(fs::read_to_string(store.journal_path()).await.unwrap(), before);

        let checkpoint = store.load_for_resume().await.unwrap().unwrap();
        assert_eq!(checkpoint.status_of(2), Some(TaskStatus::Succeeded));
        let journal = fs::read_to_string(store.journal_path()).await.unwrap();
        assert_eq!(journal.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_read_during_append_keeps_writer_records() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "b1");
        let mut writer = CheckpointWriter::new(store.clone(), FlushPolicy::default());
        writer.record(failed(1));
        writer.flush().await.unwrap();
        writer.record(succeeded(1));
        writer.flush().await.unwrap();

        // A second process reads between two writer flushes.
        let reader = CheckpointStore::new(dir.path(), "b1");
        let seen = reader.load().await.unwrap().unwrap();
        writer.record(succeeded(2));
        writer.flush().await.unwrap();
        assert_eq!(seen.tasks.len(), 1);

        let journal = fs::read_to_string(store.journal_path()).await.unwrap();
        assert_eq!(journal.lines().count(), 3);

        let checkpoint = store.load().await.unwrap().unwrap();
        assert_eq!(checkpoint.status_of(2), Some(TaskStatus::Succeeded));
        assert_eq!(checkpoint.last_contiguous, 2);
    }

    #[tokio::test]
    async fn test_torn_trailing_line_is_ignored() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "b1");
        let mut writer = CheckpointWriter::new(store.clone(), FlushPolicy::default());
        writer.record(succeeded(1));
        writer.flush().await.unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(store.journal_path())
            .await
            .unwrap();
        file.write_all(b"{\"seq\":2,\"stat").await.unwrap();
        drop(file);

        let checkpoint = store.load().await.unwrap().unwrap();
        assert_eq!(checkpoint.tasks.len(), 1);
        assert_eq!(checkpoint.last_contiguous, 1);
        let journal = fs::read_to_string(store.journal_path()).await.unwrap();
        assert!(!journal.ends_with('\n'));

        let checkpoint = store.load_for_resume().await.unwrap().unwrap();
        assert_eq!(checkpoint.tasks.len(), 1);
        let journal = fs::read_to_string(store.journal_path()).await.unwrap();
        assert!(journal.ends_with('\n'));
        assert_eq!(journal.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_is_an_error() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "b1");
        fs::write(store.journal_path(), "garbage\n{\"seq\":1,\"status\":\"failed\",\"attempts\":1}\n")
            .await
            .unwrap();
        assert!(matches!(
            store.load().await.unwrap_err(),
            BatchError::Corrupted(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_policy() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "b1");
        let policy = FlushPolicy {
            every: 3,
            interval: Duration::from_secs(2),
        };
        let mut writer = CheckpointWriter::new(store, policy);
        assert!(!writer.should_flush());

        writer.record(failed(1));
        writer.record(failed(2));
        assert!(!writer.should_flush());
        writer.record(failed(3));
        assert!(writer.should_flush());

        writer.flush().await.unwrap();
        writer.record(failed(4));
        assert!(!writer.should_flush());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(writer.should_flush());
    }

    #[tokio::test]
    async fn test_resumed_writer_keeps_marker() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "b1");
        let mut writer = CheckpointWriter::new(store.clone(), FlushPolicy::default());
        writer.record(succeeded(1));
        writer.record(succeeded(3));
        writer.flush().await.unwrap();

        let checkpoint = store.load().await.unwrap().unwrap();
        let mut writer = CheckpointWriter::resume(store.clone(), FlushPolicy::default(), &checkpoint);
        assert_eq!(writer.last_contiguous(), 1);
        writer.record(succeeded(2));
        assert_eq!(writer.last_contiguous(), 3);
        writer.flush().await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().last_contiguous, 3);
    }
}
