//! Executor: drives every queued task of a batch to a terminal state.
//!
//! A fixed pool of workers pulls tasks from one shared queue. Workers report
//! transitions over a channel to a single coordinator, which owns the task
//! table, the counts, the checkpoint writer and the output writer.

mod control;
mod worker;


pub use control::{BatchControl, StopReason};

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointWriter, FlushPolicy, TaskRecord};
use crate::error::{BatchError, ErrorDescriptor, Result};
use crate::job::{BatchCounts, BatchJob, BatchStatus};
use crate::output::OutputWriter;
use crate::provider::ModelProvider;
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::retry::{Backoff, RetryPolicy};
use crate::store::BatchStore;
use crate::task::{PromptTask, TaskResult, TaskStatus};

use worker::{TaskQueue, Worker, WorkerEvent};

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of workers.
    pub concurrency: usize,
    /// `None` disables rate limiting.
    pub rate_limit: Option<RateLimitConfig>,
    pub retry: RetryPolicy,
    /// Upper bound on a single provider call.
    pub task_timeout: Duration,
    /// Upper bound on the whole run. Expiry pauses the batch.
    pub batch_timeout: Option<Duration>,
    /// How long one attempt may wait for a rate limit token.
    pub acquire_timeout: Option<Duration>,
    pub stop_on_error: bool,
    pub flush: FlushPolicy,
    /// Seed for retry jitter; each worker derives its own stream from it.
    pub jitter_seed: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            rate_limit: None,
            retry: RetryPolicy::default(),
            task_timeout: Duration::from_secs(120),
            batch_timeout: None,
            acquire_timeout: None,
            stop_on_error: false,
            flush: FlushPolicy::default(),
            jitter_seed: None,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(BatchError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(BatchError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(BatchError::InvalidConfig(
                "jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        if let Some(limit) = &self.rate_limit
            && (limit.capacity == 0 || limit.per.is_zero())
        {
            return Err(BatchError::InvalidConfig(
                "rate limit must allow at least one call per non-zero window".to_string(),
            ));
        }
        if self.task_timeout.is_zero() {
            return Err(BatchError::InvalidConfig(
                "task timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A task that ended failed, as shown in reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub seq: u64,
    pub attempts: u32,
    pub prompt: String,
    pub error: ErrorDescriptor,
}

/// Token totals across succeeded tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// What one executor run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSummary {
    pub status: BatchStatus,
    pub counts: BatchCounts,
    pub stop_reason: Option<StopReason>,
    pub last_contiguous: u64,
    pub failures: Vec<TaskFailure>,
    pub usage: UsageTotals,
    /// Number of provider calls started during this run.
    pub attempts: u64,
}

/// Batch executor.
pub struct Executor {
    config: ExecutorConfig,
    provider: Arc<dyn ModelProvider>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, provider: Arc<dyn ModelProvider>) -> Self {
        Self { config, provider }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run every queued task in `tasks` to a terminal state, or until
    /// `control` stops the batch.
    ///
    /// `tasks` may already contain terminal tasks from an earlier run; they
    /// count towards the totals but are never dispatched.
    pub async fn execute(
        &self,
        job: &mut BatchJob,
        tasks: Vec<PromptTask>,
        checkpoint: &mut CheckpointWriter,
        output: &mut OutputWriter,
        store: &BatchStore,
        control: &BatchControl,
    ) -> Result<ExecutionSummary> {
        self.config.validate()?;

        let queue: VecDeque<PromptTask> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .cloned()
            .collect();
        let table: BTreeMap<u64, PromptTask> = tasks.into_iter().map(|t| (t.seq, t)).collect();

        job.counts = BatchCounts::tally(table.values().map(|t| t.status));
        job.mark_running();
        let model = job.model.clone();
        let system_prompt = job.system_prompt.clone();
        store.save_job(job).await?;

        info!(
            batch_id = %job.id,
            total = job.counts.total,
            queued = queue.len(),
            concurrency = self.config.concurrency,
            "Batch started"
        );

        let mut coordinator = Coordinator {
            job,
            table,
            checkpoint,
            output,
            store,
            control,
            stop_on_error: self.config.stop_on_error,
            fatal: None,
            worker_panics: 0,
            attempts: 0,
        };

        let queue: TaskQueue = Arc::new(Mutex::new(queue));
        let (tx, mut rx) = mpsc::channel(self.config.concurrency.max(1) * 4);
        let mut workers = self.spawn_workers(&model, system_prompt.as_deref(), &queue, tx, control);

        let batch_deadline = self.config.batch_timeout.map(|t| Instant::now() + t);

        loop {
            let flush_at = coordinator.checkpoint.next_deadline();
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => coordinator.apply(event).await,
                    None => break,
                },
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    coordinator.worker_exited(joined);
                }
                _ = sleep_until(batch_deadline.unwrap_or_else(Instant::now)),
                    if batch_deadline.is_some() && !control.is_stopped() =>
                {
                    warn!(batch_id = %coordinator.job.id, "Batch timeout elapsed, pausing");
                    control.stop(StopReason::TimedOut);
                }
                _ = sleep_until(flush_at.unwrap_or_else(Instant::now)),
                    if flush_at.is_some() && coordinator.fatal.is_none() =>
                {
                    coordinator.flush().await;
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            coordinator.worker_exited(joined);
        }

        coordinator.finish().await
    }

    fn spawn_workers(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        queue: &TaskQueue,
        events: mpsc::Sender<WorkerEvent>,
        control: &BatchControl,
    ) -> JoinSet<()> {
        let limiter = Arc::new(RateLimiter::from_config(self.config.rate_limit));
        let mut workers = JoinSet::new();
        for id in 0..self.config.concurrency {
            let worker = Worker {
                id,
                queue: Arc::clone(queue),
                provider: Arc::clone(&self.provider),
                limiter: Arc::clone(&limiter),
                backoff: Backoff::new(
                    self.config.retry.clone(),
                    self.config.jitter_seed.map(|s| s.wrapping_add(id as u64)),
                ),
                task_timeout: self.config.task_timeout,
                acquire_timeout: self.config.acquire_timeout,
                model: model.to_string(),
                system_prompt: system_prompt.map(str::to_string),
                stop_on_error: self.config.stop_on_error,
                events: events.clone(),
                control: control.clone(),
            };
            workers.spawn(worker.run());
        }
        workers
    }
}

/// Single owner of all mutable batch state during a run.
struct Coordinator<'a> {
    job: &'a mut BatchJob,
    table: BTreeMap<u64, PromptTask>,
    checkpoint: &'a mut CheckpointWriter,
    output: &'a mut OutputWriter,
    store: &'a BatchStore,
    control: &'a BatchControl,
    stop_on_error: bool,
    fatal: Option<BatchError>,
    /// Workers that died without reporting their task.
    worker_panics: usize,
    attempts: u64,
}

impl Coordinator<'_> {
    async fn apply(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Started { seq, attempt } => {
                self.attempts += 1;
                self.transition(seq, TaskStatus::InFlight);
                debug!(batch_id = %self.job.id, seq, attempt, "Task in flight");
            }
            WorkerEvent::Retrying {
                seq,
                attempt,
                delay,
                error,
            } => {
                self.transition(seq, TaskStatus::Retrying);
                debug!(
                    batch_id = %self.job.id,
                    seq,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Task retrying"
                );
            }
            WorkerEvent::Finished { result } => {
                let seq = result.seq;
                let status = if result.is_success() {
                    TaskStatus::Succeeded
                } else {
                    TaskStatus::Failed
                };
                if self.transition(seq, status) {
                    if let Some(task) = self.table.get_mut(&seq) {
                        task.result = Some(result.clone());
                    }
                    self.complete(seq, status);
                    self.output.push(result);
                    if status == TaskStatus::Failed && self.stop_on_error {
                        info!(batch_id = %self.job.id, seq, "Stopping batch after task failure");
                        self.control.stop(StopReason::StopOnError);
                    }
                }
            }
            WorkerEvent::Cancelled { seq } => {
                if self.transition(seq, TaskStatus::Cancelled) {
                    self.complete(seq, TaskStatus::Cancelled);
                }
            }
        }

        if self.checkpoint.should_flush() {
            self.flush().await;
        }
    }

    fn transition(&mut self, seq: u64, next: TaskStatus) -> bool {
        let Some(task) = self.table.get_mut(&seq) else {
            warn!(seq, "Event for unknown task");
            return false;
        };
        if task.transition(next) {
            true
        } else {
            warn!(seq, from = %task.status, to = %next, "Rejected task transition");
            false
        }
    }

    fn worker_exited(&mut self, joined: std::result::Result<(), JoinError>) {
        let Err(e) = joined else {
            return;
        };
        error!(batch_id = %self.job.id, error = %e, "Worker task panicked, stopping batch");
        self.worker_panics += 1;
        self.control.stop(StopReason::Fatal);
    }

    /// Settle tasks whose worker is gone. Only valid once every worker has
    /// exited.
    fn settle_stranded(&mut self) {
        let stranded: Vec<(u64, TaskStatus)> = self
            .table
            .values()
            .filter(|t| matches!(t.status, TaskStatus::InFlight | TaskStatus::Retrying))
            .map(|t| (t.seq, t.status))
            .collect();

        for (seq, status) in stranded {
            warn!(batch_id = %self.job.id, seq, status = %status, "Task lost its worker");
            let next = if status == TaskStatus::InFlight {
                TaskStatus::Failed
            } else {
                TaskStatus::Cancelled
            };
            if !self.transition(seq, next) {
                continue;
            }
            if let Some(task) = self.table.get_mut(&seq) {
                let result = TaskResult::failure(task, ErrorDescriptor::worker_lost());
                task.result = Some(result.clone());
                if next == TaskStatus::Failed {
                    self.output.push(result);
                }
            }
            self.complete(seq, next);
        }
    }

    /// Count and journal a task that just became terminal.
    fn complete(&mut self, seq: u64, status: TaskStatus) {
        self.job.counts.record(status);
        if let Some(task) = self.table.get(&seq) {
            self.checkpoint.record(TaskRecord {
                seq,
                status,
                attempts: task.attempts,
                result: task.result.clone(),
            });
        }
    }

    /// Flush the journal and job record. A failure stops the batch.
    async fn flush(&mut self) {
        if self.fatal.is_some() {
            return;
        }
        let result = match self.checkpoint.flush().await {
            Ok(()) => self.store.save_job(self.job).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(batch_id = %self.job.id, error = %e, "Checkpoint write failed");
            self.control.stop(StopReason::Fatal);
            self.fatal = Some(e);
        }
    }

    async fn finish(mut self) -> Result<ExecutionSummary> {
        self.settle_stranded();
        let reason = self.control.reason();

        if reason.is_some_and(StopReason::cancels_queued) {
            let queued: Vec<u64> = self
                .table
                .values()
                .filter(|t| t.status == TaskStatus::Queued)
                .map(|t| t.seq)
                .collect();
            for seq in queued {
                if self.transition(seq, TaskStatus::Cancelled) {
                    self.complete(seq, TaskStatus::Cancelled);
                }
            }
        }

        let status = match reason {
            _ if self.fatal.is_some() || self.worker_panics > 0 => BatchStatus::Failed,
            None if self.job.counts.pending() == 0 => BatchStatus::Completed,
            None => BatchStatus::Failed,
            Some(StopReason::Cancelled) => BatchStatus::Cancelled,
            Some(StopReason::StopOnError) | Some(StopReason::Fatal) => BatchStatus::Failed,
            Some(StopReason::Paused) | Some(StopReason::TimedOut) => {
                if self.job.counts.pending() == 0 {
                    BatchStatus::Completed
                } else {
                    BatchStatus::Paused
                }
            }
        };

        self.job.mark_finished(status);
        if let Some(e) = &self.fatal {
            self.job.last_error = Some(e.to_string());
        } else if self.worker_panics > 0 {
            self.job.last_error = Some(format!("{} worker(s) panicked", self.worker_panics));
        }

        if let Some(e) = self.fatal.take() {
            // Best effort: the store may be the thing that failed.
            let _ = self.store.save_job(self.job).await;
            return Err(e);
        }

        self.checkpoint.flush().await?;
        self.output.write().await?;
        self.store.save_job(self.job).await?;

        let failures = self
            .table
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .filter_map(|t| {
                let result = t.result.as_ref()?;
                Some(TaskFailure {
                    seq: t.seq,
                    attempts: t.attempts,
                    prompt: t.prompt.clone(),
                    error: result.error.clone()?,
                })
            })
            .collect();

        let usage = self
            .output
            .results()
            .fold(UsageTotals::default(), |acc, r| UsageTotals {
                input_tokens: acc.input_tokens + r.input_tokens,
                output_tokens: acc.output_tokens + r.output_tokens,
            });

        info!(
            batch_id = %self.job.id,
            status = %status,
            succeeded = self.job.counts.succeeded,
            failed = self.job.counts.failed,
            cancelled = self.job.counts.cancelled,
            pending = self.job.counts.pending(),
            "Batch finished"
        );

        Ok(ExecutionSummary {
            status,
            counts: self.job.counts,
            stop_reason: reason,
            last_contiguous: self.checkpoint.last_contiguous(),
            failures,
            usage,
            attempts: self.attempts,
        })
    }
}
