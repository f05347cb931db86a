//! Worker loop: dequeue, throttle, invoke, retry.
//!
//! A worker keeps a task through all of its attempts and reports every
//! transition to the coordinator. It never mutates shared task state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

use crate::error::{BatchError, ErrorDescriptor, ProviderError};
use crate::provider::{ModelProvider, ModelRequest, ModelResponse};
use crate::ratelimit::RateLimiter;
use crate::retry::Backoff;
use crate::task::{PromptTask, TaskResult};

use super::control::{BatchControl, StopReason};

/// Shared FIFO of tasks that have not been picked up yet.
pub(super) type TaskQueue = Arc<Mutex<VecDeque<PromptTask>>>;

/// Transition reports sent to the coordinator.
#[derive(Debug)]
pub(super) enum WorkerEvent {
    /// An attempt began (the worker is about to ask for a token).
    Started { seq: u64, attempt: u32 },
    /// The attempt failed and the task will be retried after `delay`.
    Retrying {
        seq: u64,
        attempt: u32,
        delay: Duration,
        error: ErrorDescriptor,
    },
    /// The task reached succeeded or failed.
    Finished { result: TaskResult },
    /// The batch stopped while the task waited for a token or a retry.
    Cancelled { seq: u64 },
}

pub(super) struct Worker {
    pub id: usize,
    pub queue: TaskQueue,
    pub provider: Arc<dyn ModelProvider>,
    pub limiter: Arc<RateLimiter>,
    pub backoff: Backoff,
    pub task_timeout: Duration,
    pub acquire_timeout: Option<Duration>,
    pub model: String,
    pub system_prompt: Option<String>,
    pub stop_on_error: bool,
    pub events: mpsc::Sender<WorkerEvent>,
    pub control: BatchControl,
}

impl Worker {
    pub(super) async fn run(mut self) {
        debug!(worker = self.id, "Worker started");
        loop {
            if self.control.is_stopped() {
                break;
            }
            let next = {
                let mut queue = self.queue.lock().await;
                match queue.pop_front() {
                    Some(task) if self.control.is_stopped() => {
                        queue.push_front(task);
                        None
                    }
                    other => other,
                }
            };
            let Some(task) = next else {
                break;
            };
            if !self.process(task).await {
                break;
            }
        }
        debug!(worker = self.id, "Worker stopped");
    }

    /// Drive one task to a terminal report. Returns false when the
    /// coordinator has gone away.
    async fn process(&mut self, task: PromptTask) -> bool {
        let request = ModelRequest::new(task.prompt.clone(), self.model.clone())
            .with_system_prompt(self.system_prompt.clone());
        let mut attempt = 0;

        loop {
            attempt += 1;
            if !self.send(WorkerEvent::Started {
                seq: task.seq,
                attempt,
            })
            .await
            {
                return false;
            }

            let deadline = self.acquire_timeout.map(|t| Instant::now() + t);
            let acquired = tokio::select! {
                biased;
                _ = self.control.stopped() => {
                    return self.send(WorkerEvent::Cancelled { seq: task.seq }).await;
                }
                acquired = self.limiter.acquire(deadline) => acquired,
            };

            let outcome = match acquired {
                Ok(()) => self.invoke(&request).await,
                Err(e) => Err(e),
            };

            let error = match outcome {
                Ok(response) => {
                    debug!(seq = task.seq, attempt, "Task succeeded");
                    return self
                        .send(WorkerEvent::Finished {
                            result: TaskResult::success(&task, response),
                        })
                        .await;
                }
                Err(e) => e,
            };

            let descriptor = error.descriptor();
            if !self
                .backoff
                .policy()
                .should_retry(attempt, error.is_retryable())
            {
                warn!(
                    seq = task.seq,
                    attempt,
                    error = %descriptor,
                    "Task failed"
                );
                if self.stop_on_error {
                    // Before reporting, so no other task is dequeued first.
                    self.control.stop(StopReason::StopOnError);
                }
                return self
                    .send(WorkerEvent::Finished {
                        result: TaskResult::failure(&task, descriptor),
                    })
                    .await;
            }

            let delay = self.backoff.delay(attempt - 1);
            warn!(
                seq = task.seq,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %descriptor,
                "Retrying task"
            );
            if !self
                .send(WorkerEvent::Retrying {
                    seq: task.seq,
                    attempt,
                    delay,
                    error: descriptor,
                })
                .await
            {
                return false;
            }

            tokio::select! {
                biased;
                _ = self.control.stopped() => {
                    return self.send(WorkerEvent::Cancelled { seq: task.seq }).await;
                }
                _ = sleep(delay) => {}
            }
        }
    }

    /// One provider call under the per-task timeout. Never interrupted by a
    /// batch stop.
    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, BatchError> {
        match timeout(self.task_timeout, self.provider.invoke(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProviderError::timeout(format!(
                "no response within {}ms",
                self.task_timeout.as_millis()
            ))
            .into()),
        }
    }

    async fn send(&self, event: WorkerEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}
