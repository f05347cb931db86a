//! Polling service that fires due jobs through a [`ModelProvider`].

use std::sync::Arc;
use std::time::Duration;

use relay_batch::{ModelProvider, ModelRequest};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::job::{JobRun, ScheduledJob};
use crate::store::ScheduleStore;

/// Default time between due-job checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub struct SchedulerService {
    store: ScheduleStore,
    provider: Arc<dyn ModelProvider>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl SchedulerService {
    pub fn new(store: ScheduleStore, provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            store,
            provider,
            clock: Arc::new(SystemClock),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn store(&self) -> &ScheduleStore {
        &self.store
    }

    /// Run every job that is due now, in next-run order.
    ///
    /// Each run is recorded and the job's schedule advanced before the next
    /// job starts. Once-jobs deactivate after firing.
    pub async fn tick(&self) -> Result<Vec<JobRun>> {
        let now = self.clock.now();
        let mut due: Vec<ScheduledJob> = self
            .store
            .list_jobs(true)
            .await?
            .into_iter()
            .filter(|j| j.is_due(now))
            .collect();
        due.sort_by_key(|j| j.next_run);

        let mut runs = Vec::with_capacity(due.len());
        for mut job in due {
            let run = self.execute(&job).await;
            self.store.record_run(&run).await?;
            job.advance(self.clock.now());
            self.store.update_job(&job).await?;
            runs.push(run);
        }
        if !runs.is_empty() {
            info!(count = runs.len(), "Ran scheduled jobs");
        }
        Ok(runs)
    }

    /// Run one job immediately. Its schedule is left as it was.
    pub async fn run_now(&self, id_or_prefix: &str) -> Result<JobRun> {
        let mut job = self.store.get_job(id_or_prefix).await?;
        let run = self.execute(&job).await;
        self.store.record_run(&run).await?;
        job.last_run = Some(run.executed_at);
        self.store.update_job(&job).await?;
        Ok(run)
    }

    async fn execute(&self, job: &ScheduledJob) -> JobRun {
        let executed_at = self.clock.now();
        let request = ModelRequest::new(job.prompt.clone(), job.model.clone())
            .with_system_prompt(job.system_prompt.clone());
        debug!(job_id = %job.id, model = %job.model, "Running scheduled job");

        let mut run = JobRun {
            id: uuid::Uuid::new_v4().simple().to_string(),
            job_id: job.id.clone(),
            executed_at,
            response: None,
            success: false,
            error: None,
            input_tokens: 0,
            output_tokens: 0,
        };
        match self.provider.invoke(&request).await {
            Ok(response) => {
                run.success = true;
                run.response = Some(response.text);
                run.input_tokens = response.input_tokens;
                run.output_tokens = response.output_tokens;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Scheduled job failed");
                run.error = Some(e.to_string());
            }
        }
        run
    }

    /// Spawn the polling loop. The first check happens immediately.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let join = tokio::spawn(async move {
            info!(
                poll_secs = self.poll_interval.as_secs_f64(),
                "Scheduler started"
            );
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.tick().await {
                            warn!(error = %e, "Scheduler tick failed");
                        }
                    }
                }
            }
            info!("Scheduler stopped");
        });
        SchedulerHandle { token, join }
    }
}

/// Handle to a running [`SchedulerService`] loop.
pub struct SchedulerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Cancel the loop and wait for it to exit. A tick already in progress
    /// finishes first.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta, Utc};
    use pretty_assertions::assert_eq;
    use relay_batch::{ModelResponse, ProviderError};

    use super::*;
    use crate::clock::ManualClock;
    use crate::job::Schedule;

    struct RecordingProvider {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelProvider for RecordingProvider {
        fn name(&self) -> &str {
            "recording"
        }

        async fn invoke(
            &self,
            request: &ModelRequest,
        ) -> std::result::Result<ModelResponse, ProviderError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            if request.prompt == "fail" {
                return Err(ProviderError::authentication("bad key"));
            }
            Ok(ModelResponse::text(format!("re: {}", request.prompt)).with_usage(1, 2))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: ManualClock,
        provider: Arc<RecordingProvider>,
        service: Arc<SchedulerService>,
    }

    fn start_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start_time());
        let provider = Arc::new(RecordingProvider {
            prompts: Mutex::new(Vec::new()),
        });
        let service = SchedulerService::new(
            ScheduleStore::new(dir.path().join("schedules.json")),
            provider.clone(),
        )
        .with_clock(Arc::new(clock.clone()))
        .with_poll_interval(Duration::from_secs(1));
        Fixture {
            _dir: dir,
            clock,
            provider,
            service: Arc::new(service),
        }
    }

    impl Fixture {
        async fn add(&self, prompt: &str, schedule: Schedule) -> ScheduledJob {
            let job = ScheduledJob::new(prompt, "m", schedule, self.clock.now());
            self.service.store().add_job(&job).await.unwrap();
            job
        }

        fn prompts(&self) -> Vec<String> {
            self.provider.prompts.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_tick_runs_only_due_jobs() {
        let f = fixture();
        let once = f
            .add(
                "once",
                Schedule::Once {
                    at: start_time() + TimeDelta::minutes(5),
                },
            )
            .await;
        let every = f.add("every", Schedule::Every { interval_secs: 120 }).await;

        assert!(f.service.tick().await.unwrap().is_empty());

        f.clock.advance(TimeDelta::minutes(3));
        let runs = f.service.tick().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].job_id, every.id);
        assert_eq!(runs[0].response.as_deref(), Some("re: every"));

        f.clock.advance(TimeDelta::minutes(3));
        let runs = f.service.tick().await.unwrap();
        let ran: Vec<&str> = runs.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(ran, vec![every.id.as_str(), once.id.as_str()]);

        let once = f.service.store().get_job(&once.id).await.unwrap();
        assert!(!once.active);
        assert_eq!(once.next_run, None);
        // Earliest next_run fires first.
        assert_eq!(f.prompts(), vec!["every", "every", "once"]);
    }

    #[tokio::test]
    async fn test_failed_run_is_recorded() {
        let f = fixture();
        let job = f.add("fail", Schedule::Every { interval_secs: 60 }).await;
        f.clock.advance(TimeDelta::seconds(60));

        let runs = f.service.tick().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].success);
        assert!(runs[0].error.as_deref().unwrap().contains("bad key"));

        let history = f.service.store().runs(&job.id, 10).await.unwrap();
        assert_eq!(history, runs);
        let job = f.service.store().get_job(&job.id).await.unwrap();
        assert!(job.active);
        assert_eq!(job.next_run, Some(start_time() + TimeDelta::seconds(120)));
    }

    #[tokio::test]
    async fn test_run_now_keeps_schedule() {
        let f = fixture();
        let job = f.add("now", Schedule::Every { interval_secs: 3_600 }).await;

        let run = f.service.run_now(&job.id[..8]).await.unwrap();
        assert!(run.success);
        assert_eq!(run.input_tokens, 1);

        let stored = f.service.store().get_job(&job.id).await.unwrap();
        assert_eq!(stored.next_run, job.next_run);
        assert_eq!(stored.last_run, Some(start_time()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop() {
        let f = fixture();
        f.add("loop", Schedule::Every { interval_secs: 1 }).await;
        f.clock.advance(TimeDelta::seconds(1));

        let handle = Arc::clone(&f.service).start();
        assert!(handle.is_running());
        for _ in 0..50 {
            if !f.prompts().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        handle.stop().await;

        let seen = f.prompts().len();
        assert!(seen >= 1);
        f.clock.advance(TimeDelta::seconds(10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.prompts().len(), seen);
    }
}
