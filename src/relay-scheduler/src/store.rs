//! JSON-file persistence for scheduled jobs and their run history.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::job::{JobRun, ScheduledJob};

/// Runs kept per job; older runs are dropped when new ones are recorded.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScheduleFile {
    #[serde(default)]
    jobs: Vec<ScheduledJob>,
    #[serde(default)]
    runs: Vec<JobRun>,
}

/// Whole-file store: every mutation loads, edits and atomically rewrites.
#[derive(Debug, Clone)]
pub struct ScheduleStore {
    path: PathBuf,
    history_limit: usize,
}

impl ScheduleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<ScheduleFile> {
        if !self.path.exists() {
            return Ok(ScheduleFile::default());
        }
        let content = fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(ScheduleFile::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, file: &ScheduleFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn add_job(&self, job: &ScheduledJob) -> Result<()> {
        let mut file = self.load().await?;
        file.jobs.push(job.clone());
        self.save(&file).await?;
        debug!(job_id = %job.id, schedule = %job.schedule, "Added scheduled job");
        Ok(())
    }

    /// Jobs newest first.
    pub async fn list_jobs(&self, active_only: bool) -> Result<Vec<ScheduledJob>> {
        let mut jobs: Vec<ScheduledJob> = self
            .load()
            .await?
            .jobs
            .into_iter()
            .filter(|j| !active_only || j.active)
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    /// Look up a job by full id or unique id prefix.
    pub async fn get_job(&self, id_or_prefix: &str) -> Result<ScheduledJob> {
        let file = self.load().await?;
        find(&file.jobs, id_or_prefix).cloned()
    }

    /// Replace a stored job with the same id.
    pub async fn update_job(&self, job: &ScheduledJob) -> Result<()> {
        let mut file = self.load().await?;
        let slot = file
            .jobs
            .iter_mut()
            .find(|j| j.id == job.id)
            .ok_or_else(|| SchedulerError::NotFound(job.id.clone()))?;
        *slot = job.clone();
        self.save(&file).await
    }

    /// Delete a job and its history. Returns the removed job.
    pub async fn remove_job(&self, id_or_prefix: &str) -> Result<ScheduledJob> {
        let mut file = self.load().await?;
        let job = find(&file.jobs, id_or_prefix)?.clone();
        file.jobs.retain(|j| j.id != job.id);
        file.runs.retain(|r| r.job_id != job.id);
        self.save(&file).await?;
        Ok(job)
    }

    /// Append a run and trim that job's history to the limit.
    pub async fn record_run(&self, run: &JobRun) -> Result<()> {
        let mut file = self.load().await?;
        file.runs.push(run.clone());

        let count = file.runs.iter().filter(|r| r.job_id == run.job_id).count();
        if count > self.history_limit {
            let mut excess = count - self.history_limit;
            file.runs.retain(|r| {
                if excess > 0 && r.job_id == run.job_id {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
        self.save(&file).await
    }

    /// Runs of one job, newest first.
    pub async fn runs(&self, job_id: &str, limit: usize) -> Result<Vec<JobRun>> {
        let mut runs: Vec<JobRun> = self
            .load()
            .await?
            .runs
            .into_iter()
            .filter(|r| r.job_id == job_id)
            .collect();
        runs.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

fn find<'a>(jobs: &'a [ScheduledJob], id_or_prefix: &str) -> Result<&'a ScheduledJob> {
    if let Some(job) = jobs.iter().find(|j| j.id == id_or_prefix) {
        return Ok(job);
    }
    let matches: Vec<&ScheduledJob> = jobs
        .iter()
        .filter(|j| j.id.starts_with(id_or_prefix))
        .collect();
    match matches.as_slice() {
        [job] => Ok(*job),
        [] => Err(SchedulerError::NotFound(id_or_prefix.to_string())),
        many => Err(SchedulerError::Ambiguous {
            prefix: id_or_prefix.to_string(),
            count: many.len(),
        }),
    }
}
