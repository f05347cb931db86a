//! On-disk batch history.
//!
//! ```text
//! <root>/
//!   <batch-id>/
//!     job.json
//!     journal.jsonl
//!     checkpoint.json
//!     cancel
//!   archived/
//!     <batch-id>/...
//! ```

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::{BatchError, Result};
use crate::fs_util::atomic_write;
use crate::job::BatchJob;

const JOB_FILE: &str = "job.json";
const CANCEL_FILE: &str = "cancel";
const ARCHIVE_DIR: &str = "archived";

/// Store for batch records.
#[derive(Debug, Clone)]
pub struct BatchStore {
    base_dir: PathBuf,
    archive_dir: PathBuf,
}

impl BatchStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let archive_dir = base_dir.join(ARCHIVE_DIR);
        Self {
            base_dir,
            archive_dir,
        }
    }

    /// Create the store directories if needed.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir).await?;
        fs::create_dir_all(&self.archive_dir).await?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn batch_dir(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }

    pub fn checkpoint_store(&self, id: &str) -> CheckpointStore {
        CheckpointStore::new(self.batch_dir(id), id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.batch_dir(id).join(JOB_FILE).exists()
    }

    /// Atomically write a job record.
    pub async fn save_job(&self, job: &BatchJob) -> Result<()> {
        let path = self.batch_dir(&job.id).join(JOB_FILE);
        let content = serde_json::to_vec_pretty(job)?;
        atomic_write(&path, &content).await?;
        debug!(batch_id = %job.id, status = %job.status, "Saved job");
        Ok(())
    }

    pub async fn load_job(&self, id: &str) -> Result<BatchJob> {
        let path = self.batch_dir(id).join(JOB_FILE);
        if !path.exists() {
            return Err(BatchError::NotFound(id.to_string()));
        }
        let content = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All jobs, newest first. Unreadable entries are skipped.
    pub async fn list_jobs(&self, limit: Option<usize>) -> Result<Vec<BatchJob>> {
        let mut jobs = Vec::new();
        if !self.base_dir.exists() {
            return Ok(jobs);
        }

        let mut entries = fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let job_path = path.join(JOB_FILE);
            if !path.is_dir() || !job_path.exists() {
                continue;
            }
            let loaded = match fs::read_to_string(&job_path).await {
                Ok(content) => {
                    serde_json::from_str::<BatchJob>(&content).map_err(|e| e.to_string())
                }
                Err(e) => Err(e.to_string()),
            };
            match loaded {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!(path = %job_path.display(), error = %e, "Skipping unreadable job")
                }
            }
        }

        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    /// Resolve a full id or a unique id prefix.
    pub async fn find_job(&self, prefix: &str) -> Result<BatchJob> {
        if self.exists(prefix) {
            return self.load_job(prefix).await;
        }

        let mut matches: Vec<BatchJob> = self
            .list_jobs(None)
            .await?
            .into_iter()
            .filter(|job| job.id.starts_with(prefix))
            .collect();

        match matches.len() {
            0 => Err(BatchError::NotFound(prefix.to_string())),
            1 => Ok(matches.remove(0)),
            count => Err(BatchError::Ambiguous {
                prefix: prefix.to_string(),
                count,
            }),
        }
    }

    /// Ask a running batch to stop. The running process polls for the marker.
    pub async fn request_cancel(&self, id: &str) -> Result<()> {
        if !self.exists(id) {
            return Err(BatchError::NotFound(id.to_string()));
        }
        atomic_write(&self.batch_dir(id).join(CANCEL_FILE), b"cancel\n").await?;
        info!(batch_id = %id, "Cancel requested");
        Ok(())
    }

    pub fn cancel_requested(&self, id: &str) -> bool {
        self.batch_dir(id).join(CANCEL_FILE).exists()
    }

    pub async fn clear_cancel(&self, id: &str) -> Result<()> {
        let path = self.batch_dir(id).join(CANCEL_FILE);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    /// Move a batch's history under `archived/`.
    pub async fn archive_job(&self, id: &str) -> Result<()> {
        let source = self.batch_dir(id);
        if !source.join(JOB_FILE).exists() {
            return Err(BatchError::NotFound(id.to_string()));
        }
        let dest = self.archive_dir.join(id);
        if dest.exists() {
            return Err(BatchError::AlreadyExists(format!("archived batch {id}")));
        }
        fs::create_dir_all(&self.archive_dir).await?;
        fs::rename(&source, &dest).await?;
        info!(batch_id = %id, "Archived batch");
        Ok(())
    }

    /// Permanently remove a batch, active or archived.
    pub async fn delete_job(&self, id: &str) -> Result<()> {
        for dir in [self.batch_dir(id), self.archive_dir.join(id)] {
            if dir.join(JOB_FILE).exists() {
                fs::remove_dir_all(&dir).await?;
                info!(batch_id = %id, "Deleted batch");
                return Ok(());
            }
        }
        Err(BatchError::NotFound(id.to_string()))
    }
}
