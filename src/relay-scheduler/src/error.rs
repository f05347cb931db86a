//! Error types for the scheduler.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Scheduled job not found: {0}")]
    NotFound(String),

    #[error("Job id prefix '{prefix}' matches {count} jobs")]
    Ambiguous { prefix: String, count: usize },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}
