//! Prompt tasks, their lifecycle, and their results.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorDescriptor;
use crate::provider::ModelResponse;

/// Lifecycle state of a single prompt task.
///
/// ```text
/// queued -> in_flight -> succeeded
///                     -> retrying -> in_flight
///                     -> failed
///                     -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InFlight,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, InFlight)
                | (Queued, Cancelled)
                | (InFlight, Succeeded)
                | (InFlight, Failed)
                | (InFlight, Retrying)
                | (InFlight, Cancelled)
                | (Retrying, InFlight)
                | (Retrying, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InFlight => "in_flight",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rendered prompt awaiting exactly one model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTask {
    /// 1-based sequence index, stable across re-parses of the same source.
    pub seq: u64,
    pub prompt: String,
    /// Fields of the source record bound to the template.
    pub variables: BTreeMap<String, String>,
    pub status: TaskStatus,
    pub attempts: u32,
    pub result: Option<TaskResult>,
}

impl PromptTask {
    pub fn new(seq: u64, prompt: impl Into<String>, variables: BTreeMap<String, String>) -> Self {
        Self {
            seq,
            prompt: prompt.into(),
            variables,
            status: TaskStatus::Queued,
            attempts: 0,
            result: None,
        }
    }

    /// Apply a state transition. Returns `false` and leaves the task untouched
    /// when the state machine does not allow it.
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        if next == TaskStatus::InFlight {
            self.attempts += 1;
        }
        self.status = next;
        true
    }
}

/// The outcome of a task's final attempt. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub seq: u64,
    pub prompt: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Identifier the provider assigned to the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    /// Model name as reported by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(task: &PromptTask, response: ModelResponse) -> Self {
        Self {
            seq: task.seq,
            prompt: task.prompt.clone(),
            variables: task.variables.clone(),
            response: Some(response.text),
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            response_id: response.response_id,
            provider_model: response.model,
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(task: &PromptTask, error: ErrorDescriptor) -> Self {
        Self {
            seq: task.seq,
            prompt: task.prompt.clone(),
            variables: task.variables.clone(),
            response: None,
            input_tokens: 0,
            output_tokens: 0,
            response_id: None,
            provider_model: None,
            error: Some(error),
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
