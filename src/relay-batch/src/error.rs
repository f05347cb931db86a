//! Error types for the batch engine.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for batch operations.
pub type Result<T> = std::result::Result<T, BatchError>;

/// Main error type for the batch engine.
#[derive(Debug, Error)]
pub enum BatchError {
    // Pre-execution errors
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    // Per-attempt errors
    #[error("Rate limiter gave no token within {waited:?}")]
    RateLimitTimeout { waited: Duration },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    // Durable state errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checkpoint corrupted: {0}")]
    Corrupted(String),

    // Lookup errors
    #[error("Batch not found: {0}")]
    NotFound(String),

    #[error("Batch already exists: {0}")]
    AlreadyExists(String),

    #[error("Batch id prefix '{prefix}' matches {count} batches")]
    Ambiguous { prefix: String, count: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BatchError {
    /// Whether a task attempt that ended with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimitTimeout { .. } => true,
            Self::Provider(e) => e.retryable,
            _ => false,
        }
    }

    /// Describe this error for storage alongside a task result.
    pub fn descriptor(&self) -> ErrorDescriptor {
        match self {
            Self::RateLimitTimeout { waited } => ErrorDescriptor::rate_limit_timeout(*waited),
            Self::Provider(e) => ErrorDescriptor::from(e),
            other => ErrorDescriptor {
                kind: "internal".to_string(),
                message: other.to_string(),
                retryable: false,
            },
        }
    }
}

/// A template placeholder that no record can satisfy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "Template references unknown field(s): {} (available: {})",
    .missing.join(", "),
    .available.join(", ")
)]
pub struct SchemaError {
    /// Placeholder names absent from every record.
    pub missing: Vec<String>,
    /// Field names seen in the source.
    pub available: Vec<String>,
}

/// A single source record that could not be turned into a task.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("Record {record}: {message}")]
pub struct ParseError {
    /// 1-based position of the record in the source.
    pub record: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(record: usize, message: impl Into<String>) -> Self {
        Self {
            record,
            message: message.into(),
        }
    }
}

/// Failure category reported by a model provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimit,
    Network,
    Timeout,
    Server,
    Authentication,
    Validation,
    Other,
}

impl ProviderErrorKind {
    /// Default retry classification for this kind.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Network | Self::Timeout | Self::Server
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Server => "server",
            Self::Authentication => "authentication",
            Self::Validation => "validation",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by the model-call collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    /// Create an error whose retry flag follows the kind's default.
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
        }
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimit, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Server, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Authentication, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Validation, message)
    }

    /// Override the retry classification.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// Serializable description of the last error a task saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl ErrorDescriptor {
    pub fn rate_limit_timeout(waited: Duration) -> Self {
        Self {
            kind: "rate_limit_timeout".to_string(),
            message: format!("no rate limit token within {}ms", waited.as_millis()),
            retryable: true,
        }
    }

    pub fn worker_lost() -> Self {
        Self {
            kind: "internal".to_string(),
            message: "worker stopped unexpectedly before the task finished".to_string(),
            retryable: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: "cancelled".to_string(),
            message: "batch was cancelled before the task finished".to_string(),
            retryable: false,
        }
    }
}

impl From<&ProviderError> for ErrorDescriptor {
    fn from(e: &ProviderError) -> Self {
        Self {
            kind: e.kind.as_str().to_string(),
            message: e.message.clone(),
            retryable: e.retryable,
        }
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
