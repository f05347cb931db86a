//! Batch-level stop signal shared by the caller, the coordinator and workers.

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Why a batch stopped before every task reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Explicit cancel: queued tasks become cancelled.
    Cancelled,
    /// Interrupted by the operator: queued tasks stay pending for resume.
    Paused,
    /// The overall batch timeout elapsed. Treated like a pause.
    TimedOut,
    /// A task failed and stop-on-error is set.
    StopOnError,
    /// Checkpoint or output I/O failed.
    Fatal,
}

impl StopReason {
    /// Whether tasks still queued at shutdown are marked cancelled.
    pub fn cancels_queued(self) -> bool {
        matches!(self, Self::Cancelled | Self::StopOnError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
            Self::TimedOut => "timed_out",
            Self::StopOnError => "stop_on_error",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative stop handle. Cloning shares the same signal.
///
/// The first reason given wins; later calls still return but do not change
/// the recorded reason.
#[derive(Debug, Clone, Default)]
pub struct BatchControl {
    token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
}

impl BatchControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal a stop. Returns true if this call set the reason.
    pub fn stop(&self, reason: StopReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn cancel(&self) -> bool {
        self.stop(StopReason::Cancelled)
    }

    pub fn pause(&self) -> bool {
        self.stop(StopReason::Paused)
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop has been signalled.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }
}
