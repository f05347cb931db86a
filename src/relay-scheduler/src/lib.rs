//! Scheduled prompts for Relay.
//!
//! Jobs are persisted in a JSON file by [`ScheduleStore`]; the
//! [`SchedulerService`] polls for due jobs with an injected [`Clock`] and
//! sends each through the same [`relay_batch::ModelProvider`] seam the batch
//! engine uses.

pub mod clock;
pub mod error;
pub mod job;
pub mod service;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, SchedulerError};
pub use job::{JobRun, Schedule, ScheduledJob};
pub use service::{DEFAULT_POLL_INTERVAL, SchedulerHandle, SchedulerService};
pub use store::{DEFAULT_HISTORY_LIMIT, ScheduleStore};
