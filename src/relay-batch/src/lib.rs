//! Batch execution engine for Relay.
//!
//! Turns a file of prompts into concurrently dispatched, rate-limited,
//! retryable and resumable model calls:
//! - [`parser`] reads CSV, JSON, JSON Lines or plain text into tasks
//! - [`ratelimit`] throttles dispatch with a token bucket
//! - [`executor`] runs a worker pool with retry and cooperative cancellation
//! - [`checkpoint`] records progress durably so a run can resume
//! - [`output`] writes one well-formed artifact per batch
//! - [`runner`] ties these together for new and resumed batches

pub mod checkpoint;
pub mod error;
pub mod executor;
pub mod job;
pub mod output;
pub mod parser;
pub mod provider;
pub mod ratelimit;
pub mod retry;
pub mod runner;
pub mod store;
pub mod task;
pub mod template;

mod fs_util;

pub use checkpoint::{Checkpoint, CheckpointStore, CheckpointWriter, FlushPolicy, TaskRecord};
pub use error::{
    BatchError, ErrorDescriptor, ParseError, ProviderError, ProviderErrorKind, Result, SchemaError,
};
pub use executor::{
    BatchControl, ExecutionSummary, Executor, ExecutorConfig, StopReason, TaskFailure, UsageTotals,
};
pub use job::{BatchCounts, BatchJob, BatchStatus, new_batch_id};
pub use output::{OutputFormat, OutputWriter};
pub use parser::{InputFormat, ParseOptions, ParsedInput, parse_file, parse_str};
pub use provider::{ModelProvider, ModelRequest, ModelResponse};
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use retry::{Backoff, RetryPolicy};
pub use runner::{BatchReport, BatchRunner, RunRequest};
pub use store::BatchStore;
pub use task::{PromptTask, TaskResult, TaskStatus};
pub use template::PromptTemplate;
