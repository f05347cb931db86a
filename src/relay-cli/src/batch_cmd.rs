//! Batch command: run prompt files through the execution engine.
//!
//! - `run` starts a batch (or resumes one with `--resume --id`)
//! - `resume` continues a paused, cancelled or failed batch
//! - `status`, `list` and `failures` inspect persisted batches
//! - `cancel` asks a running batch in another process to stop
//! - `purge` archives or deletes finished batches

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Args, Parser};
use relay_batch::{
    BatchControl, BatchJob, BatchReport, BatchRunner, BatchStatus, BatchStore, ExecutorConfig,
    FlushPolicy, InputFormat, OutputFormat, RateLimitConfig, RetryPolicy, RunRequest, TaskStatus,
    new_batch_id,
};
use relay_common::{BatchSettings, ProviderKind};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::CliContext;
use crate::styled_output::{
    MessageType, print_dim, print_error, print_info, print_success, print_warning, styled_label,
};

/// How often a running batch looks for a cancel request from another process.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Failures printed after a run before the list is cut short.
const MAX_FAILURES_SHOWN: usize = 10;

/// Batch CLI command.
#[derive(Debug, Parser)]
pub struct BatchCli {
    #[command(subcommand)]
    pub subcommand: BatchSubcommand,
}

/// Batch subcommands.
#[derive(Debug, clap::Subcommand)]
pub enum BatchSubcommand {
    /// Run every prompt in a file
    Run(BatchRunArgs),

    /// Continue an interrupted batch from its checkpoint
    Resume(BatchResumeArgs),

    /// Show progress of one batch
    #[command(visible_alias = "show")]
    Status(BatchStatusArgs),

    /// List batches, newest first
    #[command(visible_alias = "ls")]
    List(BatchListArgs),

    /// Show failed tasks of a batch
    Failures(BatchFailuresArgs),

    /// Ask a running batch to stop
    Cancel(BatchCancelArgs),

    /// Archive or delete finished batches
    #[command(visible_alias = "rm")]
    Purge(BatchPurgeArgs),
}

/// Executor overrides for `run`. Unset flags fall back to `[batch]`
/// in the config file.
#[derive(Debug, Clone, Default, Args)]
pub struct ExecArgs {
    /// Concurrent workers
    #[arg(long, short = 'j', value_name = "N")]
    pub concurrency: Option<usize>,

    /// Maximum provider calls per minute
    #[arg(long, value_name = "N")]
    pub rate_limit: Option<u32>,

    /// Attempts per prompt, including the first
    #[arg(long, value_name = "N")]
    pub max_attempts: Option<u32>,

    /// Timeout for a single provider call, in seconds
    #[arg(long, value_name = "SECS")]
    pub task_timeout: Option<u64>,

    /// Pause the batch after this many seconds
    #[arg(long, value_name = "SECS")]
    pub batch_timeout: Option<u64>,

    /// Stop dispatching after the first failed prompt
    #[arg(long)]
    pub stop_on_error: bool,
}

/// Arguments for batch run.
#[derive(Debug, Parser)]
pub struct BatchRunArgs {
    /// Prompt file (.csv, .json, .jsonl or plain text)
    pub input: PathBuf,

    /// Prompt template with {field} placeholders
    #[arg(long, short = 't')]
    pub template: Option<String>,

    /// Model to call (default: provider.model from config)
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// System prompt sent with every request
    #[arg(long, short = 's')]
    pub system: Option<String>,

    /// Output file (default: results.csv in the batch directory)
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Input format (default: from file extension)
    #[arg(long, value_name = "FORMAT")]
    pub input_format: Option<InputFormat>,

    /// Output format (default: from output extension)
    #[arg(long, value_name = "FORMAT")]
    pub output_format: Option<OutputFormat>,

    /// Fail on the first malformed record instead of skipping it
    #[arg(long)]
    pub strict: bool,

    /// Only run the first N prompts
    #[arg(long, value_name = "N")]
    pub max_prompts: Option<usize>,

    /// Provider to use (echo or openai)
    #[arg(long, short = 'p')]
    pub provider: Option<ProviderKind>,

    /// Batch id (default: generated)
    #[arg(long)]
    pub id: Option<String>,

    /// Resume the batch given by --id if it already exists
    #[arg(long, requires = "id")]
    pub resume: bool,

    #[command(flatten)]
    pub exec: ExecArgs,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for batch resume.
#[derive(Debug, Parser)]
pub struct BatchResumeArgs {
    /// Batch id or unique prefix
    pub id: String,

    /// Provider to use (echo or openai)
    #[arg(long, short = 'p')]
    pub provider: Option<ProviderKind>,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for batch status.
#[derive(Debug, Parser)]
pub struct BatchStatusArgs {
    /// Batch id or unique prefix
    pub id: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for batch list.
#[derive(Debug, Parser)]
pub struct BatchListArgs {
    /// Maximum batches to show
    #[arg(long, short = 'n', default_value_t = 20)]
    pub limit: usize,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for batch failures.
#[derive(Debug, Parser)]
pub struct BatchFailuresArgs {
    /// Batch id or unique prefix
    pub id: String,

    /// Show one task in full
    #[arg(long)]
    pub seq: Option<u64>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for batch cancel.
#[derive(Debug, Parser)]
pub struct BatchCancelArgs {
    /// Batch id or unique prefix
    pub id: String,
}

/// Arguments for batch purge.
#[derive(Debug, Parser)]
pub struct BatchPurgeArgs {
    /// Batch id or unique prefix
    #[arg(required_unless_present = "all_finished", conflicts_with = "all_finished")]
    pub id: Option<String>,

    /// Purge every completed, failed or cancelled batch
    #[arg(long)]
    pub all_finished: bool,

    /// Delete instead of archiving
    #[arg(long)]
    pub delete: bool,
}

impl BatchCli {
    pub async fn run(self, ctx: &CliContext) -> Result<()> {
        match self.subcommand {
            BatchSubcommand::Run(args) => run_batch(args, ctx).await,
            BatchSubcommand::Resume(args) => resume_batch(args, ctx).await,
            BatchSubcommand::Status(args) => show_status(args, ctx).await,
            BatchSubcommand::List(args) => list_batches(args, ctx).await,
            BatchSubcommand::Failures(args) => show_failures(args, ctx).await,
            BatchSubcommand::Cancel(args) => cancel_batch(args, ctx).await,
            BatchSubcommand::Purge(args) => purge_batches(args, ctx).await,
        }
    }
}

/// Merge config defaults with command-line overrides.
pub fn executor_config(settings: &BatchSettings, args: &ExecArgs) -> ExecutorConfig {
    ExecutorConfig {
        concurrency: args.concurrency.unwrap_or(settings.concurrency),
        rate_limit: args
            .rate_limit
            .or(settings.rate_limit_per_minute)
            .map(RateLimitConfig::per_minute),
        retry: RetryPolicy {
            max_attempts: args.max_attempts.unwrap_or(settings.max_attempts),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: settings.jitter,
        },
        task_timeout: Duration::from_secs(args.task_timeout.unwrap_or(settings.task_timeout_secs)),
        batch_timeout: args.batch_timeout.map(Duration::from_secs),
        acquire_timeout: None,
        stop_on_error: args.stop_on_error,
        flush: FlushPolicy {
            every: settings.flush_every,
            interval: Duration::from_millis(settings.flush_interval_ms),
        },
        jitter_seed: None,
    }
}

async fn run_batch(args: BatchRunArgs, ctx: &CliContext) -> Result<()> {
    let store = ctx.batch_store().await?;

    if args.resume
        && let Some(id) = &args.id
        && store.exists(id)
    {
        print_info(&format!("Batch {id} exists, resuming"));
        let resume = BatchResumeArgs {
            id: id.clone(),
            provider: args.provider,
            json: args.json,
        };
        return resume_batch(resume, ctx).await;
    }

    if !args.input.exists() {
        bail!("Input file not found: {}", args.input.display());
    }

    let provider = ctx.provider(args.provider)?;
    let runner = BatchRunner::new(store.clone(), provider);

    let id = args.id.clone().unwrap_or_else(new_batch_id);
    let mut request = RunRequest::new(args.input.clone(), ctx.model(args.model.clone()));
    request.input_format = args.input_format;
    request.template = args.template.clone();
    request.system_prompt = args.system.clone();
    request.output_path = args.output.clone();
    request.output_format = args.output_format;
    request.strict = args.strict;
    request.max_prompts = args.max_prompts;
    request.batch_id = Some(id.clone());
    request.settings = executor_config(&ctx.config.batch, &args.exec);

    debug!(batch_id = %id, settings = ?request.settings, "Starting batch");
    if !args.json {
        print_info(&format!(
            "Running batch {} from {} (Ctrl+C pauses)",
            short(&id),
            args.input.display()
        ));
    }

    let control = BatchControl::new();
    let watcher = spawn_stop_watcher(store, id.clone(), control.clone());
    let result = runner.start(request, &control).await;
    watcher.abort();

    let report = result.with_context(|| format!("Batch {id} could not run"))?;
    finish(&report, args.json)
}

async fn resume_batch(args: BatchResumeArgs, ctx: &CliContext) -> Result<()> {
    let store = ctx.batch_store().await?;
    let job = store.find_job(&args.id).await?;
    if job.status == BatchStatus::Completed {
        print_info(&format!(
            "Batch {} already completed; nothing to resume",
            job.short_id()
        ));
    }

    let provider = ctx.provider(args.provider)?;
    let runner = BatchRunner::new(store.clone(), provider);

    if !args.json {
        print_info(&format!(
            "Resuming batch {} ({}/{} done)",
            job.short_id(),
            job.counts.succeeded,
            job.counts.total
        ));
    }

    let control = BatchControl::new();
    let watcher = spawn_stop_watcher(store, job.id.clone(), control.clone());
    let result = runner.resume(&job.id, &control).await;
    watcher.abort();

    let report = result.with_context(|| format!("Batch {} could not resume", job.id))?;
    finish(&report, args.json)
}

/// Pause on Ctrl+C; cancel when another process drops a cancel marker.
fn spawn_stop_watcher(store: BatchStore, id: String, control: BatchControl) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut poll = tokio::time::interval(CANCEL_POLL_INTERVAL);
        let mut signals = true;
        loop {
            tokio::select! {
                _ = control.stopped() => break,
                res = tokio::signal::ctrl_c(), if signals => match res {
                    Ok(()) => {
                        print_warning("Interrupted, pausing batch (in-flight prompts finish first)");
                        control.pause();
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Cannot listen for Ctrl+C");
                        signals = false;
                    }
                },
                _ = poll.tick() => {
                    if store.cancel_requested(&id) {
                        print_warning("Cancel requested, stopping batch");
                        control.cancel();
                        break;
                    }
                }
            }
        }
    })
}

fn finish(report: &BatchReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print_report(report);
    }

    let job = &report.job;
    if job.status == BatchStatus::Failed {
        match &job.last_error {
            Some(e) => bail!("Batch {} failed: {}", job.short_id(), e),
            None => bail!("Batch {} failed", job.short_id()),
        }
    }
    Ok(())
}

fn print_report(report: &BatchReport) {
    let job = &report.job;
    let counts = job.counts;
    let line = format!(
        "Batch {} {}: {}/{} succeeded, {} failed, {} cancelled",
        job.short_id(),
        job.status,
        counts.succeeded,
        counts.total,
        counts.failed,
        counts.cancelled
    );
    match job.status {
        BatchStatus::Completed if counts.failed == 0 => print_success(&line),
        BatchStatus::Completed | BatchStatus::Paused | BatchStatus::Cancelled => {
            print_warning(&line)
        }
        _ => print_error(&line),
    }

    print_dim(&format!("Output: {}", report.output_path.display()));
    print_dim(&format!(
        "Calls: {} ({} reused from checkpoint), tokens in/out: {}/{}",
        report.attempts, report.reused, report.usage.input_tokens, report.usage.output_tokens
    ));
    if !report.parse_errors.is_empty() {
        print_warning(&format!(
            "{} record(s) skipped while parsing:",
            report.parse_errors.len()
        ));
        for e in report.parse_errors.iter().take(MAX_FAILURES_SHOWN) {
            print_dim(&e.to_string());
        }
    }

    if !report.failures.is_empty() {
        print_warning("Failed prompts:");
        for failure in report.failures.iter().take(MAX_FAILURES_SHOWN) {
            print_dim(&format!(
                "#{} after {} attempt(s): {}",
                failure.seq, failure.attempts, failure.error
            ));
        }
        if report.failures.len() > MAX_FAILURES_SHOWN {
            print_dim(&format!(
                "... and {} more (relay batch failures {})",
                report.failures.len() - MAX_FAILURES_SHOWN,
                job.short_id()
            ));
        }
    }

    if matches!(job.status, BatchStatus::Paused | BatchStatus::Cancelled)
        || (job.status == BatchStatus::Completed && counts.failed > 0)
    {
        print_info(&format!("Resume with: relay batch resume {}", job.short_id()));
    }
}

#[derive(Serialize)]
struct StatusView<'a> {
    #[serde(flatten)]
    job: &'a BatchJob,
    last_contiguous: u64,
    cancel_requested: bool,
}

async fn show_status(args: BatchStatusArgs, ctx: &CliContext) -> Result<()> {
    let store = ctx.batch_store().await?;
    let job = store.find_job(&args.id).await?;
    let last_contiguous = store
        .checkpoint_store(&job.id)
        .load_marker()
        .await?
        .map(|m| m.last_contiguous)
        .unwrap_or(0);
    let cancel_requested = store.cancel_requested(&job.id);

    if args.json {
        let view = StatusView {
            job: &job,
            last_contiguous,
            cancel_requested,
        };
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("Batch {}", job.id);
    println!("{}", "-".repeat(60));
    println!("  Status:      {}", status_label(job.status));
    println!(
        "  Progress:    {}/{} ({:.1}%)",
        job.counts.terminal(),
        job.counts.total,
        job.progress_percent()
    );
    println!(
        "  Tasks:       {} succeeded, {} failed, {} cancelled, {} pending",
        job.counts.succeeded,
        job.counts.failed,
        job.counts.cancelled,
        job.counts.pending()
    );
    println!("  Checkpoint:  all tasks through #{last_contiguous} succeeded");
    println!("  Model:       {}", job.model);
    println!(
        "  Source:      {} ({})",
        job.source.display(),
        job.input_format.as_str()
    );
    if let Some(output) = &job.output_path {
        println!("  Output:      {}", output.display());
    }
    if job.parse_errors > 0 {
        println!("  Skipped:     {} malformed record(s)", job.parse_errors);
    }
    println!("  Created:     {}", format_time(job.created_at));
    if let Some(at) = job.completed_at {
        println!("  Finished:    {}", format_time(at));
    }
    if let Some(e) = &job.last_error {
        println!("  Last error:  {e}");
    }
    if cancel_requested && !job.status.is_finished() {
        println!("  Cancel requested, waiting for the batch to stop");
    }
    Ok(())
}

async fn list_batches(args: BatchListArgs, ctx: &CliContext) -> Result<()> {
    let store = ctx.batch_store().await?;
    let jobs = store.list_jobs(Some(args.limit)).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No batches yet.");
        println!();
        println!("Start one with 'relay batch run <file>'.");
        return Ok(());
    }

    println!(
        "{:<10} {:<11} {:>13} {:<17} MODEL",
        "ID", "STATUS", "DONE", "CREATED"
    );
    println!("{}", "-".repeat(72));
    for job in &jobs {
        // Pad before styling so escape codes don't break alignment.
        let status = format!("{:<11}", job.status.as_str());
        println!(
            "{:<10} {} {:>13} {:<17} {}",
            job.short_id(),
            status_label_padded(job.status, &status),
            format!("{}/{}", job.counts.terminal(), job.counts.total),
            format_time(job.created_at),
            job.model
        );
    }
    Ok(())
}

async fn show_failures(args: BatchFailuresArgs, ctx: &CliContext) -> Result<()> {
    let store = ctx.batch_store().await?;
    let job = store.find_job(&args.id).await?;
    let checkpoint = store
        .checkpoint_store(&job.id)
        .load()
        .await?
        .with_context(|| format!("Batch {} has no checkpoint yet", job.short_id()))?;

    let failed: Vec<_> = checkpoint
        .tasks
        .values()
        .filter(|r| r.status == TaskStatus::Failed)
        .filter(|r| args.seq.is_none_or(|seq| r.seq == seq))
        .collect();

    if let Some(seq) = args.seq
        && failed.is_empty()
    {
        let status = checkpoint
            .status_of(seq)
            .map(|s| s.as_str())
            .unwrap_or("not recorded");
        bail!("Task #{seq} of batch {} did not fail ({status})", job.short_id());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&failed)?);
        return Ok(());
    }

    if failed.is_empty() {
        println!("No failed tasks in batch {}.", job.short_id());
        return Ok(());
    }

    for record in failed {
        let error = record
            .result
            .as_ref()
            .and_then(|r| r.error.as_ref())
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        println!(
            "#{} {} after {} attempt(s)",
            record.seq,
            styled_label(MessageType::Error, "failed"),
            record.attempts
        );
        println!("  Error:  {error}");
        if let Some(result) = &record.result {
            if args.seq.is_some() {
                println!("  Prompt: {}", result.prompt);
            } else {
                println!("  Prompt: {}", truncate(&result.prompt, 70));
            }
        }
    }
    Ok(())
}

async fn cancel_batch(args: BatchCancelArgs, ctx: &CliContext) -> Result<()> {
    let store = ctx.batch_store().await?;
    let job = store.find_job(&args.id).await?;
    if job.status != BatchStatus::Running {
        print_info(&format!(
            "Batch {} is {}, not running; nothing to cancel",
            job.short_id(),
            job.status
        ));
        return Ok(());
    }
    store.request_cancel(&job.id).await?;
    print_success(&format!(
        "Cancel requested for batch {}. In-flight prompts finish first.",
        job.short_id()
    ));
    Ok(())
}

async fn purge_batches(args: BatchPurgeArgs, ctx: &CliContext) -> Result<()> {
    let store = ctx.batch_store().await?;
    let targets: Vec<BatchJob> = if args.all_finished {
        store
            .list_jobs(None)
            .await?
            .into_iter()
            .filter(|j| j.status.is_finished())
            .collect()
    } else {
        let id = args.id.as_deref().unwrap_or_default();
        let job = store.find_job(id).await?;
        if job.status == BatchStatus::Running {
            bail!(
                "Batch {} is running; cancel it before purging",
                job.short_id()
            );
        }
        vec![job]
    };

    if targets.is_empty() {
        println!("No finished batches to purge.");
        return Ok(());
    }

    for job in &targets {
        if args.delete {
            store.delete_job(&job.id).await?;
        } else {
            store.archive_job(&job.id).await?;
        }
    }
    let verb = if args.delete { "Deleted" } else { "Archived" };
    print_success(&format!("{verb} {} batch(es)", targets.len()));
    Ok(())
}

fn status_label(status: BatchStatus) -> String {
    status_label_padded(status, status.as_str())
}

fn status_label_padded(status: BatchStatus, text: &str) -> String {
    let kind = match status {
        BatchStatus::Completed => MessageType::Success,
        BatchStatus::Failed => MessageType::Error,
        BatchStatus::Paused | BatchStatus::Cancelled => MessageType::Warning,
        BatchStatus::Running => MessageType::Info,
        BatchStatus::Pending => MessageType::Dim,
    };
    styled_label(kind, text)
}

fn format_time(at: chrono::DateTime<chrono::Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn truncate(s: &str, max: usize) -> String {
    let line = s.lines().next().unwrap_or_default();
    if line.chars().count() <= max && line.len() == s.len() {
        return line.to_string();
    }
    let cut: String = line.chars().take(max).collect();
    format!("{cut}...")
}
