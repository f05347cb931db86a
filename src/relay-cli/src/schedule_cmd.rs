//! Schedule command: prompts that run once at a time or on an interval.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, Utc};
use clap::Parser;
use relay_common::ProviderKind;
use relay_scheduler::{JobRun, Schedule, ScheduledJob, SchedulerService};

use crate::context::CliContext;
use crate::styled_output::{MessageType, print_dim, print_info, print_success, styled_label};

/// Schedule CLI command.
#[derive(Debug, Parser)]
pub struct ScheduleCli {
    #[command(subcommand)]
    pub subcommand: ScheduleSubcommand,
}

/// Schedule subcommands.
#[derive(Debug, clap::Subcommand)]
pub enum ScheduleSubcommand {
    /// Schedule a prompt
    #[command(visible_alias = "new")]
    Add(ScheduleAddArgs),

    /// List scheduled prompts
    #[command(visible_alias = "ls")]
    List(ScheduleListArgs),

    /// Remove a scheduled prompt and its history
    #[command(visible_alias = "rm")]
    Remove(ScheduleRemoveArgs),

    /// Run a scheduled prompt now without changing its schedule
    Run(ScheduleRunArgs),

    /// Show recent runs of a scheduled prompt
    #[command(visible_alias = "history")]
    Runs(ScheduleRunsArgs),

    /// Run due prompts until interrupted
    Daemon(ScheduleDaemonArgs),
}

/// Arguments for schedule add.
#[derive(Debug, Parser)]
pub struct ScheduleAddArgs {
    /// Prompt to send
    pub prompt: String,

    /// Run once at this time (RFC 3339, e.g. 2026-01-01T09:00:00Z)
    #[arg(long, conflicts_with = "every", required_unless_present = "every")]
    pub at: Option<String>,

    /// Run repeatedly at this interval (e.g. 90s, 15m, 2h, 1d)
    #[arg(long)]
    pub every: Option<String>,

    /// Model to call (default: provider.model from config)
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// System prompt
    #[arg(long, short = 's')]
    pub system: Option<String>,

    /// Display name
    #[arg(long)]
    pub name: Option<String>,
}

/// Arguments for schedule list.
#[derive(Debug, Parser)]
pub struct ScheduleListArgs {
    /// Include finished and inactive jobs
    #[arg(long, short = 'a')]
    pub all: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for schedule remove.
#[derive(Debug, Parser)]
pub struct ScheduleRemoveArgs {
    /// Job id or unique prefix
    pub id: String,
}

/// Arguments for schedule run.
#[derive(Debug, Parser)]
pub struct ScheduleRunArgs {
    /// Job id or unique prefix
    pub id: String,

    /// Provider to use (echo or openai)
    #[arg(long, short = 'p')]
    pub provider: Option<ProviderKind>,
}

/// Arguments for schedule runs.
#[derive(Debug, Parser)]
pub struct ScheduleRunsArgs {
    /// Job id or unique prefix
    pub id: String,

    /// Maximum runs to show
    #[arg(long, short = 'n', default_value_t = 10)]
    pub limit: usize,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for schedule daemon.
#[derive(Debug, Parser)]
pub struct ScheduleDaemonArgs {
    /// Seconds between checks for due prompts
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_secs: u64,

    /// Provider to use (echo or openai)
    #[arg(long, short = 'p')]
    pub provider: Option<ProviderKind>,
}

impl ScheduleCli {
    pub async fn run(self, ctx: &CliContext) -> Result<()> {
        match self.subcommand {
            ScheduleSubcommand::Add(args) => add_job(args, ctx).await,
            ScheduleSubcommand::List(args) => list_jobs(args, ctx).await,
            ScheduleSubcommand::Remove(args) => remove_job(args, ctx).await,
            ScheduleSubcommand::Run(args) => run_job(args, ctx).await,
            ScheduleSubcommand::Runs(args) => show_runs(args, ctx).await,
            ScheduleSubcommand::Daemon(args) => run_daemon(args, ctx).await,
        }
    }
}

/// Build a job from `add` arguments.
pub fn build_job(args: &ScheduleAddArgs, model: String, now: DateTime<Utc>) -> Result<ScheduledJob> {
    if args.prompt.trim().is_empty() {
        bail!("Prompt cannot be empty");
    }
    let schedule = match (&args.at, &args.every) {
        (Some(at), None) => Schedule::parse("once", at)?,
        (None, Some(every)) => Schedule::parse("every", every)?,
        _ => bail!("Specify exactly one of --at or --every"),
    };
    if let Schedule::Once { at } = schedule
        && at <= now
    {
        bail!("--at {} is in the past", at.to_rfc3339());
    }
    Ok(ScheduledJob::new(args.prompt.clone(), model, schedule, now)
        .with_name(args.name.clone())
        .with_system_prompt(args.system.clone()))
}

async fn add_job(args: ScheduleAddArgs, ctx: &CliContext) -> Result<()> {
    let job = build_job(&args, ctx.model(args.model.clone()), Utc::now())?;
    ctx.schedule_store()
        .add_job(&job)
        .await
        .context("Failed to save scheduled job")?;

    print_success(&format!("Scheduled {} ({})", short(&job.id), job.schedule));
    if let Some(next) = job.next_run {
        print_dim(&format!("Next run: {}", format_time(next)));
    }
    print_dim("Jobs run while 'relay schedule daemon' is active.");
    Ok(())
}

async fn list_jobs(args: ScheduleListArgs, ctx: &CliContext) -> Result<()> {
    let jobs = ctx.schedule_store().list_jobs(!args.all).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No scheduled prompts.");
        println!();
        println!("Add one with 'relay schedule add <prompt> --every 1h'.");
        return Ok(());
    }

    println!("{:<10} {:<20} {:<17} {:<17} NAME", "ID", "SCHEDULE", "NEXT RUN", "LAST RUN");
    println!("{}", "-".repeat(80));
    for job in &jobs {
        let next = match job.next_run {
            Some(at) if job.active => format_time(at),
            _ => "-".to_string(),
        };
        let last = job.last_run.map(format_time).unwrap_or_else(|| "never".to_string());
        println!(
            "{:<10} {:<20} {:<17} {:<17} {}",
            short(&job.id),
            job.schedule.to_string(),
            next,
            last,
            job.display_name()
        );
    }
    Ok(())
}

async fn remove_job(args: ScheduleRemoveArgs, ctx: &CliContext) -> Result<()> {
    let job = ctx.schedule_store().remove_job(&args.id).await?;
    print_success(&format!("Removed {} ({})", short(&job.id), job.display_name()));
    Ok(())
}

async fn run_job(args: ScheduleRunArgs, ctx: &CliContext) -> Result<()> {
    let service = SchedulerService::new(ctx.schedule_store(), ctx.provider(args.provider)?);
    let run = service.run_now(&args.id).await?;
    print_run(&run);
    if !run.success {
        bail!("Scheduled prompt {} failed", short(&run.job_id));
    }
    Ok(())
}

async fn show_runs(args: ScheduleRunsArgs, ctx: &CliContext) -> Result<()> {
    let store = ctx.schedule_store();
    let job = store.get_job(&args.id).await?;
    let runs = store.runs(&job.id, args.limit).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("{} has not run yet.", job.display_name());
        return Ok(());
    }
    for run in &runs {
        print_run(run);
    }
    Ok(())
}

async fn run_daemon(args: ScheduleDaemonArgs, ctx: &CliContext) -> Result<()> {
    let service = SchedulerService::new(ctx.schedule_store(), ctx.provider(args.provider)?)
        .with_poll_interval(Duration::from_secs(args.poll_secs));
    let handle = Arc::new(service).start();
    print_info(&format!(
        "Scheduler running, checking every {}s (Ctrl+C to stop)",
        args.poll_secs
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    print_info("Stopping scheduler");
    handle.stop().await;
    Ok(())
}

fn print_run(run: &JobRun) {
    let label = if run.success {
        styled_label(MessageType::Success, "ok")
    } else {
        styled_label(MessageType::Error, "failed")
    };
    println!(
        "{} {} (tokens in/out: {}/{})",
        format_time(run.executed_at),
        label,
        run.input_tokens,
        run.output_tokens
    );
    if let Some(response) = &run.response {
        println!("  {}", response.trim_end().replace('\n', "\n  "));
    }
    if let Some(error) = &run.error {
        println!("  Error: {error}");
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
