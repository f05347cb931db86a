//! Start and resume batches end to end: parse, persist, execute, report.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, CheckpointWriter};
use crate::error::{BatchError, ParseError, Result};
use crate::executor::{
    BatchControl, ExecutionSummary, Executor, ExecutorConfig, StopReason, TaskFailure, UsageTotals,
};
use crate::job::{BatchCounts, BatchJob, BatchStatus, new_batch_id};
use crate::output::{OutputFormat, OutputWriter};
use crate::parser::{InputFormat, ParseOptions, ParsedInput, parse_file};
use crate::provider::ModelProvider;
use crate::store::BatchStore;
use crate::task::{PromptTask, TaskStatus};
use crate::template::PromptTemplate;

/// Everything needed to start a new batch.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source: PathBuf,
    /// Detected from the file extension when unset.
    pub input_format: Option<InputFormat>,
    pub template: Option<String>,
    pub model: String,
    pub system_prompt: Option<String>,
    /// Defaults to `results.csv` in the batch directory.
    pub output_path: Option<PathBuf>,
    /// Detected from the output extension when unset.
    pub output_format: Option<OutputFormat>,
    pub strict: bool,
    pub max_prompts: Option<usize>,
    /// Use a caller-chosen id instead of a generated one.
    pub batch_id: Option<String>,
    pub settings: ExecutorConfig,
}

impl RunRequest {
    pub fn new(source: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            input_format: None,
            template: None,
            model: model.into(),
            system_prompt: None,
            output_path: None,
            output_format: None,
            strict: false,
            max_prompts: None,
            batch_id: None,
            settings: ExecutorConfig::default(),
        }
    }
}

/// Final summary of a run, handed to the caller (and to cost tracking).
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub job: BatchJob,
    pub stop_reason: Option<StopReason>,
    pub last_contiguous: u64,
    pub failures: Vec<TaskFailure>,
    pub parse_errors: Vec<ParseError>,
    pub usage: UsageTotals,
    pub output_path: PathBuf,
    /// Succeeded tasks carried over from an earlier run.
    pub reused: usize,
    /// Provider calls made by this run.
    pub attempts: u64,
}

/// Runs batches against one provider and one store.
pub struct BatchRunner {
    store: BatchStore,
    provider: Arc<dyn ModelProvider>,
}

impl BatchRunner {
    pub fn new(store: BatchStore, provider: Arc<dyn ModelProvider>) -> Self {
        Self { store, provider }
    }

    pub fn store(&self) -> &BatchStore {
        &self.store
    }

    /// Parse the source, persist a new job and run it.
    pub async fn start(&self, request: RunRequest, control: &BatchControl) -> Result<BatchReport> {
        request.settings.validate()?;

        let id = request.batch_id.clone().unwrap_or_else(new_batch_id);
        if self.store.exists(&id) {
            return Err(BatchError::AlreadyExists(id));
        }

        let input_format = request
            .input_format
            .unwrap_or_else(|| InputFormat::from_path(&request.source));
        let mut job = BatchJob::new(&request.source, input_format, &request.model);
        job.id = id;
        job.template = request.template.clone();
        job.system_prompt = request.system_prompt.clone();
        job.strict = request.strict;
        job.max_prompts = request.max_prompts;
        job.settings = request.settings.clone();
        let output_path = request
            .output_path
            .clone()
            .unwrap_or_else(|| self.store.batch_dir(&job.id).join("results.csv"));
        job.output_format = Some(
            request
                .output_format
                .unwrap_or_else(|| OutputFormat::from_path(&output_path)),
        );
        job.output_path = Some(output_path);

        let parsed = match parse_file(&job.source, &parse_options(&job)).await {
            Ok(parsed) => parsed,
            Err(e) => {
                job.mark_finished(BatchStatus::Failed);
                job.last_error = Some(e.to_string());
                self.store.save_job(&job).await?;
                return Err(e);
            }
        };

        job.counts = BatchCounts::new(parsed.tasks.len());
        job.parse_errors = parsed.errors.len();
        self.store.save_job(&job).await?;
        info!(
            batch_id = %job.id,
            source = %job.source.display(),
            tasks = parsed.tasks.len(),
            parse_errors = parsed.errors.len(),
            "Created batch"
        );

        let checkpoint = CheckpointWriter::new(
            self.store.checkpoint_store(&job.id),
            job.settings.flush,
        );
        self.execute(job, parsed, checkpoint, None, control).await
    }

    /// Continue a batch from its checkpoint. Succeeded tasks are never
    /// dispatched again; everything else is queued afresh.
    pub async fn resume(&self, id_or_prefix: &str, control: &BatchControl) -> Result<BatchReport> {
        let mut job = self.store.find_job(id_or_prefix).await?;
        self.store.clear_cancel(&job.id).await?;

        let parsed = parse_file(&job.source, &parse_options(&job)).await?;
        job.parse_errors = parsed.errors.len();

        let store = self.store.checkpoint_store(&job.id);
        let (checkpoint, writer) = match store.load_for_resume().await? {
            Some(checkpoint) => {
                let writer = CheckpointWriter::resume(store, job.settings.flush, &checkpoint);
                (Some(checkpoint), writer)
            }
            None => {
                info!(batch_id = %job.id, "No checkpoint found, starting from the beginning");
                (None, CheckpointWriter::new(store, job.settings.flush))
            }
        };

        if job.status == BatchStatus::Running {
            warn!(batch_id = %job.id, "Batch was left running; assuming the previous process died");
        }
        info!(batch_id = %job.id, previous = %job.status, "Resuming batch");
        self.execute(job, parsed, writer, checkpoint.as_ref(), control)
            .await
    }

    async fn execute(
        &self,
        mut job: BatchJob,
        parsed: ParsedInput,
        mut checkpoint: CheckpointWriter,
        previous: Option<&Checkpoint>,
        control: &BatchControl,
    ) -> Result<BatchReport> {
        let ParsedInput {
            mut tasks,
            errors: parse_errors,
            fields,
        } = parsed;

        let reused = match previous {
            Some(previous) => restore_succeeded(&mut tasks, previous)?,
            None => 0,
        };

        let output_path = job
            .output_path
            .clone()
            .unwrap_or_else(|| self.store.batch_dir(&job.id).join("results.csv"));
        let output_format = job
            .output_format
            .unwrap_or_else(|| OutputFormat::from_path(&output_path));
        let columns = if job.input_format == InputFormat::Csv {
            fields
        } else {
            Vec::new()
        };
        let mut output = OutputWriter::new(&output_path, output_format, columns);
        output.seed(tasks.iter().filter_map(|t| t.result.clone()));

        let executor = Executor::new(job.settings.clone(), Arc::clone(&self.provider));
        let summary = executor
            .execute(
                &mut job,
                tasks,
                &mut checkpoint,
                &mut output,
                &self.store,
                control,
            )
            .await?;

        Ok(report(job, summary, parse_errors, output_path, reused))
    }
}

fn parse_options(job: &BatchJob) -> ParseOptions {
    ParseOptions::new(job.input_format)
        .with_template(job.template.as_deref().map(PromptTemplate::parse))
        .strict(job.strict)
        .max_prompts(job.max_prompts)
}

/// Mark tasks the checkpoint recorded as succeeded. Returns how many.
fn restore_succeeded(tasks: &mut [PromptTask], checkpoint: &Checkpoint) -> Result<usize> {
    if let Some((&last_seq, _)) = checkpoint.tasks.last_key_value()
        && last_seq > tasks.len() as u64
    {
        return Err(BatchError::Corrupted(format!(
            "checkpoint references task {last_seq} but the input has {} tasks",
            tasks.len()
        )));
    }

    let mut restored = 0;
    for record in checkpoint.succeeded() {
        let Some(result) = &record.result else {
            continue;
        };
        let Some(task) = tasks.iter_mut().find(|t| t.seq == record.seq) else {
            continue;
        };
        if task.prompt != result.prompt {
            return Err(BatchError::Corrupted(format!(
                "input changed since the checkpoint was written (task {})",
                record.seq
            )));
        }
        task.status = TaskStatus::Succeeded;
        task.attempts = record.attempts;
        task.result = Some(result.clone());
        restored += 1;
    }
    Ok(restored)
}

fn report(
    job: BatchJob,
    summary: ExecutionSummary,
    parse_errors: Vec<ParseError>,
    output_path: PathBuf,
    reused: usize,
) -> BatchReport {
    BatchReport {
        job,
        stop_reason: summary.stop_reason,
        last_contiguous: summary.last_contiguous,
        failures: summary.failures,
        parse_errors,
        usage: summary.usage,
        output_path,
        reused,
        attempts: summary.attempts,
    }
}
