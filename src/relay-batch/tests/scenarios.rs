//! End-to-end batch runs through [`BatchRunner`]: parse, execute, checkpoint,
//! resume and write the output artifact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use relay_batch::{
    BatchControl, BatchError, BatchRunner, BatchStatus, BatchStore, ExecutorConfig, FlushPolicy,
    ModelProvider, ModelRequest, ModelResponse, ProviderError, RateLimitConfig, RetryPolicy,
    RunRequest, StopReason, TaskStatus,
};

// =============================================================================
// Scripted provider
// =============================================================================

type Script = dyn Fn(&str, u32) -> Result<ModelResponse, ProviderError> + Send + Sync;

/// Answers by prompt text and attempt number, recording every call.
struct ScriptedProvider {
    script: Box<Script>,
    latency: HashMap<String, Duration>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new(
        script: impl Fn(&str, u32) -> Result<ModelResponse, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            latency: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn echo() -> Self {
        Self::new(|prompt, _| Ok(ModelResponse::text(format!("re: {prompt}")).with_usage(3, 2)))
    }

    fn with_latency(mut self, prompt: &str, latency: Duration) -> Self {
        self.latency.insert(prompt.to_string(), latency);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, prompt: &str) -> usize {
        self.calls().iter().filter(|p| *p == prompt).count()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.prompt.clone());
            calls.iter().filter(|p| **p == request.prompt).count() as u32
        };
        if let Some(latency) = self.latency.get(&request.prompt) {
            tokio::time::sleep(*latency).await;
        }
        (self.script)(&request.prompt, attempt)
    }
}

// =============================================================================
// Helpers
// =============================================================================

struct Workspace {
    dir: TempDir,
    store: BatchStore,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = BatchStore::new(dir.path().join("batches"));
        Self { dir, store }
    }

    fn input(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn runner(&self, provider: Arc<ScriptedProvider>) -> BatchRunner {
        BatchRunner::new(self.store.clone(), provider)
    }
}

fn settings(concurrency: usize) -> ExecutorConfig {
    ExecutorConfig {
        concurrency,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: 0.0,
        },
        flush: FlushPolicy {
            every: 1,
            interval: Duration::from_millis(50),
        },
        jitter_seed: Some(1),
        ..Default::default()
    }
}

fn request(source: &Path, id: &str, settings: ExecutorConfig) -> RunRequest {
    let mut request = RunRequest::new(source, "test-model");
    request.batch_id = Some(id.to_string());
    request.settings = settings;
    request
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

/// Answers `p<n>` with `r<n>`.
fn numbered(prompt: &str, _attempt: u32) -> Result<ModelResponse, ProviderError> {
    Ok(ModelResponse::text(format!("r{}", &prompt[1..])))
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_csv_batch_writes_rows_in_source_order() {
    let ws = Workspace::new();
    let source = ws.input(
        "people.csv",
        "name,topic\nAda,math\nLinus,\"kernels, mostly\"\nGrace,compilers\n",
    );
    let provider = Arc::new(ScriptedProvider::echo());
    let runner = ws.runner(Arc::clone(&provider));

    let mut request = request(&source, "csv-order", settings(1));
    request.template = Some("{name} asks about {topic}".to_string());
    request.settings.rate_limit = Some(RateLimitConfig::per_second(1000));

    let report = runner.start(request, &BatchControl::new()).await.unwrap();

    assert_eq!(report.job.status, BatchStatus::Completed);
    assert_eq!(report.job.counts.succeeded, 3);
    assert_eq!(report.last_contiguous, 3);
    assert_eq!(report.usage.input_tokens, 9);
    assert_eq!(
        provider.calls(),
        vec![
            "Ada asks about math",
            "Linus asks about kernels, mostly",
            "Grace asks about compilers",
        ]
    );
    assert_eq!(
        read(&report.output_path),
        "seq,name,topic,response,success,error,input_tokens,output_tokens\n\
         1,Ada,math,re: Ada asks about math,true,,3,2\n\
         2,Linus,\"kernels, mostly\",\"re: Linus asks about kernels, mostly\",true,,3,2\n\
         3,Grace,compilers,re: Grace asks about compilers,true,,3,2\n"
    );
}

#[tokio::test(start_paused = true)]
async fn test_persistent_failure_is_isolated() {
    let ws = Workspace::new();
    let source = ws.input("prompts.txt", "p1\np2\np3\np4\np5\n");
    let provider = Arc::new(ScriptedProvider::new(|prompt, _| {
        if prompt == "p2" {
            Err(ProviderError::server("upstream unavailable"))
        } else {
            Ok(ModelResponse::text(prompt.to_uppercase()))
        }
    }));
    let runner = ws.runner(Arc::clone(&provider));

    let mut settings = settings(2);
    settings.retry.max_attempts = 2;
    let report = runner
        .start(request(&source, "isolated", settings), &BatchControl::new())
        .await
        .unwrap();

    assert_eq!(report.job.status, BatchStatus::Completed);
    assert_eq!(report.job.counts.succeeded, 4);
    assert_eq!(report.job.counts.failed, 1);
    assert_eq!(provider.calls_for("p2"), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].seq, 2);
    assert_eq!(report.failures[0].attempts, 2);
    assert_eq!(report.failures[0].error.kind, "server");
    // The failed task holds the marker back.
    assert_eq!(report.last_contiguous, 1);

    let output = read(&report.output_path);
    assert!(output.contains("2,p2,,false,[server] upstream unavailable,0,0"));
    assert!(output.contains("5,p5,P5,true,,0,0"));
}

#[tokio::test]
async fn test_pause_then_resume_reuses_completed_work() {
    let ws = Workspace::new();
    let source = ws.input("prompts.txt", "p1\np2\np3\np4\np5\n");
    let control = BatchControl::new();

    let pauser = control.clone();
    let provider = Arc::new(
        ScriptedProvider::new(move |prompt, attempt| match (prompt, attempt) {
            ("p2", 1) => Err(ProviderError::network("connection reset")),
            ("p3", _) => {
                pauser.pause();
                Ok(ModelResponse::text("r3"))
            }
            _ => Ok(ModelResponse::text(format!("r{}", &prompt[1..]))),
        })
        .with_latency("p1", Duration::from_millis(10))
        .with_latency("p2", Duration::from_millis(300))
        .with_latency("p3", Duration::from_millis(10)),
    );
    let runner = ws.runner(Arc::clone(&provider));

    let first = runner
        .start(request(&source, "pause-resume", settings(2)), &control)
        .await
        .unwrap();

    assert_eq!(first.job.status, BatchStatus::Paused);
    assert_eq!(first.stop_reason, Some(StopReason::Paused));
    assert_eq!(first.job.counts.succeeded, 2);
    assert_eq!(first.last_contiguous, 1);
    let checkpoint = ws
        .store
        .checkpoint_store("pause-resume")
        .load()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.last_contiguous, 1);
    assert_eq!(checkpoint.status_of(1), Some(TaskStatus::Succeeded));
    assert_eq!(checkpoint.status_of(3), Some(TaskStatus::Succeeded));
    assert_eq!(checkpoint.status_of(4), None);

    let mut job = ws.store.load_job("pause-resume").await.unwrap();
    job.settings.concurrency = 1;
    ws.store.save_job(&job).await.unwrap();

    let first_run_calls = provider.calls().len();
    let second = runner
        .resume("pause-resume", &BatchControl::new())
        .await
        .unwrap();

    assert_eq!(second.job.status, BatchStatus::Completed);
    assert_eq!(second.reused, 2);
    assert_eq!(second.last_contiguous, 5);
    assert_eq!(
        provider.calls()[first_run_calls..].to_vec(),
        vec!["p2", "p4", "p5"]
    );
    assert_eq!(provider.calls_for("p1"), 1);
    assert_eq!(provider.calls_for("p3"), 1);

    let output = read(&second.output_path);
    let rows: Vec<&str> = output.lines().skip(1).collect();
    assert_eq!(
        rows,
        vec![
            "1,p1,r1,true,,0,0",
            "2,p2,r2,true,,0,0",
            "3,p3,r3,true,,0,0",
            "4,p4,r4,true,,0,0",
            "5,p5,r5,true,,0,0",
        ]
    );
}

#[tokio::test]
async fn test_resume_after_crash_redoes_only_unflushed_work() {
    let ws = Workspace::new();
    let source = ws.input("prompts.txt", "p1\np2\np3\np4\np5\n");

    // p4 never answers, so the process dies with p3 recorded but not flushed.
    let stuck = Arc::new(
        ScriptedProvider::new(numbered).with_latency("p4", Duration::from_secs(3600)),
    );
    let mut settings = settings(1);
    settings.flush = FlushPolicy {
        every: 2,
        interval: Duration::from_secs(3600),
    };
    let request = request(&source, "crash", settings);
    let runner = ws.runner(Arc::clone(&stuck));
    let run = tokio::spawn(async move { runner.start(request, &BatchControl::new()).await });

    let journal = ws.store.checkpoint_store("crash").journal_path();
    wait_until(|| {
        stuck.calls_for("p4") == 1
            && std::fs::read_to_string(&journal).is_ok_and(|c| c.lines().count() == 2)
    })
    .await;
    run.abort();
    assert!(run.await.unwrap_err().is_cancelled());

    // A write cut short by the crash.
    let mut torn = std::fs::OpenOptions::new().append(true).open(&journal).unwrap();
    std::io::Write::write_all(&mut torn, b"{\"seq\":3,\"status\":\"succ").unwrap();
    drop(torn);

    let job = ws.store.load_job("crash").await.unwrap();
    assert_eq!(job.status, BatchStatus::Running);
    assert_eq!(stuck.calls(), vec!["p1", "p2", "p3", "p4"]);

    let fresh = Arc::new(ScriptedProvider::new(numbered));
    let report = ws
        .runner(Arc::clone(&fresh))
        .resume("crash", &BatchControl::new())
        .await
        .unwrap();

    assert_eq!(report.job.status, BatchStatus::Completed);
    assert_eq!(report.reused, 2);
    assert_eq!(report.last_contiguous, 5);
    assert_eq!(fresh.calls(), vec!["p3", "p4", "p5"]);

    let checkpoint = ws.store.checkpoint_store("crash").load().await.unwrap().unwrap();
    assert_eq!(checkpoint.tasks.len(), 5);
    assert!(read(&journal).ends_with('\n'));

    let output = read(&report.output_path);
    let rows: Vec<&str> = output.lines().skip(1).collect();
    assert_eq!(
        rows,
        vec![
            "1,p1,r1,true,,0,0",
            "2,p2,r2,true,,0,0",
            "3,p3,r3,true,,0,0",
            "4,p4,r4,true,,0,0",
            "5,p5,r5,true,,0,0",
        ]
    );
}

#[tokio::test]
async fn test_empty_input_completes_with_header_only() {
    let ws = Workspace::new();
    let source = ws.input("empty.csv", "name,topic\n");
    let provider = Arc::new(ScriptedProvider::echo());
    let runner = ws.runner(Arc::clone(&provider));

    let mut request = request(&source, "empty", settings(2));
    request.template = Some("{name}: {topic}".to_string());
    let report = runner.start(request, &BatchControl::new()).await.unwrap();

    assert_eq!(report.job.status, BatchStatus::Completed);
    assert_eq!(report.job.counts.total, 0);
    assert!(provider.calls().is_empty());
    assert_eq!(
        read(&report.output_path),
        "seq,name,topic,response,success,error,input_tokens,output_tokens\n"
    );
}

#[tokio::test]
async fn test_resuming_completed_batch_is_a_no_op() {
    let ws = Workspace::new();
    let source = ws.input("prompts.jsonl", "{\"q\":\"a\"}\n{\"q\":\"b\"}\n{\"q\":\"c\"}\n");
    let provider = Arc::new(ScriptedProvider::echo());
    let runner = ws.runner(Arc::clone(&provider));

    let mut request = request(&source, "idempotent", settings(3));
    request.template = Some("say {q}".to_string());
    request.output_path = Some(ws.dir.path().join("out.jsonl"));
    let first = runner.start(request, &BatchControl::new()).await.unwrap();
    let before = read(&first.output_path);
    assert_eq!(provider.calls().len(), 3);

    let second = runner
        .resume("idempotent", &BatchControl::new())
        .await
        .unwrap();

    assert_eq!(second.job.status, BatchStatus::Completed);
    assert_eq!(second.reused, 3);
    assert_eq!(second.attempts, 0);
    assert_eq!(provider.calls().len(), 3);
    assert_eq!(read(&second.output_path), before);
}

#[tokio::test]
async fn test_resume_without_checkpoint_starts_over() {
    let ws = Workspace::new();
    let source = ws.input("prompts.txt", "one\ntwo\n");
    let provider = Arc::new(ScriptedProvider::echo());
    let runner = ws.runner(Arc::clone(&provider));

    let stopped = BatchControl::new();
    stopped.pause();
    let first = runner
        .start(request(&source, "no-checkpoint", settings(1)), &stopped)
        .await
        .unwrap();
    assert_eq!(first.job.status, BatchStatus::Paused);
    assert!(provider.calls().is_empty());

    ws.store
        .checkpoint_store("no-checkpoint")
        .clear()
        .await
        .unwrap();

    let second = runner
        .resume("no-check", &BatchControl::new())
        .await
        .unwrap();
    assert_eq!(second.job.status, BatchStatus::Completed);
    assert_eq!(second.reused, 0);
    assert_eq!(provider.calls(), vec!["one", "two"]);
}

#[tokio::test]
async fn test_missing_placeholder_fails_before_dispatch() {
    let ws = Workspace::new();
    let source = ws.input("people.csv", "name\nAda\n");
    let provider = Arc::new(ScriptedProvider::echo());
    let runner = ws.runner(Arc::clone(&provider));

    let mut request = request(&source, "schema", settings(1));
    request.template = Some("{name} likes {color}".to_string());
    let err = runner
        .start(request, &BatchControl::new())
        .await
        .unwrap_err();

    match err {
        BatchError::Schema(schema) => assert_eq!(schema.missing, vec!["color".to_string()]),
        other => panic!("expected schema error, got {other:?}"),
    }
    assert!(provider.calls().is_empty());
    let job = ws.store.load_job("schema").await.unwrap();
    assert_eq!(job.status, BatchStatus::Failed);
    assert!(job.last_error.is_some());
}
