//! The batch output artifact.
//!
//! Results are kept in sequence order and the whole artifact is rendered and
//! written atomically, so a resumed run rewrites the file from the
//! checkpointed results plus its own without duplicating rows.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ErrorDescriptor, Result};
use crate::fs_util::atomic_write;
use crate::parser::escape_field;
use crate::task::TaskResult;

/// Shape of the output artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Csv,
    Json,
    Jsonl,
    Text,
}

impl OutputFormat {
    /// Pick a format from the file extension; unknown extensions are text.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("csv") => Self::Csv,
            Some("json") => Self::Json,
            Some("jsonl") | Some("ndjson") => Self::Jsonl,
            _ => Self::Text,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Jsonl => "jsonl",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            "jsonl" | "ndjson" => Ok(Self::Jsonl),
            "text" | "txt" => Ok(Self::Text),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

/// One row of structured output.
#[derive(Debug, Serialize)]
struct OutputRecord<'a> {
    seq: u64,
    prompt: &'a str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    variables: &'a BTreeMap<String, String>,
    response: Option<&'a str>,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorDescriptor>,
    input_tokens: u64,
    output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

impl<'a> From<&'a TaskResult> for OutputRecord<'a> {
    fn from(result: &'a TaskResult) -> Self {
        Self {
            seq: result.seq,
            prompt: &result.prompt,
            variables: &result.variables,
            response: result.response.as_deref(),
            success: result.is_success(),
            error: result.error.as_ref(),
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            response_id: result.response_id.as_deref(),
            model: result.provider_model.as_deref(),
        }
    }
}

/// Collects results and writes the artifact.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    path: PathBuf,
    format: OutputFormat,
    /// Input columns carried into CSV output; empty means a `prompt` column.
    columns: Vec<String>,
    results: BTreeMap<u64, TaskResult>,
}

impl OutputWriter {
    pub fn new(path: impl Into<PathBuf>, format: OutputFormat, columns: Vec<String>) -> Self {
        Self {
            path: path.into(),
            format,
            columns,
            results: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Add a result. A second result for the same sequence replaces the first.
    pub fn push(&mut self, result: TaskResult) {
        self.results.insert(result.seq, result);
    }

    /// Add results recovered from a checkpoint.
    pub fn seed<I: IntoIterator<Item = TaskResult>>(&mut self, results: I) {
        for result in results {
            self.push(result);
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn results(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.values()
    }

    /// Render the full artifact.
    pub fn render(&self) -> Result<String> {
        let rendered = match self.format {
            OutputFormat::Csv => self.render_csv(),
            OutputFormat::Json => {
                let records: Vec<OutputRecord<'_>> =
                    self.results.values().map(OutputRecord::from).collect();
                let mut json = serde_json::to_string_pretty(&records)?;
                json.push('\n');
                json
            }
            OutputFormat::Jsonl => {
                let mut out = String::new();
                for result in self.results.values() {
                    out.push_str(&serde_json::to_string(&OutputRecord::from(result))?);
                    out.push('\n');
                }
                out
            }
            OutputFormat::Text => {
                let responses: Vec<&str> = self
                    .results
                    .values()
                    .filter_map(|r| r.response.as_deref())
                    .collect();
                if responses.is_empty() {
                    String::new()
                } else {
                    let mut out = responses.join("\n\n");
                    out.push('\n');
                    out
                }
            }
        };
        Ok(rendered)
    }

    fn render_csv(&self) -> String {
        let mut header = vec!["seq".to_string()];
        if self.columns.is_empty() {
            header.push("prompt".to_string());
        } else {
            header.extend(self.columns.iter().map(|c| input_header(c, &self.columns)));
        }
        header.extend(RESULT_COLUMNS.iter().map(|c| c.to_string()));

        let mut out = String::new();
        push_csv_row(&mut out, header.iter().map(|h| escape_field(h)));

        for result in self.results.values() {
            let mut row = vec![result.seq.to_string()];
            if self.columns.is_empty() {
                row.push(escape_field(&result.prompt));
            } else {
                for column in &self.columns {
                    let value = result.variables.get(column).map(String::as_str);
                    row.push(escape_field(value.unwrap_or_default()));
                }
            }
            row.push(escape_field(result.response.as_deref().unwrap_or_default()));
            row.push(result.is_success().to_string());
            row.push(escape_field(
                &result.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
            ));
            row.push(result.input_tokens.to_string());
            row.push(result.output_tokens.to_string());
            push_csv_row(&mut out, row.into_iter());
        }

        out
    }

    /// Render and atomically replace the artifact on disk.
    pub async fn write(&self) -> Result<()> {
        let content = self.render()?;
        atomic_write(&self.path, content.as_bytes()).await?;
        info!(
            path = %self.path.display(),
            format = %self.format,
            rows = self.results.len(),
            "Wrote batch output"
        );
        Ok(())
    }
}

const RESULT_COLUMNS: [&str; 5] = [
    "response",
    "success",
    "error",
    "input_tokens",
    "output_tokens",
];

/// CSV header for an input column. Names that clash with the sequence or a
/// result column get an `input_` prefix until unique.
fn input_header(column: &str, columns: &[String]) -> String {
    let mut name = column.to_string();
    while name == "seq"
        || RESULT_COLUMNS.contains(&name.as_str())
        || (name != column && columns.iter().any(|c| *c == name))
    {
        name = format!("input_{name}");
    }
    name
}

fn push_csv_row(out: &mut String, fields: impl Iterator<Item = String>) {
    let fields: Vec<String> = fields.collect();
    out.push_str(&fields.join(","));
    out.push('\n');
}
