//! Input parsing: a file of records becomes an ordered sequence of tasks.
//!
//! Four shapes are supported:
//! - CSV with a header row
//! - a JSON array of objects (or a single object)
//! - JSON Lines, one object per line
//! - plain text, one prompt per non-blank line

mod csv;


pub(crate) use csv::escape_field;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{BatchError, ParseError, Result, SchemaError};
use crate::task::PromptTask;
use crate::template::PromptTemplate;

/// Declared shape of an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    Csv,
    Json,
    Jsonl,
    Lines,
}

impl InputFormat {
    /// Pick a format from the file extension; unknown extensions are plain lines.
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
            _ => Self::Lines,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Jsonl => "jsonl",
            Self::Lines => "lines",
        }
    }
}

impl std::str::FromStr for InputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            "jsonl" | "ndjson" => Ok(Self::Jsonl),
            "lines" | "text" | "txt" => Ok(Self::Lines),
            other => Err(format!("unknown input format: {other}")),
        }
    }
}

/// How to parse a source.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub format: InputFormat,
    pub template: Option<PromptTemplate>,
    /// Fail the whole parse on the first malformed record.
    pub strict: bool,
    /// Keep only the first N accepted tasks.
    pub max_prompts: Option<usize>,
}

impl ParseOptions {
    pub fn new(format: InputFormat) -> Self {
        Self {
            format,
            template: None,
            strict: false,
            max_prompts: None,
        }
    }

    pub fn with_template(mut self, template: Option<PromptTemplate>) -> Self {
        self.template = template;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn max_prompts(mut self, max_prompts: Option<usize>) -> Self {
        self.max_prompts = max_prompts;
        self
    }
}

/// Outcome of a parse.
#[derive(Debug, Clone, Default)]
pub struct ParsedInput {
    /// Accepted tasks with 1-based sequence indices in source order.
    pub tasks: Vec<PromptTask>,
    /// Records that were skipped.
    pub errors: Vec<ParseError>,
    /// Field names in source order: the CSV header, or the keys seen in
    /// structured records.
    pub fields: Vec<String>,
}

/// A source record before template rendering.
struct Record {
    position: usize,
    variables: BTreeMap<String, String>,
    default_prompt: String,
}

type RawRecords = Vec<std::result::Result<Record, ParseError>>;

/// Read and parse a file.
pub async fn parse_file(path: &Path, options: &ParseOptions) -> Result<ParsedInput> {
    let text = tokio::fs::read_to_string(path).await?;
    debug!(path = %path.display(), format = options.format.as_str(), "Parsing input");
    parse_str(&text, options)
}

/// Parse in-memory source text.
pub fn parse_str(text: &str, options: &ParseOptions) -> Result<ParsedInput> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let (fields, records) = match options.format {
        InputFormat::Csv => read_csv(text)?,
        InputFormat::Json => read_json(text)?,
        InputFormat::Jsonl => read_jsonl(text),
        InputFormat::Lines => read_lines(text),
    };

    if let Some(template) = &options.template
        && !fields.is_empty()
    {
        let missing: Vec<String> = template
            .placeholders()
            .into_iter()
            .filter(|name| !fields.iter().any(|f| f == name))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(SchemaError {
                missing,
                available: fields,
            }
            .into());
        }
    }

    let mut parsed = ParsedInput {
        fields,
        ..Default::default()
    };

    for record in records {
        if let Some(max) = options.max_prompts
            && parsed.tasks.len() >= max
        {
            break;
        }

        let rendered = record.and_then(|record| {
            let prompt = match &options.template {
                Some(template) => template.render(&record.variables).map_err(|name| {
                    ParseError::new(record.position, format!("missing field '{name}'"))
                })?,
                None => record.default_prompt,
            };
            Ok((prompt, record.variables))
        });

        match rendered {
            Ok((prompt, variables)) => {
                let seq = parsed.tasks.len() as u64 + 1;
                parsed.tasks.push(PromptTask::new(seq, prompt, variables));
            }
            Err(e) if options.strict => return Err(BatchError::Parse(e)),
            Err(e) => {
                warn!(record = e.record, error = %e.message, "Skipping malformed record");
                parsed.errors.push(e);
            }
        }
    }

    debug!(
        tasks = parsed.tasks.len(),
        errors = parsed.errors.len(),
        "Parsed input"
    );
    Ok(parsed)
}

fn read_csv(text: &str) -> Result<(Vec<String>, RawRecords)> {
    let mut rows = csv::read_rows(text).into_iter();

    let Some(header) = rows.next() else {
        return Ok((Vec::new(), Vec::new()));
    };
    let header = header
        .fields
        .map_err(|message| ParseError::new(0, format!("header: {message}")))?;
    for (i, name) in header.iter().enumerate() {
        if header[..i].contains(name) {
            return Err(ParseError::new(0, format!("header: duplicate column '{name}'")).into());
        }
    }

    let records = rows
        .enumerate()
        .map(|(i, row)| {
            let position = i + 1;
            let values = row.fields.map_err(|message| {
                ParseError::new(position, format!("line {}: {message}", row.line))
            })?;
            if values.len() != header.len() {
                return Err(ParseError::new(
                    position,
                    format!(
                        "line {}: expected {} columns, found {}",
                        row.line,
                        header.len(),
                        values.len()
                    ),
                ));
            }
            let default_prompt = values.first().cloned().unwrap_or_default();
            Ok(Record {
                position,
                variables: header.iter().cloned().zip(values).collect(),
                default_prompt,
            })
        })
        .collect();

    Ok((header, records))
}

fn read_json(text: &str) -> Result<(Vec<String>, RawRecords)> {
    if text.trim().is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let document: Value = serde_json::from_str(text)
        .map_err(|e| ParseError::new(0, format!("invalid JSON document: {e}")))?;

    let values = match document {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        other => {
            return Err(ParseError::new(
                0,
                format!(
                    "expected an array of objects, found {}",
                    json_type_name(&other)
                ),
            )
            .into());
        }
    };

    let records: RawRecords = values
        .into_iter()
        .enumerate()
        .map(|(i, value)| json_record(i + 1, value))
        .collect();
    Ok((collect_fields(&records), records))
}

fn read_jsonl(text: &str) -> (Vec<String>, RawRecords) {
    let records: RawRecords = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .enumerate()
        .map(|(i, (line_no, line))| {
            let position = i + 1;
            let value: Value = serde_json::from_str(line).map_err(|e| {
                ParseError::new(position, format!("line {}: invalid JSON: {e}", line_no + 1))
            })?;
            json_record(position, value)
        })
        .collect();
    (collect_fields(&records), records)
}

fn read_lines(text: &str) -> (Vec<String>, RawRecords) {
    let records: RawRecords = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| {
            Ok(Record {
                position: i + 1,
                variables: BTreeMap::from([("line".to_string(), line.to_string())]),
                default_prompt: line.to_string(),
            })
        })
        .collect();

    let fields = if records.is_empty() {
        Vec::new()
    } else {
        vec!["line".to_string()]
    };
    (fields, records)
}

fn json_record(position: usize, value: Value) -> std::result::Result<Record, ParseError> {
    let Value::Object(map) = value else {
        return Err(ParseError::new(
            position,
            format!("expected a JSON object, found {}", json_type_name(&value)),
        ));
    };

    let default_prompt = match map.get("prompt") {
        Some(Value::String(prompt)) => prompt.clone(),
        _ => Value::Object(map.clone()).to_string(),
    };
    let variables = map
        .into_iter()
        .map(|(key, value)| (key, json_to_text(value)))
        .collect();

    Ok(Record {
        position,
        variables,
        default_prompt,
    })
}

fn collect_fields(records: &RawRecords) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for record in records.iter().flatten() {
        for key in record.variables.keys() {
            if !fields.contains(key) {
                fields.push(key.clone());
            }
        }
    }
    fields
}

fn json_to_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
