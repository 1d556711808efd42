//! Binary-to-JSON-lines converter.
//!
//! Runs the join engine and writes each resolved example as one JSON line
//! (`{"example": {...}}`) instead of handing it to a learner. With
//! `include_raw`, every decoded record is written too (`{"record": {...}}`),
//! ahead of the example whose resolution required reading it.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::adapter::TrainingExample;
use crate::binary_reader::RecordSource;
use crate::config::JoinSettings;
use crate::errors::{DecodeError, JoinerError, JoinerResult};
use crate::joiner::{open_source, JoinEngine};
use crate::record::Record;
use crate::telemetry::JoinMetrics;

pub const OUTPUT_EXTENSION: &str = "dsjson";
const TEXT_EXTENSIONS: [&str; 3] = ["dsjson", "json", "jsonl"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertOptions {
    pub include_raw: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvertSummary {
    pub output: Option<PathBuf>,
    pub examples: u64,
    pub raw_records: u64,
    pub metrics: JoinMetrics,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum Line<'a> {
    Example(&'a TrainingExample),
    Record(&'a Record),
}

/// Passes records through, keeping a copy when raw output is wanted.
pub struct RecordTap<S> {
    inner: S,
    captured: Vec<Record>,
    enabled: bool,
}

impl<S: RecordSource> RecordTap<S> {
    pub fn new(inner: S, enabled: bool) -> Self {
        Self {
            inner,
            captured: Vec::new(),
            enabled,
        }
    }

    pub fn take_captured(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.captured)
    }
}

impl<S: RecordSource> RecordSource for RecordTap<S> {
    fn next_record(&mut self) -> Result<Option<Record>, DecodeError> {
        let record = self.inner.next_record()?;
        if self.enabled {
            if let Some(record) = &record {
                self.captured.push(record.clone());
            }
        }
        Ok(record)
    }
}

/// `run.log` converts to `run.log.dsjson` next to it.
pub fn default_output_path(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_owned();
    name.push(".");
    name.push(OUTPUT_EXTENSION);
    PathBuf::from(name)
}

/// Refuse inputs that are already structured text, by extension or content.
pub fn ensure_binary_input(input: &Path) -> JoinerResult<()> {
    let already_text = || JoinerError::AlreadyText {
        path: input.display().to_string(),
    };

    let extension = input
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    if let Some(extension) = extension {
        if TEXT_EXTENSIONS.contains(&extension.as_str()) {
            return Err(already_text());
        }
    }

    let mut head = [0u8; 64];
    let read = File::open(input)
        .and_then(|mut file| file.read(&mut head))
        .map_err(|e| JoinerError::io(format!("reading {}", input.display()), e))?;

    match head[..read].iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'{') | Some(b'[') => Err(already_text()),
        _ => Ok(()),
    }
}

/// Convert `input` to JSON lines at `output`, or next to the input by default.
pub fn convert_file(
    input: &Path,
    output: Option<&Path>,
    settings: JoinSettings,
    options: ConvertOptions,
) -> JoinerResult<ConvertSummary> {
    ensure_binary_input(input)?;

    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output_path(input));
    let source = open_source(input, &settings)?;
    let file = File::create(&output)
        .map_err(|e| JoinerError::io(format!("creating {}", output.display()), e))?;

    let mut summary = convert(source, settings, BufWriter::new(file), options)?;
    info!(
        input = %input.display(),
        output = %output.display(),
        examples = summary.examples,
        raw_records = summary.raw_records,
        "conversion finished"
    );
    summary.output = Some(output);
    Ok(summary)
}

/// Convert any record source into JSON lines on `writer`.
///
/// On a stream-fatal error, everything resolved before it is written and
/// flushed before the error is returned.
pub fn convert<S, W>(
    source: S,
    settings: JoinSettings,
    mut writer: W,
    options: ConvertOptions,
) -> JoinerResult<ConvertSummary>
where
    S: RecordSource,
    W: Write,
{
    let mut engine = JoinEngine::new(RecordTap::new(source, options.include_raw), settings);
    let mut summary = ConvertSummary {
        output: None,
        examples: 0,
        raw_records: 0,
        metrics: JoinMetrics::default(),
    };

    let outcome = loop {
        let next = engine.next_example();
        for record in engine.source_mut().take_captured() {
            write_line(&mut writer, &Line::Record(&record))?;
            summary.raw_records += 1;
        }
        match next {
            Ok(Some(example)) => {
                write_line(&mut writer, &Line::Example(&example))?;
                summary.examples += 1;
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };

    writer
        .flush()
        .map_err(|e| JoinerError::io("flushing converter output", e))?;
    summary.metrics = engine.metrics().clone();

    if let Err(err) = outcome {
        warn!(examples = summary.examples, error = %err, "conversion stopped early");
        return Err(err);
    }
    Ok(summary)
}

fn write_line<W: Write>(writer: &mut W, line: &Line<'_>) -> JoinerResult<()> {
    serde_json::to_writer(&mut *writer, line)
        .map_err(|e| JoinerError::serialization("converter line", e))?;
    writer
        .write_all(b"\n")
        .map_err(|e| JoinerError::io("writing converter output", e))
}
