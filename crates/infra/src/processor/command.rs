//! Report processor that shells out to an external analysis program.
//!
//! The program is invoked as
//!
//! ```text
//! <program> --tenant T --job J --source S --output DIR [--fx-rate R] --tags JSON
//! ```
//!
//! Exit code 0 means success: every file under `DIR` becomes an asset and
//! `DIR/summary.json` the job summary. Exit code 65 (`EX_DATAERR`) means the
//! input is malformed. Anything else is treated as transient.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::process::Command;
use tracing::debug;

use super::{
    OutputAsset, ProcessorError, ProcessorInput, ProcessorOutput, ReportProcessor,
    content_type_for,
};

const SUMMARY_FILE: &str = "summary.json";
const EXIT_DATAERR: i32 = 65;
const MAX_DETAIL_LEN: usize = 500;

#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: PathBuf,
}

impl CommandProcessor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

/// Last non-empty stderr line, bounded, as a human-readable detail.
fn stderr_detail(stderr: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    let line = text.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    Some(line.chars().take(MAX_DETAIL_LEN).collect())
}

async fn collect_outputs(root: &Path) -> Result<ProcessorOutput, ProcessorError> {
    let read_err = |e: std::io::Error| ProcessorError::transient(format!("reading processor output: {}", e.kind()));

    let mut assets = Vec::new();
    let mut summary = None;
    let mut pending = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(read_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let name = if prefix.is_empty() {
                file_name
            } else {
                format!("{prefix}/{file_name}")
            };

            if entry.file_type().await.map_err(read_err)?.is_dir() {
                pending.push((entry.path(), name));
                continue;
            }

            let bytes = tokio::fs::read(entry.path()).await.map_err(read_err)?;
            if name == SUMMARY_FILE {
                let value: serde_json::Value = serde_json::from_slice(&bytes)
                    .map_err(|e| ProcessorError::fatal(format!("processor wrote an invalid summary: {e}")))?;
                summary = Some(value);
            } else {
                let content_type = content_type_for(&name);
                assets.push(OutputAsset::new(name, Bytes::from(bytes), content_type));
            }
        }
    }

    let summary = summary.ok_or_else(|| ProcessorError::fatal("processor produced no summary"))?;
    assets.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(ProcessorOutput { assets, summary })
}

#[async_trait]
impl ReportProcessor for CommandProcessor {
    async fn process(&self, input: &ProcessorInput) -> Result<ProcessorOutput, ProcessorError> {
        let scratch = tempfile::tempdir()
            .map_err(|e| ProcessorError::transient(format!("creating scratch directory: {}", e.kind())))?;
        let tags = serde_json::to_string(&input.vendor_tags)
            .map_err(|e| ProcessorError::fatal(format!("encoding vendor tags: {e}")))?;

        let mut command = Command::new(&self.program);
        command
            .arg("--tenant")
            .arg(input.tenant_id.as_str())
            .arg("--job")
            .arg(input.job_id.to_string())
            .arg("--source")
            .arg(&input.source_ref)
            .arg("--output")
            .arg(scratch.path());
        if let Some(rate) = input.options.fx_rate {
            command.arg("--fx-rate").arg(rate.to_string());
        }
        command
            .arg("--tags")
            .arg(tags)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // The executor drops this future on timeout; the child goes with it.
            .kill_on_drop(true);

        debug!(job_id = %input.job_id, program = %self.program.display(), "running report processor");
        let output = command
            .output()
            .await
            .map_err(|e| ProcessorError::transient(format!("report processor could not start: {}", e.kind())))?;

        match output.status.code() {
            Some(0) => collect_outputs(scratch.path()).await,
            Some(EXIT_DATAERR) => Err(ProcessorError::fatal(
                stderr_detail(&output.stderr).unwrap_or_else(|| "statement could not be parsed".to_string()),
            )),
            Some(code) => Err(ProcessorError::transient(format!(
                "report processor exited with status {code}"
            ))),
            None => Err(ProcessorError::transient(
                "report processor was terminated by a signal",
            )),
        }
    }
}
