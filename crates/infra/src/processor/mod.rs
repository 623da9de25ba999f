//! The Report Processor seam.
//!
//! Statement parsing and vendor classification live outside this crate. The
//! executor only sees a `ReportProcessor` that turns one job's input into
//! named artifacts plus a summary, or fails transiently or fatally.

mod command;

pub use command::CommandProcessor;

use async_trait::async_trait;
use bytes::Bytes;

use wallettaser_core::{JobId, JobOptions, TenantId, VendorTag};

/// Everything the processor gets to see about a job.
#[derive(Debug, Clone)]
pub struct ProcessorInput {
    pub tenant_id: TenantId,
    pub job_id: JobId,
    pub source_ref: String,
    pub options: JobOptions,
    /// The tenant's vendor classifications at claim time.
    pub vendor_tags: Vec<VendorTag>,
}

/// One named artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputAsset {
    pub name: String,
    pub bytes: Bytes,
    pub content_type: String,
}

impl OutputAsset {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorOutput {
    pub assets: Vec<OutputAsset>,
    pub summary: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// Worth retrying (I/O hiccup, timeout, unavailable dependency).
    #[error("{0}")]
    Transient(String),
    /// Retrying cannot help (malformed input).
    #[error("{0}")]
    Fatal(String),
}

impl ProcessorError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

#[async_trait]
pub trait ReportProcessor: Send + Sync {
    async fn process(&self, input: &ProcessorInput) -> Result<ProcessorOutput, ProcessorError>;
}

/// Content type for an artifact file name.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => "text/csv",
        "json" => "application/json",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "html" | "htm" => "text/html",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}
