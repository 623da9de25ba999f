//! Blob storage behind a backend-agnostic capability set.
//!
//! Keys are namespaced `{tenant_id}/{job_id}/{logical_name}` so a whole job
//! can be removed with one `delete_prefix`. Backends hold bytes only; the
//! manifest (see [`manifest`]) is the inventory of what a job produced.

mod local;
pub mod manifest;
mod object;

pub use local::LocalStorage;
pub use manifest::{ManifestBuilder, WrittenManifest};
pub use object::ObjectStorage;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;

use wallettaser_core::{JobId, TenantId};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
    /// The processor produced an asset that cannot be stored.
    #[error("invalid asset: {0}")]
    InvalidAsset(String),
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("storage configuration error: {0}")]
    Config(String),
}

/// Capability set every backend provides.
#[async_trait]
pub trait StorageBackend: Send + Sync + core::fmt::Debug {
    /// Store `bytes` under the job's prefix and return the backend key.
    async fn put(
        &self,
        tenant_id: &TenantId,
        job_id: &JobId,
        logical_name: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError>;

    async fn get(&self, backend_key: &str) -> Result<Bytes, StorageError>;

    /// Remove every blob of a job. Succeeds when nothing is there.
    async fn delete_prefix(&self, tenant_id: &TenantId, job_id: &JobId)
    -> Result<(), StorageError>;

    /// Backend keys under the job's prefix, sorted.
    async fn list(&self, tenant_id: &TenantId, job_id: &JobId)
    -> Result<Vec<String>, StorageError>;
}

/// Which backend to build at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Local { root: PathBuf },
    S3 { bucket: String, prefix: String },
}

/// Build the configured backend once; callers share the returned handle.
pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    match config {
        StorageConfig::Local { root } => Ok(Arc::new(LocalStorage::new(root.clone()))),
        StorageConfig::S3 { bucket, prefix } => {
            // Credentials and region come from the standard AWS_* variables.
            let s3 = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()
                .map_err(|e| StorageError::Config(format!("S3: {e}")))?;
            Ok(Arc::new(ObjectStorage::with_prefix(s3, prefix)?))
        }
    }
}

/// Reject keys that could escape the storage namespace.
///
/// A valid key is at least `tenant/job/name`, with no empty, `.` or `..`
/// segments and no backslashes.
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    let segments: Vec<&str> = key.split('/').collect();
    let bad = segments.len() < 3
        || key.contains('\\')
        || segments
            .iter()
            .any(|s| s.is_empty() || *s == "." || *s == "..");
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}
