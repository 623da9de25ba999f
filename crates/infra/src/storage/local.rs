//! Filesystem-rooted storage: one directory per `{tenant}/{job}`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use wallettaser_core::manifest::{backend_key, job_prefix};
use wallettaser_core::{JobId, TenantId};

use super::{StorageBackend, StorageError, validate_key};

#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, seg| path.join(seg)))
    }

    fn job_dir(&self, tenant_id: &TenantId, job_id: &JobId) -> PathBuf {
        self.root.join(tenant_id.as_str()).join(job_id.to_string())
    }
}

// Paths stay out of error messages; only the key is reported.
fn io_error(key: &str, err: std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(format!("{key}: {}", err.kind()))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn put(
        &self,
        tenant_id: &TenantId,
        job_id: &JobId,
        logical_name: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let key = backend_key(tenant_id, job_id, logical_name);
        let path = self.path_for(&key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(&key, e))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| io_error(&key, e))?;

        debug!(key = %key, size = bytes.len(), "stored blob");
        Ok(key)
    }

    async fn get(&self, backend_key: &str) -> Result<Bytes, StorageError> {
        let path = self.path_for(backend_key)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(backend_key, e))?;
        Ok(Bytes::from(data))
    }

    async fn delete_prefix(
        &self,
        tenant_id: &TenantId,
        job_id: &JobId,
    ) -> Result<(), StorageError> {
        let dir = self.job_dir(tenant_id, job_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&job_prefix(tenant_id, job_id), e)),
        }
    }

    async fn list(
        &self,
        tenant_id: &TenantId,
        job_id: &JobId,
    ) -> Result<Vec<String>, StorageError> {
        let prefix = job_prefix(tenant_id, job_id);
        let mut keys = Vec::new();
        let mut pending = vec![(self.job_dir(tenant_id, job_id), prefix.clone())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&key_prefix, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error(&key_prefix, e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = format!("{key_prefix}/{name}");
                let file_type = entry.file_type().await.map_err(|e| io_error(&key, e))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (TenantId, JobId) {
        (TenantId::parse("acme").unwrap(), JobId::new())
    }

    #[tokio::test]
    async fn put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let (tenant, job) = ids();

        let key = storage
            .put(&tenant, &job, "charts/spend.png", Bytes::from_static(b"\x89PNG"), "image/png")
            .await
            .unwrap();
        storage
            .put(&tenant, &job, "report.csv", Bytes::from_static(b"a,b\n"), "text/csv")
            .await
            .unwrap();

        assert_eq!(key, format!("acme/{job}/charts/spend.png"));
        assert_eq!(storage.get(&key).await.unwrap(), Bytes::from_static(b"\x89PNG"));
        assert_eq!(
            storage.list(&tenant, &job).await.unwrap(),
            vec![key.clone(), format!("acme/{job}/report.csv")]
        );

        storage.delete_prefix(&tenant, &job).await.unwrap();
        assert!(storage.list(&tenant, &job).await.unwrap().is_empty());
        assert!(matches!(storage.get(&key).await, Err(StorageError::NotFound(_))));

        // Idempotent.
        storage.delete_prefix(&tenant, &job).await.unwrap();
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert!(matches!(
            storage.get("acme/../../etc/passwd").await,
            Err(StorageError::InvalidKey(_))
        ));
    }
}
