//! `object_store`-backed storage (S3 in production, in-memory in tests).
//!
//! Deletes are best-effort per object: a crash mid-`delete_prefix` leaves
//! some blobs behind under a prefix no job row points at.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::prefix::PrefixStore;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use tracing::debug;

use wallettaser_core::manifest::{backend_key, job_prefix};
use wallettaser_core::{JobId, TenantId};

use super::{StorageBackend, StorageError, validate_key};

#[derive(Debug, Clone)]
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStorage {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Wrap `store`, scoping every key under `prefix` when it is non-empty.
    pub fn with_prefix<T: ObjectStore>(store: T, prefix: &str) -> Result<Self, StorageError> {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return Ok(Self::new(Arc::new(store)));
        }
        let prefix_path =
            ObjectPath::parse(prefix).map_err(|e| StorageError::Config(e.to_string()))?;
        Ok(Self::new(Arc::new(PrefixStore::new(store, prefix_path))))
    }

    fn object_path(key: &str) -> Result<ObjectPath, StorageError> {
        validate_key(key)?;
        ObjectPath::parse(key).map_err(|_| StorageError::InvalidKey(key.to_string()))
    }
}

fn map_object_error(key: &str, err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NotFound(key.to_string()),
        other => StorageError::Backend(format!("{key}: {other}")),
    }
}

#[async_trait]
impl StorageBackend for ObjectStorage {
    async fn put(
        &self,
        tenant_id: &TenantId,
        job_id: &JobId,
        logical_name: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let key = backend_key(tenant_id, job_id, logical_name);
        let path = Self::object_path(&key)?;

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());
        let options = PutOptions {
            attributes,
            ..Default::default()
        };

        let size = bytes.len();
        self.store
            .put_opts(&path, PutPayload::from(bytes), options)
            .await
            .map_err(|e| map_object_error(&key, e))?;

        debug!(key = %key, size, "stored object");
        Ok(key)
    }

    async fn get(&self, backend_key: &str) -> Result<Bytes, StorageError> {
        let path = Self::object_path(backend_key)?;
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| map_object_error(backend_key, e))?;
        result
            .bytes()
            .await
            .map_err(|e| map_object_error(backend_key, e))
    }

    async fn delete_prefix(
        &self,
        tenant_id: &TenantId,
        job_id: &JobId,
    ) -> Result<(), StorageError> {
        for key in self.list(tenant_id, job_id).await? {
            let path = Self::object_path(&key)?;
            match self.store.delete(&path).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(map_object_error(&key, e)),
            }
        }
        Ok(())
    }

    async fn list(
        &self,
        tenant_id: &TenantId,
        job_id: &JobId,
    ) -> Result<Vec<String>, StorageError> {
        let prefix = job_prefix(tenant_id, job_id);
        let prefix_path =
            ObjectPath::parse(&prefix).map_err(|_| StorageError::InvalidKey(prefix.clone()))?;

        let metas: Vec<_> = self
            .store
            .list(Some(&prefix_path))
            .try_collect()
            .await
            .map_err(|e| map_object_error(&prefix, e))?;

        let mut keys: Vec<String> = metas.into_iter().map(|m| m.location.to_string()).collect();
        keys.sort();
        Ok(keys)
    }
}
