//! Manifest Builder: persists a job's assets, then the manifest that lists them.
//!
//! The manifest is always the last blob written, so a readable manifest
//! implies every asset it names was stored.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument};

use wallettaser_core::manifest::validate_asset_name;
use wallettaser_core::{Asset, JobId, MANIFEST_NAME, Manifest, TenantId, timestamp_now};

use super::{StorageBackend, StorageError};
use crate::processor::OutputAsset;

const MANIFEST_CONTENT_TYPE: &str = "application/json";

/// Outcome of a successful manifest write.
#[derive(Debug, Clone)]
pub struct WrittenManifest {
    /// Backend key of `manifest.json`
    pub manifest_ref: String,
    pub manifest: Manifest,
}

impl WrittenManifest {
    pub fn total_bytes(&self) -> u64 {
        self.manifest.total_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    storage: Arc<dyn StorageBackend>,
}

impl ManifestBuilder {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Write every asset, then the manifest.
    ///
    /// Names are validated before anything is written. On error, blobs already
    /// written stay behind; the caller reclaims them with `delete_prefix`.
    #[instrument(skip(self, assets), fields(tenant_id = %tenant_id, job_id = %job_id, assets = assets.len()), err)]
    pub async fn write(
        &self,
        tenant_id: &TenantId,
        job_id: &JobId,
        assets: &[OutputAsset],
    ) -> Result<WrittenManifest, StorageError> {
        let mut seen = HashSet::with_capacity(assets.len());
        for asset in assets {
            validate_asset_name(&asset.name)
                .map_err(|e| StorageError::InvalidAsset(e.to_string()))?;
            if !seen.insert(asset.name.as_str()) {
                return Err(StorageError::InvalidAsset(format!(
                    "duplicate asset name: {}",
                    asset.name
                )));
            }
        }

        let mut entries = Vec::with_capacity(assets.len());
        for asset in assets {
            let backend_key = self
                .storage
                .put(
                    tenant_id,
                    job_id,
                    &asset.name,
                    asset.bytes.clone(),
                    &asset.content_type,
                )
                .await?;
            entries.push(Asset {
                logical_name: asset.name.clone(),
                backend_key,
                content_type: asset.content_type.clone(),
                size_bytes: asset.bytes.len() as u64,
            });
        }

        let manifest = Manifest::new(tenant_id.clone(), *job_id, timestamp_now(), entries)
            .map_err(|e| StorageError::InvalidAsset(e.to_string()))?;
        let encoded = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| StorageError::Backend(format!("encode manifest: {e}")))?;

        let manifest_ref = self
            .storage
            .put(
                tenant_id,
                job_id,
                MANIFEST_NAME,
                Bytes::from(encoded),
                MANIFEST_CONTENT_TYPE,
            )
            .await?;

        debug!(manifest_ref = %manifest_ref, total_bytes = manifest.total_bytes(), "manifest written");
        Ok(WrittenManifest {
            manifest_ref,
            manifest,
        })
    }

    /// Load a manifest by its backend key.
    pub async fn read(&self, manifest_ref: &str) -> Result<Manifest, StorageError> {
        let bytes = self.storage.get(manifest_ref).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::Backend(format!("decode manifest: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;

    fn asset(name: &str, body: &'static [u8], content_type: &str) -> OutputAsset {
        OutputAsset {
            name: name.to_string(),
            bytes: Bytes::from_static(body),
            content_type: content_type.to_string(),
        }
    }

    #[tokio::test]
    async fn assets_round_trip_through_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
        let builder = ManifestBuilder::new(storage.clone());
        let tenant = TenantId::parse("acme").unwrap();
        let job = JobId::new();

        let written = builder
            .write(
                &tenant,
                &job,
                &[
                    asset("transactions.csv", b"date,amount\n", "text/csv"),
                    asset("charts/needs_wants.png", b"\x89PNG\r\n", "image/png"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(written.manifest_ref, format!("acme/{job}/manifest.json"));
        assert_eq!(written.total_bytes(), 12 + 6);

        let manifest = builder.read(&written.manifest_ref).await.unwrap();
        assert_eq!(manifest, written.manifest);

        let png = manifest.find("charts/needs_wants.png").unwrap();
        assert_eq!(png.content_type, "image/png");
        assert_eq!(
            storage.get(&png.backend_key).await.unwrap(),
            Bytes::from_static(b"\x89PNG\r\n")
        );
    }

    #[tokio::test]
    async fn invalid_names_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
        let builder = ManifestBuilder::new(storage.clone());
        let tenant = TenantId::parse("acme").unwrap();
        let job = JobId::new();

        let result = builder
            .write(
                &tenant,
                &job,
                &[
                    asset("ok.csv", b"x", "text/csv"),
                    asset("../escape.csv", b"x", "text/csv"),
                ],
            )
            .await;

        assert!(matches!(result, Err(StorageError::InvalidAsset(_))));
        assert!(storage.list(&tenant, &job).await.unwrap().is_empty());
    }
}
