//! `JobService`: the contract the HTTP layer calls.
//!
//! Every call carries the caller's tenant identity explicitly. Errors are
//! collapsed into [`ServiceError`], whose variants map one-to-one onto the
//! responses the HTTP layer returns.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{info, warn};

use wallettaser_core::{
    Classification, DomainError, Job, JobId, JobOptions, JobStatus, Manifest, TenantId, Transition,
    VendorTag, manifest::validate_asset_name, normalize_vendor, timestamp_now,
};

use crate::jobs::{ExpectedState, JobCursor, JobPage, JobQueue, JobRegistry, JobStoreError, RegistryError};
use crate::retention::{RetentionEnforcer, RetentionError};
use crate::storage::{ManifestBuilder, StorageBackend, StorageError};
use crate::tags::{TagStoreError, VendorTagStore};

pub const CANCELLED_DETAIL: &str = "cancelled by uploader";

const CANCEL_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    /// Evicted while the request was being served.
    #[error("gone")]
    Gone,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DomainError> for ServiceError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound => ServiceError::NotFound,
            DomainError::Gone => ServiceError::Gone,
            other => ServiceError::Validation(other.to_string()),
        }
    }
}

impl From<RegistryError> for ServiceError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Validation(msg) => ServiceError::Validation(msg),
            RegistryError::NotFound => ServiceError::NotFound,
            RegistryError::Store(e) => e.into(),
        }
    }
}

impl From<JobStoreError> for ServiceError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(_) => ServiceError::NotFound,
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

impl From<TagStoreError> for ServiceError {
    fn from(err: TagStoreError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

impl From<RetentionError> for ServiceError {
    fn from(err: RetentionError) -> Self {
        match err {
            RetentionError::Registry(e) => e.into(),
            RetentionError::Storage(e) => e.into(),
        }
    }
}

/// A named asset ready to stream.
#[derive(Debug, Clone)]
pub struct AssetDownload {
    pub bytes: Bytes,
    pub content_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VendorOverview {
    pub tags: Vec<VendorTag>,
    /// Vendors the given job saw that the tenant has not classified yet.
    pub untagged_vendors: Vec<String>,
}

#[derive(Clone)]
pub struct JobService {
    registry: JobRegistry,
    tags: Arc<dyn VendorTagStore>,
    storage: Arc<dyn StorageBackend>,
    manifests: ManifestBuilder,
    retention: RetentionEnforcer,
    queue: JobQueue,
}

impl JobService {
    pub fn new(
        registry: JobRegistry,
        tags: Arc<dyn VendorTagStore>,
        storage: Arc<dyn StorageBackend>,
        retention: RetentionEnforcer,
        queue: JobQueue,
    ) -> Self {
        Self {
            registry,
            tags,
            manifests: ManifestBuilder::new(storage.clone()),
            storage,
            retention,
            queue,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    // ---- jobs ----

    /// Create a PENDING job and notify the workers.
    pub async fn create_job(
        &self,
        tenant_id: &str,
        source_ref: &str,
        options: JobOptions,
    ) -> Result<Job, ServiceError> {
        let job = self.registry.create(tenant_id, source_ref, options).await?;
        self.queue.push(job.id);
        Ok(job)
    }

    /// Run a finished job's statement again as a new PENDING job.
    ///
    /// The original row and its artifacts are left for retention to age out.
    pub async fn reanalyze_job(&self, tenant_id: &str, job_id: JobId) -> Result<Job, ServiceError> {
        let tenant = TenantId::parse(tenant_id)?;
        let previous = self.registry.get(&tenant, job_id).await?;
        if !previous.status.is_terminal() {
            return Err(ServiceError::Conflict(format!("job is still {}", previous.status)));
        }

        let job = self
            .registry
            .create(tenant_id, &previous.source_ref, previous.options.clone())
            .await?;
        self.queue.push(job.id);
        info!(tenant_id = %tenant, job_id = %job.id, previous_job_id = %job_id, "job re-analysis queued");
        Ok(job)
    }

    /// Newest-first page; `cursor` is the `next_cursor` of the previous page.
    pub async fn list_jobs(
        &self,
        tenant_id: &str,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<JobPage, ServiceError> {
        let tenant_id = TenantId::parse(tenant_id)?;
        let cursor = cursor
            .map(str::parse::<JobCursor>)
            .transpose()
            .map_err(ServiceError::Validation)?;
        Ok(self.registry.list(&tenant_id, limit, cursor).await?)
    }

    pub async fn get_job(&self, tenant_id: &str, job_id: JobId) -> Result<Job, ServiceError> {
        let tenant_id = TenantId::parse(tenant_id)?;
        Ok(self.registry.get(&tenant_id, job_id).await?)
    }

    /// `NotFound` until the job has completed.
    pub async fn get_summary(
        &self,
        tenant_id: &str,
        job_id: JobId,
    ) -> Result<serde_json::Value, ServiceError> {
        self.get_job(tenant_id, job_id)
            .await?
            .summary
            .ok_or(ServiceError::NotFound)
    }

    pub async fn list_assets(&self, tenant_id: &str, job_id: JobId) -> Result<Manifest, ServiceError> {
        let job = self.get_job(tenant_id, job_id).await?;
        self.completed_manifest(&job).await
    }

    async fn completed_manifest(&self, job: &Job) -> Result<Manifest, ServiceError> {
        let manifest_ref = match (&job.status, &job.manifest_ref) {
            (JobStatus::Completed, Some(manifest_ref)) => manifest_ref,
            _ => return Err(ServiceError::NotFound),
        };
        self.manifests
            .read(manifest_ref)
            .await
            .map_err(|e| self.missing_blob(job, e))
    }

    /// A row whose blobs are gone was evicted (or half-evicted) under us.
    fn missing_blob(&self, job: &Job, err: StorageError) -> ServiceError {
        match err {
            StorageError::NotFound(_) => {
                warn!(tenant_id = %job.tenant_id, job_id = %job.id, "job artifacts missing");
                ServiceError::Gone
            }
            other => other.into(),
        }
    }

    /// Read one named asset of a COMPLETED job.
    pub async fn fetch_asset(
        &self,
        tenant_id: &str,
        job_id: JobId,
        logical_name: &str,
    ) -> Result<AssetDownload, ServiceError> {
        validate_asset_name(logical_name)?;
        let tenant = TenantId::parse(tenant_id)?;
        let job = self.registry.get(&tenant, job_id).await?;
        let manifest = self.completed_manifest(&job).await?;
        let asset = manifest.find(logical_name).ok_or(ServiceError::NotFound)?;

        let bytes = self
            .storage
            .get(&asset.backend_key)
            .await
            .map_err(|e| self.missing_blob(&job, e))?;

        // Evicted between the manifest read and now.
        match self.registry.get(&tenant, job_id).await {
            Ok(_) => {}
            Err(RegistryError::NotFound) => return Err(ServiceError::Gone),
            Err(e) => return Err(e.into()),
        }

        Ok(AssetDownload {
            bytes,
            content_type: asset.content_type.clone(),
            size_bytes: asset.size_bytes,
        })
    }

    /// Explicit eviction, whatever the retention caps say.
    pub async fn delete_job(&self, tenant_id: &str, job_id: JobId) -> Result<(), ServiceError> {
        let tenant_id = TenantId::parse(tenant_id)?;
        self.registry.get(&tenant_id, job_id).await?;
        self.retention.evict(&tenant_id, job_id).await?;
        info!(tenant_id = %tenant_id, job_id = %job_id, "job deleted by uploader");
        Ok(())
    }

    /// Force a PENDING or PROCESSING job to FAILED.
    ///
    /// An in-flight processor call is not interrupted; its result loses the
    /// COMPLETED CAS and is discarded.
    pub async fn cancel_job(&self, tenant_id: &str, job_id: JobId) -> Result<Job, ServiceError> {
        let tenant_id = TenantId::parse(tenant_id)?;

        for _ in 0..CANCEL_ATTEMPTS {
            let job = self.registry.get(&tenant_id, job_id).await?;
            if job.status.is_terminal() {
                return Err(ServiceError::Conflict(format!("job is already {}", job.status)));
            }

            let transition = Transition::Fail {
                at: timestamp_now(),
                detail: CANCELLED_DETAIL.to_string(),
                attempts: job.attempts,
            };
            match self
                .registry
                .transition(job_id, ExpectedState::of(&job), &transition)
                .await
            {
                Ok(cancelled) => {
                    info!(tenant_id = %tenant_id, job_id = %job_id, "job cancelled");
                    self.retention.after_terminal(&tenant_id).await;
                    return Ok(cancelled);
                }
                Err(JobStoreError::StaleTransition { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(ServiceError::Conflict("job state kept changing".to_string()))
    }

    // ---- vendor tags ----

    pub async fn upsert_vendor_tag(
        &self,
        tenant_id: &str,
        vendor: &str,
        classification: &str,
    ) -> Result<VendorTag, ServiceError> {
        let tenant_id = TenantId::parse(tenant_id)?;
        let tag = VendorTag {
            vendor: normalize_vendor(vendor)?,
            classification: classification.parse::<Classification>()?,
            last_updated: timestamp_now(),
        };
        self.tags.upsert(&tenant_id, &tag).await?;
        info!(tenant_id = %tenant_id, vendor = %tag.vendor, classification = %tag.classification, "vendor tag saved");
        Ok(tag)
    }

    pub async fn list_vendor_tags(&self, tenant_id: &str) -> Result<Vec<VendorTag>, ServiceError> {
        let tenant_id = TenantId::parse(tenant_id)?;
        Ok(self.tags.list(&tenant_id).await?)
    }

    pub async fn delete_vendor_tag(&self, tenant_id: &str, vendor: &str) -> Result<(), ServiceError> {
        let tenant_id = TenantId::parse(tenant_id)?;
        let vendor = normalize_vendor(vendor)?;
        if !self.tags.delete(&tenant_id, &vendor).await? {
            return Err(ServiceError::NotFound);
        }
        Ok(())
    }

    /// The tenant's tags, plus the vendors `job_id` reported as unclassified.
    pub async fn vendor_overview(
        &self,
        tenant_id: &str,
        job_id: Option<JobId>,
    ) -> Result<VendorOverview, ServiceError> {
        let tags = self.list_vendor_tags(tenant_id).await?;

        let mut untagged_vendors = Vec::new();
        if let Some(job_id) = job_id {
            let job = self.get_job(tenant_id, job_id).await?;
            let candidates = job
                .summary
                .as_ref()
                .and_then(|s| s.get("untagged_vendors"))
                .and_then(|v| v.as_array());

            let mut seen: HashSet<String> = tags.iter().map(|t| t.vendor.clone()).collect();
            for vendor in candidates.into_iter().flatten().filter_map(|v| v.as_str()) {
                let Ok(key) = normalize_vendor(vendor) else {
                    continue;
                };
                if seen.insert(key) {
                    untagged_vendors.push(vendor.to_string());
                }
            }
        }

        Ok(VendorOverview {
            tags,
            untagged_vendors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobStore;
    use crate::storage::LocalStorage;
    use crate::tags::InMemoryVendorTagStore;
    use wallettaser_core::RetentionPolicy;

    struct Fixture {
        service: JobService,
        queue: JobQueue,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(InMemoryJobStore::arc());
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
        let retention =
            RetentionEnforcer::new(registry.clone(), storage.clone(), RetentionPolicy::default());
        let queue = JobQueue::new();
        Fixture {
            service: JobService::new(
                registry,
                InMemoryVendorTagStore::arc(),
                storage,
                retention,
                queue.clone(),
            ),
            queue,
            _dir: dir,
        }
    }

    impl Fixture {
        async fn complete(&self, job: &Job, summary: serde_json::Value) {
            let registry = self.service.registry();
            let written = self
                .service
                .manifests
                .write(
                    &job.tenant_id,
                    &job.id,
                    &[crate::processor::OutputAsset::new("report.csv", "a,b\n", "text/csv")],
                )
                .await
                .unwrap();
            let artifact_bytes = written.total_bytes();
            registry
                .transition(job.id, JobStatus::Pending, &Transition::Claim { at: timestamp_now() })
                .await
                .unwrap();
            registry
                .transition(
                    job.id,
                    JobStatus::Processing,
                    &Transition::Complete {
                        at: timestamp_now(),
                        summary,
                        manifest_ref: written.manifest_ref,
                        artifact_bytes,
                    },
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn create_notifies_workers_and_validates() {
        let fx = fixture();
        let job = fx
            .service
            .create_job("acme", "uploads/a.xlsx", JobOptions::with_fx_rate(1.3))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(
            fx.queue.next(std::time::Duration::from_millis(10)).await,
            Some(job.id)
        );

        assert!(matches!(
            fx.service.create_job("", "x", JobOptions::default()).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            fx.service.list_jobs("acme", None, Some("garbage")).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn assets_are_only_served_for_completed_jobs_of_the_owner() {
        let fx = fixture();
        let job = fx.service.create_job("acme", "s", JobOptions::default()).await.unwrap();

        assert_eq!(
            fx.service.fetch_asset("acme", job.id, "report.csv").await.unwrap_err(),
            ServiceError::NotFound
        );
        assert_eq!(
            fx.service.get_summary("acme", job.id).await.unwrap_err(),
            ServiceError::NotFound
        );

        fx.complete(&job, serde_json::json!({"total": 1})).await;

        let download = fx.service.fetch_asset("acme", job.id, "report.csv").await.unwrap();
        assert_eq!(download.bytes, Bytes::from_static(b"a,b\n"));
        assert_eq!(download.content_type, "text/csv");
        assert_eq!(download.size_bytes, 4);

        assert_eq!(
            fx.service.fetch_asset("other", job.id, "report.csv").await.unwrap_err(),
            ServiceError::NotFound
        );
        assert_eq!(
            fx.service.fetch_asset("acme", job.id, "missing.csv").await.unwrap_err(),
            ServiceError::NotFound
        );
        assert!(matches!(
            fx.service.fetch_asset("acme", job.id, "../etc/passwd").await,
            Err(ServiceError::Validation(_))
        ));
        assert_eq!(
            fx.service.list_assets("acme", job.id).await.unwrap().assets.len(),
            1
        );
    }

    #[tokio::test]
    async fn missing_blobs_read_as_gone() {
        let fx = fixture();
        let job = fx.service.create_job("acme", "s", JobOptions::default()).await.unwrap();
        fx.complete(&job, serde_json::json!({})).await;

        // Half-finished eviction: blobs deleted, row still present.
        fx.service.storage.delete_prefix(&job.tenant_id, &job.id).await.unwrap();

        assert_eq!(
            fx.service.fetch_asset("acme", job.id, "report.csv").await.unwrap_err(),
            ServiceError::Gone
        );
        assert_eq!(
            fx.service.list_assets("acme", job.id).await.unwrap_err(),
            ServiceError::Gone
        );
    }

    #[tokio::test]
    async fn delete_removes_row_and_blobs() {
        let fx = fixture();
        let job = fx.service.create_job("acme", "s", JobOptions::default()).await.unwrap();
        fx.complete(&job, serde_json::json!({})).await;

        assert_eq!(
            fx.service.delete_job("other", job.id).await.unwrap_err(),
            ServiceError::NotFound
        );
        fx.service.delete_job("acme", job.id).await.unwrap();
        assert_eq!(
            fx.service.get_job("acme", job.id).await.unwrap_err(),
            ServiceError::NotFound
        );
        assert!(fx.service.storage.list(&job.tenant_id, &job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_forces_failed_once() {
        let fx = fixture();
        let job = fx.service.create_job("acme", "s", JobOptions::default()).await.unwrap();

        let cancelled = fx.service.cancel_job("acme", job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.error_detail.as_deref(), Some(CANCELLED_DETAIL));
        assert_eq!(cancelled.started_at, cancelled.completed_at);
        cancelled.check_invariants().unwrap();

        assert!(matches!(
            fx.service.cancel_job("acme", job.id).await,
            Err(ServiceError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn reanalyze_queues_a_fresh_job_from_the_same_source() {
        let fx = fixture();
        let wait = std::time::Duration::from_millis(10);
        let job = fx
            .service
            .create_job("acme", "uploads/march.xlsx", JobOptions::with_fx_rate(1.35))
            .await
            .unwrap();
        assert_eq!(fx.queue.next(wait).await, Some(job.id));

        assert!(matches!(
            fx.service.reanalyze_job("acme", job.id).await,
            Err(ServiceError::Conflict(_))
        ));

        fx.complete(&job, serde_json::json!({})).await;
        assert_eq!(
            fx.service.reanalyze_job("other", job.id).await.unwrap_err(),
            ServiceError::NotFound
        );

        let rerun = fx.service.reanalyze_job("acme", job.id).await.unwrap();
        assert_ne!(rerun.id, job.id);
        assert_eq!(rerun.status, JobStatus::Pending);
        assert_eq!(rerun.attempts, 0);
        assert_eq!(rerun.tenant_id, job.tenant_id);
        assert_eq!(rerun.source_ref, "uploads/march.xlsx");
        assert_eq!(rerun.options, job.options);
        assert_eq!(fx.queue.next(wait).await, Some(rerun.id));

        let previous = fx.service.get_job("acme", job.id).await.unwrap();
        assert_eq!(previous.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn vendor_tags_round_trip_and_overview_lists_untagged() {
        let fx = fixture();
        let tag = fx.service.upsert_vendor_tag("acme", " Netflix ", "wants").await.unwrap();
        assert_eq!(tag.vendor, "NETFLIX");
        assert_eq!(tag.classification, Classification::Wants);

        assert!(matches!(
            fx.service.upsert_vendor_tag("acme", "  ", "NEEDS").await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            fx.service.upsert_vendor_tag("acme", "Rent", "luxury").await,
            Err(ServiceError::Validation(_))
        ));

        let job = fx.service.create_job("acme", "s", JobOptions::default()).await.unwrap();
        fx.complete(
            &job,
            serde_json::json!({"untagged_vendors": ["NETFLIX", "SAFEWAY", "SAFEWAY", 7]}),
        )
        .await;

        let overview = fx.service.vendor_overview("acme", Some(job.id)).await.unwrap();
        assert_eq!(overview.tags.len(), 1);
        assert_eq!(overview.untagged_vendors, vec!["SAFEWAY".to_string()]);

        fx.service.delete_vendor_tag("acme", "netflix").await.unwrap();
        assert_eq!(
            fx.service.delete_vendor_tag("acme", "netflix").await.unwrap_err(),
            ServiceError::NotFound
        );
        assert!(fx.service.list_vendor_tags("acme").await.unwrap().is_empty());
    }
}
