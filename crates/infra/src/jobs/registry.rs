//! Job Registry: creation, tenant-scoped queries and the CAS transition path.

use std::sync::Arc;

use tracing::{info, instrument};

use wallettaser_core::{DomainError, Job, JobId, JobOptions, TenantId, Transition};

use super::store::{ExpectedState, JobCursor, JobStore, JobStoreError};

pub const DEFAULT_PAGE_SIZE: usize = 25;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("validation failed: {0}")]
    Validation(String),
    /// Missing, or owned by another tenant.
    #[error("job not found")]
    NotFound,
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl From<DomainError> for RegistryError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound | DomainError::Gone => RegistryError::NotFound,
            other => RegistryError::Validation(other.to_string()),
        }
    }
}

/// One page of a newest-first listing.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Present when the page was full; pass back to get the next one.
    pub next_cursor: Option<JobCursor>,
}

/// The contract every other component goes through to read or change jobs.
#[derive(Clone)]
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Insert a PENDING job. It is visible to `get`/`list` as soon as this returns.
    #[instrument(skip(self, options), err)]
    pub async fn create(
        &self,
        tenant_id: &str,
        source_ref: &str,
        options: JobOptions,
    ) -> Result<Job, RegistryError> {
        let tenant_id = TenantId::parse(tenant_id)?;
        let job = Job::new(tenant_id, source_ref, options)?;
        self.store.insert(&job).await?;

        info!(tenant_id = %job.tenant_id, job_id = %job.id, "job created");
        Ok(job)
    }

    /// Tenant-scoped lookup; another tenant's job is indistinguishable from a missing one.
    pub async fn get(&self, tenant_id: &TenantId, job_id: JobId) -> Result<Job, RegistryError> {
        match self.store.get(job_id).await? {
            Some(job) if &job.tenant_id == tenant_id => Ok(job),
            _ => Err(RegistryError::NotFound),
        }
    }

    /// Load a job without a tenant check (executor and reaper paths only).
    pub async fn load(&self, job_id: JobId) -> Result<Option<Job>, RegistryError> {
        Ok(self.store.get(job_id).await?)
    }

    /// Newest-first page. `limit` defaults to 25 and is clamped to 1..=100.
    pub async fn list(
        &self,
        tenant_id: &TenantId,
        limit: Option<usize>,
        cursor: Option<JobCursor>,
    ) -> Result<JobPage, RegistryError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let jobs = self.store.list_page(tenant_id, limit, cursor).await?;
        let next_cursor = if jobs.len() == limit {
            jobs.last().map(JobCursor::after)
        } else {
            None
        };
        Ok(JobPage { jobs, next_cursor })
    }

    /// Compare-and-swap on status (and attempts, when pinned); the sole
    /// mutation path for existing jobs.
    pub async fn transition(
        &self,
        job_id: JobId,
        expected: impl Into<ExpectedState>,
        transition: &Transition,
    ) -> Result<Job, JobStoreError> {
        let expected = expected.into();
        let job = self.store.transition(job_id, expected, transition).await?;
        info!(
            tenant_id = %job.tenant_id,
            job_id = %job.id,
            from = %expected.status,
            status = %job.status,
            attempts = job.attempts,
            "job transitioned"
        );
        Ok(job)
    }

    /// Remove the job row. Storage must already be gone (see the retention enforcer).
    pub async fn delete(&self, tenant_id: &TenantId, job_id: JobId) -> Result<bool, RegistryError> {
        Ok(self.store.delete(tenant_id, job_id).await?)
    }
}
