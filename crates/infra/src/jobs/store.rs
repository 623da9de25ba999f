//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use wallettaser_core::{Job, JobId, JobStatus, TenantId, Transition};

/// Position in a newest-first job listing.
///
/// Encodes the `(created_at, job_id)` of the last job on a page so the next
/// page starts strictly after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobCursor {
    pub created_at: DateTime<Utc>,
    pub job_id: JobId,
}

impl JobCursor {
    pub fn after(job: &Job) -> Self {
        Self {
            created_at: job.created_at,
            job_id: job.id,
        }
    }

    /// Whether `job` sorts after this cursor in newest-first order.
    pub fn precedes(&self, job: &Job) -> bool {
        (job.created_at, job.id) < (self.created_at, self.job_id)
    }
}

impl core::fmt::Display for JobCursor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}_{}", self.created_at.timestamp_micros(), self.job_id)
    }
}

impl core::str::FromStr for JobCursor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (micros, id) = s.split_once('_').ok_or_else(|| format!("malformed cursor: {s}"))?;
        let micros: i64 = micros.parse().map_err(|_| format!("malformed cursor: {s}"))?;
        let created_at = DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| format!("malformed cursor: {s}"))?;
        let job_id = id.parse().map_err(|_| format!("malformed cursor: {s}"))?;
        Ok(Self { created_at, job_id })
    }
}

/// What the caller believes the row looks like before a transition.
///
/// `attempts` pins the caller to one claim: every requeue bumps it, so a
/// worker whose job was reaped and re-claimed elsewhere no longer matches.
/// `None` accepts any attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedState {
    pub status: JobStatus,
    pub attempts: Option<u32>,
}

impl ExpectedState {
    /// The exact status and attempt count of a job as the caller last saw it.
    pub fn of(job: &Job) -> Self {
        Self {
            status: job.status,
            attempts: Some(job.attempts),
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        job.status == self.status && self.attempts.is_none_or(|a| a == job.attempts)
    }
}

impl From<JobStatus> for ExpectedState {
    fn from(status: JobStatus) -> Self {
        Self {
            status,
            attempts: None,
        }
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// The job was not in the expected status or claim; another actor won the race.
    #[error("stale transition on {job_id}: expected {expected}, found {actual}")]
    StaleTransition {
        job_id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable record of job rows.
///
/// `transition` is the only mutation of an existing row; it is a
/// compare-and-swap on `status` and, when given, `attempts`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job row.
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Load a job by id regardless of tenant. Tenant checks live in the registry.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Up to `limit` jobs of a tenant, newest first, strictly after `cursor`.
    async fn list_page(
        &self,
        tenant_id: &TenantId,
        limit: usize,
        cursor: Option<JobCursor>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Apply `transition` if the job currently matches `expected`.
    async fn transition(
        &self,
        job_id: JobId,
        expected: ExpectedState,
        transition: &Transition,
    ) -> Result<Job, JobStoreError>;

    /// PENDING jobs claimable at `now`, oldest first, across tenants.
    async fn list_ready_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// PROCESSING jobs whose `started_at` is before `started_before`.
    async fn list_stale_processing(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// All jobs of a tenant in `status`, oldest completion first.
    async fn list_by_status(
        &self,
        tenant_id: &TenantId,
        status: JobStatus,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Remove a job row. Returns whether a row was removed.
    async fn delete(&self, tenant_id: &TenantId, job_id: JobId) -> Result<bool, JobStoreError>;
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

fn completion_order(a: &Job, b: &Job) -> core::cmp::Ordering {
    a.completed_at
        .cmp(&b.completed_at)
        .then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn list_page(
        &self,
        tenant_id: &TenantId,
        limit: usize,
        cursor: Option<JobCursor>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| &j.tenant_id == tenant_id && cursor.is_none_or(|c| c.precedes(j)))
            .cloned()
            .collect();

        result.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn transition(
        &self,
        job_id: JobId,
        expected: ExpectedState,
        transition: &Transition,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let current = jobs.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if !expected.matches(current) {
            return Err(JobStoreError::StaleTransition {
                job_id,
                expected: expected.status,
                actual: current.status,
            });
        }

        let next = current
            .apply(expected.status, transition)
            .map_err(|e| JobStoreError::InvalidTransition(e.to_string()))?;
        jobs.insert(job_id, next.clone());
        Ok(next)
    }

    async fn list_ready_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs.values().filter(|j| j.is_ready(now)).cloned().collect();

        // FIFO
        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn list_stale_processing(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && j.started_at.is_some_and(|at| at < started_before)
            })
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.started_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn list_by_status(
        &self,
        tenant_id: &TenantId,
        status: JobStatus,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| &j.tenant_id == tenant_id && j.status == status)
            .cloned()
            .collect();

        result.sort_by(completion_order);
        Ok(result)
    }

    async fn delete(&self, tenant_id: &TenantId, job_id: JobId) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        match jobs.get(&job_id) {
            Some(job) if &job.tenant_id == tenant_id => {
                jobs.remove(&job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn list_page(
        &self,
        tenant_id: &TenantId,
        limit: usize,
        cursor: Option<JobCursor>,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_page(tenant_id, limit, cursor).await
    }

    async fn transition(
        &self,
        job_id: JobId,
        expected: ExpectedState,
        transition: &Transition,
    ) -> Result<Job, JobStoreError> {
        (**self).transition(job_id, expected, transition).await
    }

    async fn list_ready_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_ready_pending(now, limit).await
    }

    async fn list_stale_processing(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_stale_processing(started_before, limit).await
    }

    async fn list_by_status(
        &self,
        tenant_id: &TenantId,
        status: JobStatus,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(tenant_id, status).await
    }

    async fn delete(&self, tenant_id: &TenantId, job_id: JobId) -> Result<bool, JobStoreError> {
        (**self).delete(tenant_id, job_id).await
    }
}
