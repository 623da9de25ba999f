//! Retention Enforcer: per-tenant eviction after every terminal transition.
//!
//! Eviction deletes storage first, then the job row. A crash in between
//! leaves a row whose blobs are missing, which readers report as `Gone`.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use wallettaser_core::{Job, JobId, JobStatus, LedgerEntry, RetentionPolicy, TenantId, timestamp_now};

use crate::jobs::{JobRegistry, RegistryError};
use crate::storage::{StorageBackend, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum RetentionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What one sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// COMPLETED jobs evicted by the caps, oldest first
    pub evicted: Vec<JobId>,
    /// FAILED jobs past their grace period
    pub expired_failures: Vec<JobId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.expired_failures.is_empty()
    }
}

fn ledger_entry(job: &Job) -> LedgerEntry {
    LedgerEntry {
        job_id: job.id,
        completed_at: job.completed_at.unwrap_or(job.created_at),
        size_bytes: job.artifact_bytes,
    }
}

#[derive(Clone)]
pub struct RetentionEnforcer {
    registry: JobRegistry,
    storage: Arc<dyn StorageBackend>,
    policy: RetentionPolicy,
}

impl RetentionEnforcer {
    pub fn new(
        registry: JobRegistry,
        storage: Arc<dyn StorageBackend>,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            registry,
            storage,
            policy,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Apply the caps and the FAILED grace period to one tenant.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn sweep(&self, tenant_id: &TenantId) -> Result<SweepReport, RetentionError> {
        let now = timestamp_now();
        let store = self.registry.store();

        let completed: Vec<LedgerEntry> = store
            .list_by_status(tenant_id, JobStatus::Completed)
            .await
            .map_err(RegistryError::from)?
            .iter()
            .map(ledger_entry)
            .collect();
        let evicted = self.policy.plan_evictions(&completed, now);

        let failed: Vec<LedgerEntry> = store
            .list_by_status(tenant_id, JobStatus::Failed)
            .await
            .map_err(RegistryError::from)?
            .iter()
            .map(ledger_entry)
            .collect();
        let expired_failures = self.policy.expired_failures(&failed, now);

        for job_id in evicted.iter().chain(expired_failures.iter()) {
            self.evict(tenant_id, *job_id).await?;
        }

        let report = SweepReport {
            evicted,
            expired_failures,
        };
        if !report.is_empty() {
            info!(
                tenant_id = %tenant_id,
                evicted = report.evicted.len(),
                expired_failures = report.expired_failures.len(),
                "retention sweep evicted jobs"
            );
        }
        Ok(report)
    }

    /// Delete a job's blobs, then its row. Evicting an unknown job is a no-op.
    ///
    /// Returns whether a row was removed.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    pub async fn evict(&self, tenant_id: &TenantId, job_id: JobId) -> Result<bool, RetentionError> {
        self.storage.delete_prefix(tenant_id, &job_id).await?;
        let removed = self.registry.delete(tenant_id, job_id).await?;
        if removed {
            info!(tenant_id = %tenant_id, job_id = %job_id, "job evicted");
        }
        Ok(removed)
    }

    /// Sweep after a terminal transition; failures are logged, not propagated.
    pub async fn after_terminal(&self, tenant_id: &TenantId) {
        if let Err(err) = self.sweep(tenant_id).await {
            warn!(tenant_id = %tenant_id, error = %err, "retention sweep failed");
        }
    }
}
