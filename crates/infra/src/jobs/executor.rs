//! Task Executor: claims PENDING jobs and drives them to a terminal state.
//!
//! Mutual exclusion comes from the registry's CAS alone. Queue
//! notifications and store polling only say "this job may be claimable";
//! whichever worker wins `PENDING -> PROCESSING` runs it. Every later write
//! is pinned to the attempt count of that claim, so a worker whose job was
//! reaped and claimed again elsewhere cannot record a result.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use wallettaser_core::{Job, JobId, Transition, timestamp_now};

use super::queue::JobQueue;
use super::registry::JobRegistry;
use super::store::{ExpectedState, JobStoreError};
use super::types::RetryPolicy;
use crate::processor::{ProcessorError, ProcessorInput, ReportProcessor};
use crate::retention::RetentionEnforcer;
use crate::storage::{ManifestBuilder, StorageBackend};
use crate::tags::VendorTagStore;

/// Detail recorded when artifacts could not be stored.
pub const STORAGE_FAILURE_DETAIL: &str = "failed to store report artifacts";

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of concurrent worker tasks
    pub workers: usize,
    /// How long an idle worker waits for a notification before polling
    pub poll_interval: Duration,
    /// Upper bound on one processor call
    pub processor_timeout: Duration,
    /// Jobs fetched per poll
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(500),
            processor_timeout: Duration::from_secs(300),
            batch_size: 16,
            retry: RetryPolicy::default(),
        }
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    /// Claims lost to another worker (duplicate notifications)
    pub stale_claims: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// What one `run_job` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed { detail: String },
    Requeued { attempts: u32, delay: Duration },
    /// Nothing to do: missing, not PENDING, backing off, or another worker won the claim.
    Skipped,
}

/// Handle to control a running worker pool.
#[derive(Debug)]
pub struct ExecutorHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl ExecutorHandle {
    /// Request graceful shutdown, wait for in-flight jobs to finish and
    /// return the final statistics.
    pub async fn shutdown(mut self) -> ExecutorStats {
        let _ = self.shutdown.send(true);
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                error!(error = %e, "executor worker panicked");
            }
        }
        self.stats()
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

fn lock(stats: &Mutex<ExecutorStats>) -> std::sync::MutexGuard<'_, ExecutorStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Background job executor.
#[derive(Clone)]
pub struct TaskExecutor {
    registry: JobRegistry,
    tags: Arc<dyn VendorTagStore>,
    storage: Arc<dyn StorageBackend>,
    manifests: ManifestBuilder,
    processor: Arc<dyn ReportProcessor>,
    retention: RetentionEnforcer,
    queue: JobQueue,
    config: ExecutorConfig,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl TaskExecutor {
    pub fn new(
        registry: JobRegistry,
        tags: Arc<dyn VendorTagStore>,
        storage: Arc<dyn StorageBackend>,
        processor: Arc<dyn ReportProcessor>,
        retention: RetentionEnforcer,
        queue: JobQueue,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            tags,
            manifests: ManifestBuilder::new(storage.clone()),
            storage,
            processor,
            retention,
            queue,
            config,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        lock(&self.stats).clone()
    }

    /// One full claim -> process -> record cycle for `job_id`.
    pub async fn run_job(&self, job_id: JobId) -> Result<RunOutcome, JobStoreError> {
        let now = timestamp_now();
        let job = match self.registry.load(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(RunOutcome::Skipped),
            Err(e) => return Err(JobStoreError::Storage(e.to_string())),
        };
        if !job.is_ready(now) {
            return Ok(RunOutcome::Skipped);
        }

        let claimed = match self
            .registry
            .transition(job_id, ExpectedState::of(&job), &Transition::Claim { at: now })
            .await
        {
            Ok(job) => job,
            Err(JobStoreError::StaleTransition { .. } | JobStoreError::NotFound(_)) => {
                debug!(job_id = %job_id, "claim lost to another worker");
                lock(&self.stats).stale_claims += 1;
                return Ok(RunOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        lock(&self.stats).current_running += 1;
        let outcome = self.execute(claimed).await;
        {
            let mut stats = lock(&self.stats);
            stats.current_running = stats.current_running.saturating_sub(1);
            stats.jobs_processed += 1;
            match &outcome {
                Ok(RunOutcome::Completed) => stats.jobs_succeeded += 1,
                Ok(RunOutcome::Failed { .. }) => stats.jobs_failed += 1,
                Ok(RunOutcome::Requeued { .. }) => stats.jobs_retried += 1,
                _ => {}
            }
        }
        outcome
    }

    async fn execute(&self, job: Job) -> Result<RunOutcome, JobStoreError> {
        if job.attempts > 0 {
            // Leftovers of an abandoned attempt; the claim makes this prefix ours.
            if let Err(e) = self.storage.delete_prefix(&job.tenant_id, &job.id).await {
                warn!(job_id = %job.id, error = %e, "failed to clear previous attempt");
            }
        }

        let vendor_tags = match self.tags.list(&job.tenant_id).await {
            Ok(tags) => tags,
            Err(e) => {
                return self
                    .on_transient(&job, format!("vendor tags unavailable: {e}"))
                    .await;
            }
        };
        let input = ProcessorInput {
            tenant_id: job.tenant_id.clone(),
            job_id: job.id,
            source_ref: job.source_ref.clone(),
            options: job.options.clone(),
            vendor_tags,
        };

        let result = tokio::time::timeout(self.config.processor_timeout, self.processor.process(&input))
            .await
            .unwrap_or_else(|_| {
                Err(ProcessorError::transient(format!(
                    "report processor timed out after {}s",
                    self.config.processor_timeout.as_secs()
                )))
            });

        match result {
            Ok(output) => {
                let written = match self
                    .manifests
                    .write(&job.tenant_id, &job.id, &output.assets)
                    .await
                {
                    Ok(written) => written,
                    Err(e) => {
                        warn!(tenant_id = %job.tenant_id, job_id = %job.id, error = %e, "artifact write failed");
                        let outcome = self.fail(&job, STORAGE_FAILURE_DETAIL.to_string(), job.attempts + 1).await;
                        self.discard_blobs(&job).await;
                        return outcome;
                    }
                };
                let artifact_bytes = written.total_bytes();
                self.complete(&job, output.summary, written.manifest_ref, artifact_bytes)
                    .await
            }
            Err(ProcessorError::Transient(msg)) => self.on_transient(&job, msg).await,
            Err(ProcessorError::Fatal(msg)) => self.fail(&job, msg, job.attempts + 1).await,
        }
    }

    async fn complete(
        &self,
        job: &Job,
        summary: serde_json::Value,
        manifest_ref: String,
        artifact_bytes: u64,
    ) -> Result<RunOutcome, JobStoreError> {
        let transition = Transition::Complete {
            at: timestamp_now(),
            summary,
            manifest_ref,
            artifact_bytes,
        };
        match self
            .registry
            .transition(job.id, ExpectedState::of(job), &transition)
            .await
        {
            Ok(_) => {
                self.retention.after_terminal(&job.tenant_id).await;
                Ok(RunOutcome::Completed)
            }
            Err(JobStoreError::NotFound(_)) => {
                // Deleted while we were processing; nothing references these blobs.
                info!(job_id = %job.id, "job deleted during processing, discarding artifacts");
                self.discard_blobs(job).await;
                Ok(RunOutcome::Skipped)
            }
            Err(JobStoreError::StaleTransition { actual, .. }) => {
                warn!(job_id = %job.id, status = %actual, "job changed state during processing");
                Ok(RunOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    async fn on_transient(&self, job: &Job, msg: String) -> Result<RunOutcome, JobStoreError> {
        let attempts = job.attempts + 1;
        if !self.config.retry.should_retry(attempts) {
            let detail = format!("{msg} (gave up after {attempts} attempts)");
            return self.fail(job, detail, attempts).await;
        }

        let delay = self.config.retry.delay_for_attempt(attempts);
        let not_before = timestamp_now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let transition = Transition::Requeue {
            attempts,
            not_before: Some(not_before),
        };
        match self
            .registry
            .transition(job.id, ExpectedState::of(job), &transition)
            .await
        {
            Ok(_) => {
                warn!(
                    tenant_id = %job.tenant_id,
                    job_id = %job.id,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %msg,
                    "transient failure, job re-queued"
                );
                self.queue.push_after(job.id, delay);
                Ok(RunOutcome::Requeued { attempts, delay })
            }
            Err(JobStoreError::NotFound(_) | JobStoreError::StaleTransition { .. }) => {
                Ok(RunOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    async fn fail(&self, job: &Job, detail: String, attempts: u32) -> Result<RunOutcome, JobStoreError> {
        let transition = Transition::Fail {
            at: timestamp_now(),
            detail: detail.clone(),
            attempts,
        };
        match self
            .registry
            .transition(job.id, ExpectedState::of(job), &transition)
            .await
        {
            Ok(_) => {
                warn!(tenant_id = %job.tenant_id, job_id = %job.id, attempts, detail = %detail, "job failed");
                self.retention.after_terminal(&job.tenant_id).await;
                Ok(RunOutcome::Failed { detail })
            }
            Err(JobStoreError::NotFound(_) | JobStoreError::StaleTransition { .. }) => {
                Ok(RunOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    async fn discard_blobs(&self, job: &Job) {
        if let Err(e) = self.storage.delete_prefix(&job.tenant_id, &job.id).await {
            warn!(job_id = %job.id, error = %e, "failed to discard artifacts");
        }
    }

    /// Spawn `config.workers` worker tasks.
    pub fn spawn(self) -> ExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = (0..self.config.workers.max(1))
            .map(|index| {
                let executor = self.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { executor.worker_loop(index, shutdown).await })
            })
            .collect();

        ExecutorHandle {
            shutdown: shutdown_tx,
            workers,
            stats: self.stats.clone(),
            started: Instant::now(),
        }
    }

    async fn worker_loop(self, index: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker = index, "executor worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let notified = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.queue.next(self.config.poll_interval) => next,
            };

            let candidates = match notified {
                Some(job_id) => vec![job_id],
                None => match self
                    .registry
                    .store()
                    .list_ready_pending(timestamp_now(), self.config.batch_size)
                    .await
                {
                    Ok(jobs) => jobs.into_iter().map(|j| j.id).collect(),
                    Err(e) => {
                        error!(worker = index, error = %e, "failed to poll for pending jobs");
                        Vec::new()
                    }
                },
            };

            for job_id in candidates {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = self.run_job(job_id).await {
                    error!(worker = index, job_id = %job_id, error = %e, "job execution failed");
                }
            }
        }

        info!(worker = index, "executor worker stopped");
    }
}
