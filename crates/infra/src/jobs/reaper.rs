//! Stale-job reaper: recovers jobs whose executor vanished mid-run.
//!
//! A PROCESSING job whose `started_at` is older than `stale_after` is
//! presumed abandoned. It goes back to PENDING with one more attempt
//! counted, or to FAILED once the retry budget is spent.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use wallettaser_core::{Job, JobId, JobStatus, Transition, timestamp_now};

use super::queue::JobQueue;
use super::registry::JobRegistry;
use super::store::{ExpectedState, JobStoreError};
use super::types::RetryPolicy;
use crate::retention::RetentionEnforcer;

pub const ABANDONED_DETAIL: &str = "abandoned by executor";

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often to scan
    pub interval: Duration,
    /// PROCESSING longer than this is considered abandoned
    pub stale_after: Duration,
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(900),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: Vec<JobId>,
    pub failed: Vec<JobId>,
}

#[derive(Clone)]
pub struct Reaper {
    registry: JobRegistry,
    retention: RetentionEnforcer,
    queue: JobQueue,
    retry: RetryPolicy,
    config: ReaperConfig,
}

#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "reaper task panicked");
        }
    }
}

impl Reaper {
    pub fn new(
        registry: JobRegistry,
        retention: RetentionEnforcer,
        queue: JobQueue,
        retry: RetryPolicy,
        config: ReaperConfig,
    ) -> Self {
        Self {
            registry,
            retention,
            queue,
            retry,
            config,
        }
    }

    /// One scan over stale PROCESSING jobs.
    #[instrument(skip(self), err)]
    pub async fn reap_once(&self) -> Result<ReapReport, JobStoreError> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = timestamp_now()
            .checked_sub_signed(stale_after)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let stale = self
            .registry
            .store()
            .list_stale_processing(cutoff, self.config.batch_size)
            .await?;

        let mut report = ReapReport::default();
        for job in stale {
            match self.recover(&job).await {
                Ok(JobStatus::Pending) => report.requeued.push(job.id),
                Ok(_) => report.failed.push(job.id),
                // The executor finished, or someone else already recovered it.
                Err(JobStoreError::StaleTransition { .. } | JobStoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if !report.requeued.is_empty() || !report.failed.is_empty() {
            info!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "reaped stale jobs"
            );
        }
        Ok(report)
    }

    async fn recover(&self, job: &Job) -> Result<JobStatus, JobStoreError> {
        let attempts = job.attempts + 1;
        if self.retry.should_retry(attempts) {
            self.registry
                .transition(
                    job.id,
                    ExpectedState::of(job),
                    &Transition::Requeue {
                        attempts,
                        not_before: None,
                    },
                )
                .await?;
            warn!(tenant_id = %job.tenant_id, job_id = %job.id, attempts, "stale job re-queued");
            self.queue.push(job.id);
            return Ok(JobStatus::Pending);
        }

        self.registry
            .transition(
                job.id,
                ExpectedState::of(job),
                &Transition::Fail {
                    at: timestamp_now(),
                    detail: format!("{ABANDONED_DETAIL} (gave up after {attempts} attempts)"),
                    attempts,
                },
            )
            .await?;
        warn!(tenant_id = %job.tenant_id, job_id = %job.id, attempts, "stale job failed");
        self.retention.after_terminal(&job.tenant_id).await;
        Ok(JobStatus::Failed)
    }

    /// Run `reap_once` every `config.interval` until shut down.
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.reap_once().await {
                            error!(error = %e, "reaper scan failed");
                        }
                    }
                }
            }
            info!("reaper stopped");
        });

        ReaperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobStore;
    use crate::storage::LocalStorage;
    use std::sync::Arc;
    use wallettaser_core::{JobOptions, RetentionPolicy};

    struct Fixture {
        registry: JobRegistry,
        queue: JobQueue,
        _dir: tempfile::TempDir,
        retention: RetentionEnforcer,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(InMemoryJobStore::arc());
        let retention = RetentionEnforcer::new(
            registry.clone(),
            Arc::new(LocalStorage::new(dir.path())),
            RetentionPolicy::default(),
        );
        Fixture {
            registry,
            queue: JobQueue::new(),
            _dir: dir,
            retention,
        }
    }

    impl Fixture {
        fn reaper(&self, max_attempts: u32, stale_after: Duration) -> Reaper {
            Reaper::new(
                self.registry.clone(),
                self.retention.clone(),
                self.queue.clone(),
                RetryPolicy::fixed(max_attempts, Duration::ZERO),
                ReaperConfig {
                    stale_after,
                    ..ReaperConfig::default()
                },
            )
        }

        async fn claimed(&self, attempts: u32) -> Job {
            let job = self.registry.create("acme", "s", JobOptions::default()).await.unwrap();
            if attempts > 0 {
                let now = timestamp_now();
                self.registry
                    .transition(job.id, JobStatus::Pending, &Transition::Claim { at: now })
                    .await
                    .unwrap();
                self.registry
                    .transition(
                        job.id,
                        JobStatus::Processing,
                        &Transition::Requeue {
                            attempts,
                            not_before: None,
                        },
                    )
                    .await
                    .unwrap();
            }
            let started = timestamp_now() - chrono::Duration::hours(1);
            self.registry
                .transition(job.id, JobStatus::Pending, &Transition::Claim { at: started })
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn stale_job_is_requeued_and_notified() {
        let fx = fixture();
        let job = fx.claimed(0).await;

        let report = fx.reaper(3, Duration::from_secs(60)).reap_once().await.unwrap();
        assert_eq!(report.requeued, vec![job.id]);

        let pending = fx.registry.load(job.id).await.unwrap().unwrap();
        assert_eq!(pending.status, JobStatus::Pending);
        assert_eq!(pending.attempts, 1);
        assert!(pending.started_at.is_none());
        assert_eq!(fx.queue.next(Duration::from_millis(10)).await, Some(job.id));
    }

    #[tokio::test]
    async fn fresh_jobs_are_left_alone() {
        let fx = fixture();
        let job = fx.claimed(0).await;

        let report = fx.reaper(3, Duration::from_secs(7200)).reap_once().await.unwrap();
        assert_eq!(report, ReapReport::default());
        assert_eq!(
            fx.registry.load(job.id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn exhausted_job_is_failed() {
        let fx = fixture();
        let job = fx.claimed(2).await;

        let report = fx.reaper(3, Duration::from_secs(60)).reap_once().await.unwrap();
        assert_eq!(report.failed, vec![job.id]);

        let failed = fx.registry.load(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 3);
        failed.check_invariants().unwrap();
        assert!(failed.error_detail.unwrap().starts_with(ABANDONED_DETAIL));
    }

    #[tokio::test]
    async fn spawned_reaper_stops_on_shutdown() {
        let fx = fixture();
        let job = fx.claimed(0).await;
        let mut reaper = fx.reaper(3, Duration::from_secs(60));
        reaper.config.interval = Duration::from_millis(10);

        let handle = reaper.spawn();
        assert_eq!(fx.queue.next(Duration::from_secs(2)).await, Some(job.id));
        handle.shutdown().await;
    }
}
