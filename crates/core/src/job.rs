//! The job record and its state machine.
//!
//! ```text
//! PENDING ──claim──▶ PROCESSING ──complete──▶ COMPLETED
//!    │                  │  │
//!    │                  │  └──fail──▶ FAILED
//!    │                  └──requeue──▶ PENDING
//!    └──────────fail (forced)──────▶ FAILED
//! ```
//!
//! Terminal states never change again. `Job::apply` is the only way to derive
//! the next version of a job; stores persist its output behind a status CAS.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, TenantId};

/// Current time truncated to microseconds (the precision stores persist).
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by exactly one executor
    Processing,
    /// Artifacts and summary recorded
    Completed,
    /// Gave up; `error_detail` says why
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Edges of the state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Pending)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Caller-supplied processing options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Overrides the processor's default currency conversion rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fx_rate: Option<f64>,
}

impl JobOptions {
    pub fn with_fx_rate(fx_rate: f64) -> Self {
        Self {
            fx_rate: Some(fx_rate),
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if let Some(rate) = self.fx_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(DomainError::validation("fx_rate must be a positive number"));
            }
        }
        Ok(())
    }
}

/// A requested state change together with the fields it writes.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// PENDING → PROCESSING
    Claim { at: DateTime<Utc> },
    /// PROCESSING → COMPLETED
    Complete {
        at: DateTime<Utc>,
        summary: serde_json::Value,
        manifest_ref: String,
        artifact_bytes: u64,
    },
    /// PROCESSING/PENDING → FAILED
    Fail {
        at: DateTime<Utc>,
        detail: String,
        attempts: u32,
    },
    /// PROCESSING → PENDING (retry or reaped)
    Requeue {
        attempts: u32,
        not_before: Option<DateTime<Utc>>,
    },
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Claim { .. } => JobStatus::Processing,
            Transition::Complete { .. } => JobStatus::Completed,
            Transition::Fail { .. } => JobStatus::Failed,
            Transition::Requeue { .. } => JobStatus::Pending,
        }
    }
}

/// A unit of work turning an uploaded statement into artifacts + summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub status: JobStatus,
    /// Opaque handle to the uploaded input (owned by the uploader).
    pub source_ref: String,
    pub options: JobOptions,
    /// Failed or abandoned executions so far.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a re-queued job may be claimed again.
    pub not_before: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
    pub summary: Option<serde_json::Value>,
    pub manifest_ref: Option<String>,
    /// Sum of asset sizes listed in the manifest.
    pub artifact_bytes: u64,
}

impl Job {
    /// Create a new PENDING job.
    pub fn new(
        tenant_id: TenantId,
        source_ref: impl Into<String>,
        options: JobOptions,
    ) -> DomainResult<Self> {
        let source_ref = source_ref.into();
        if source_ref.trim().is_empty() {
            return Err(DomainError::validation("source_ref is required"));
        }
        options.validate()?;

        Ok(Self {
            id: JobId::new(),
            tenant_id,
            status: JobStatus::Pending,
            source_ref,
            options,
            attempts: 0,
            created_at: timestamp_now(),
            started_at: None,
            completed_at: None,
            not_before: None,
            error_detail: None,
            summary: None,
            manifest_ref: None,
            artifact_bytes: 0,
        })
    }

    /// Whether the job may be claimed at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.not_before.is_none_or(|at| at <= now)
    }

    /// Derive the job that results from applying `transition` to a job in `from`.
    ///
    /// Does not compare `from` with `self.status`; that comparison is the
    /// store's compare-and-swap.
    pub fn apply(&self, from: JobStatus, transition: &Transition) -> DomainResult<Job> {
        let to = transition.target();
        if !from.can_transition_to(to) {
            return Err(DomainError::invalid_transition(format!(
                "{from} -> {to} is not allowed"
            )));
        }

        let mut next = self.clone();
        next.status = to;
        match transition {
            Transition::Claim { at } => {
                next.started_at = Some(*at);
                next.not_before = None;
            }
            Transition::Complete {
                at,
                summary,
                manifest_ref,
                artifact_bytes,
            } => {
                next.completed_at = Some(*at);
                next.summary = Some(summary.clone());
                next.manifest_ref = Some(manifest_ref.clone());
                next.artifact_bytes = *artifact_bytes;
                next.error_detail = None;
            }
            Transition::Fail {
                at,
                detail,
                attempts,
            } => {
                // A forced failure of a PENDING job starts and ends at once.
                next.started_at = next.started_at.or(Some(*at));
                next.completed_at = Some(*at);
                next.error_detail = Some(detail.clone());
                next.attempts = *attempts;
                next.manifest_ref = None;
                next.not_before = None;
            }
            Transition::Requeue {
                attempts,
                not_before,
            } => {
                next.started_at = None;
                next.attempts = *attempts;
                next.not_before = *not_before;
            }
        }
        Ok(next)
    }

    /// Check the timestamp and manifest invariants for the current status.
    pub fn check_invariants(&self) -> DomainResult<()> {
        let started = self.started_at.is_some();
        let completed = self.completed_at.is_some();
        let has_manifest = self.manifest_ref.is_some();

        let ok = match self.status {
            JobStatus::Pending => !started && !completed && !has_manifest,
            JobStatus::Processing => started && !completed && !has_manifest,
            JobStatus::Completed => started && completed && has_manifest,
            JobStatus::Failed => started && completed && !has_manifest,
        };

        if ok {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "job {} violates {} invariants",
                self.id, self.status
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tenant() -> TenantId {
        TenantId::parse("tenant-a").unwrap()
    }

    fn pending_job() -> Job {
        Job::new(tenant(), "uploads/statement.xlsx", JobOptions::default()).unwrap()
    }

    #[test]
    fn new_job_requires_source_and_valid_options() {
        assert!(matches!(
            Job::new(tenant(), "  ", JobOptions::default()),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            Job::new(tenant(), "s", JobOptions::with_fx_rate(-1.0)),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            Job::new(tenant(), "s", JobOptions::with_fx_rate(f64::NAN)),
            Err(DomainError::Validation(_))
        ));

        let job = pending_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        job.check_invariants().unwrap();
    }

    #[test]
    fn job_lifecycle() {
        let job = pending_job();
        let now = timestamp_now();

        let processing = job
            .apply(JobStatus::Pending, &Transition::Claim { at: now })
            .unwrap();
        assert_eq!(processing.status, JobStatus::Processing);
        assert_eq!(processing.started_at, Some(now));
        processing.check_invariants().unwrap();

        let completed = processing
            .apply(
                JobStatus::Processing,
                &Transition::Complete {
                    at: now,
                    summary: serde_json::json!({"total": 3}),
                    manifest_ref: "tenant-a/j/manifest.json".into(),
                    artifact_bytes: 42,
                },
            )
            .unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert_eq!(completed.artifact_bytes, 42);
        completed.check_invariants().unwrap();
    }

    #[test]
    fn terminal_states_and_double_claims_are_rejected() {
        let job = pending_job();
        let now = timestamp_now();

        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Processing));
        assert!(matches!(
            job.apply(JobStatus::Processing, &Transition::Claim { at: now }),
            Err(DomainError::InvalidTransition(_))
        ));

        for terminal in [JobStatus::Completed, JobStatus::Failed] {
            for t in [
                Transition::Claim { at: now },
                Transition::Fail {
                    at: now,
                    detail: "x".into(),
                    attempts: 1,
                },
                Transition::Requeue {
                    attempts: 1,
                    not_before: None,
                },
            ] {
                assert!(job.apply(terminal, &t).is_err());
            }
        }
    }

    #[test]
    fn forced_failure_of_pending_job_sets_both_timestamps() {
        let job = pending_job();
        let now = timestamp_now();
        let failed = job
            .apply(
                JobStatus::Pending,
                &Transition::Fail {
                    at: now,
                    detail: "cancelled by uploader".into(),
                    attempts: 0,
                },
            )
            .unwrap();

        assert_eq!(failed.started_at, Some(now));
        assert_eq!(failed.completed_at, Some(now));
        failed.check_invariants().unwrap();
    }

    #[test]
    fn requeue_clears_start_and_honours_backoff() {
        let now = timestamp_now();
        let processing = pending_job()
            .apply(JobStatus::Pending, &Transition::Claim { at: now })
            .unwrap();
        let later = now + chrono::Duration::seconds(30);

        let requeued = processing
            .apply(
                JobStatus::Processing,
                &Transition::Requeue {
                    attempts: 1,
                    not_before: Some(later),
                },
            )
            .unwrap();

        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.started_at, None);
        assert_eq!(requeued.attempts, 1);
        assert!(!requeued.is_ready(now));
        assert!(requeued.is_ready(later));
        requeued.check_invariants().unwrap();
    }

    fn arb_transition() -> impl Strategy<Value = Transition> {
        let at = Just(timestamp_now());
        prop_oneof![
            at.clone().prop_map(|at| Transition::Claim { at }),
            (at.clone(), 0u64..10_000).prop_map(|(at, bytes)| Transition::Complete {
                at,
                summary: serde_json::json!({}),
                manifest_ref: "m".into(),
                artifact_bytes: bytes,
            }),
            (at, 0u32..5).prop_map(|(at, attempts)| Transition::Fail {
                at,
                detail: "boom".into(),
                attempts,
            }),
            (0u32..5).prop_map(|attempts| Transition::Requeue {
                attempts,
                not_before: None
            }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            .. ProptestConfig::default()
        })]

        #[test]
        fn invariants_hold_for_any_accepted_transition_sequence(
            steps in prop::collection::vec(arb_transition(), 0..12)
        ) {
            let mut job = pending_job();
            for step in steps {
                if let Ok(next) = job.apply(job.status, &step) {
                    prop_assert!(!job.status.is_terminal());
                    job = next;
                }
                prop_assert!(job.check_invariants().is_ok());
            }
        }
    }
}
