//! Retention planning.
//!
//! Pure functions deciding which jobs to evict; the infra enforcer performs
//! the deletes.

use chrono::{DateTime, Duration, Utc};

use crate::id::JobId;

/// Completed jobs a sweep always leaves in place, whatever the caps say.
pub const RETAIN_FLOOR: usize = 1;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Per-tenant retention caps. `None` disables a dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_results: Option<usize>,
    pub max_age_days: Option<u32>,
    pub max_storage_mb: Option<u64>,
    /// How long FAILED jobs are kept before unconditional eviction.
    pub failed_grace: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_results: None,
            max_age_days: None,
            max_storage_mb: None,
            failed_grace: Duration::hours(24),
        }
    }
}

/// One row of the tenant storage ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub job_id: JobId,
    pub completed_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl RetentionPolicy {
    pub fn max_storage_bytes(&self) -> Option<u64> {
        self.max_storage_mb.map(|mb| mb.saturating_mul(BYTES_PER_MB))
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_results.is_none() && self.max_age_days.is_none() && self.max_storage_mb.is_none()
    }

    /// Completed jobs to evict, oldest first.
    ///
    /// Evicts from the front of the ledger while any cap is exceeded, never
    /// going below `RETAIN_FLOOR` remaining jobs.
    pub fn plan_evictions(&self, ledger: &[LedgerEntry], now: DateTime<Utc>) -> Vec<JobId> {
        let mut ordered: Vec<&LedgerEntry> = ledger.iter().collect();
        ordered.sort_by(|a, b| {
            a.completed_at
                .cmp(&b.completed_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });

        let max_age = self.max_age_days.map(|days| Duration::days(i64::from(days)));
        let max_bytes = self.max_storage_bytes();

        let mut remaining = ordered.len();
        let mut total: u64 = ordered.iter().map(|e| e.size_bytes).sum();
        let mut evicted = Vec::new();

        for entry in ordered {
            if remaining <= RETAIN_FLOOR {
                break;
            }
            let over_count = self.max_results.is_some_and(|max| remaining > max);
            let too_old = max_age.is_some_and(|age| now - entry.completed_at > age);
            let over_size = max_bytes.is_some_and(|max| total > max);
            if !(over_count || too_old || over_size) {
                break;
            }
            evicted.push(entry.job_id);
            remaining -= 1;
            total = total.saturating_sub(entry.size_bytes);
        }
        evicted
    }

    /// FAILED jobs whose grace period has elapsed.
    pub fn expired_failures(&self, failed: &[LedgerEntry], now: DateTime<Utc>) -> Vec<JobId> {
        failed
            .iter()
            .filter(|e| now - e.completed_at >= self.failed_grace)
            .map(|e| e.job_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(now: DateTime<Utc>, ages_days: &[i64], size: u64) -> Vec<LedgerEntry> {
        ages_days
            .iter()
            .map(|age| LedgerEntry {
                job_id: JobId::new(),
                completed_at: now - Duration::days(*age),
                size_bytes: size,
            })
            .collect()
    }

    #[test]
    fn count_cap_evicts_oldest() {
        let now = Utc::now();
        let entries = ledger(now, &[3, 2, 1, 0], 10);
        let policy = RetentionPolicy {
            max_results: Some(3),
            ..RetentionPolicy::default()
        };

        assert_eq!(policy.plan_evictions(&entries, now), vec![entries[0].job_id]);
    }

    #[test]
    fn age_cap_is_strict() {
        let now = Utc::now();
        let entries = ledger(now, &[8, 7, 1], 10);
        let policy = RetentionPolicy {
            max_age_days: Some(7),
            ..RetentionPolicy::default()
        };

        // Exactly seven days old is still within the cap.
        assert_eq!(policy.plan_evictions(&entries, now), vec![entries[0].job_id]);
    }

    #[test]
    fn size_cap_evicts_until_under_budget() {
        let now = Utc::now();
        let mb = 1024 * 1024;
        let entries = ledger(now, &[4, 3, 2, 1], mb);
        let policy = RetentionPolicy {
            max_storage_mb: Some(2),
            ..RetentionPolicy::default()
        };

        let evicted = policy.plan_evictions(&entries, now);
        assert_eq!(evicted, vec![entries[0].job_id, entries[1].job_id]);
    }

    #[test]
    fn last_completed_job_survives_every_cap() {
        let now = Utc::now();
        let entries = ledger(now, &[400], 50 * 1024 * 1024);
        let policy = RetentionPolicy {
            max_results: Some(0),
            max_age_days: Some(1),
            max_storage_mb: Some(1),
            ..RetentionPolicy::default()
        };

        assert!(policy.plan_evictions(&entries, now).is_empty());
    }

    #[test]
    fn unbounded_policy_keeps_everything() {
        let now = Utc::now();
        let entries = ledger(now, &[900, 500, 1], u64::MAX / 4);
        let policy = RetentionPolicy::default();
        assert!(policy.is_unbounded());
        assert!(policy.plan_evictions(&entries, now).is_empty());
    }

    #[test]
    fn failures_expire_after_grace() {
        let now = Utc::now();
        let failed = vec![
            LedgerEntry {
                job_id: JobId::new(),
                completed_at: now - Duration::hours(25),
                size_bytes: 0,
            },
            LedgerEntry {
                job_id: JobId::new(),
                completed_at: now - Duration::hours(1),
                size_bytes: 0,
            },
        ];
        let policy = RetentionPolicy::default();
        assert_eq!(policy.expired_failures(&failed, now), vec![failed[0].job_id]);

        let immediate = RetentionPolicy {
            failed_grace: Duration::zero(),
            ..RetentionPolicy::default()
        };
        assert_eq!(immediate.expired_failures(&failed, now).len(), 2);
    }
}
