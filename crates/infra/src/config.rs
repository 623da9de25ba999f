//! Configuration loading and representation.
//!
//! Every setting comes from a `WALLETTASER_*` variable. `Settings::from_lookup`
//! takes any key -> value function so callers (and tests) need not touch the
//! process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use wallettaser_core::RetentionPolicy;
use wallettaser_observability::LogFormat;

use crate::jobs::{BackoffStrategy, ExecutorConfig, ReaperConfig, RetryPolicy};
use crate::storage::StorageConfig;

pub const DEFAULT_METADATA_URL: &str = "sqlite://wallettaser.db?mode=rwc";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Where job and vendor-tag rows live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataConfig {
    Memory,
    Sqlite { url: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub metadata: MetadataConfig,
    pub storage: StorageConfig,
    pub retention: RetentionPolicy,
    pub executor: ExecutorConfig,
    pub reaper: ReaperConfig,
    /// External report program; only the worker binary needs it.
    pub processor_cmd: Option<PathBuf>,
    pub log_format: LogFormat,
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, var: &'static str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        self.raw(var)
            .map(|v| {
                v.parse::<T>().map_err(|e| ConfigError::Invalid {
                    var,
                    message: format!("{v:?}: {e}"),
                })
            })
            .transpose()
    }

    fn parse_or<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        Ok(self.parse(var)?.unwrap_or(default))
    }

    fn positive(&self, var: &'static str, default: u64) -> Result<u64, ConfigError> {
        let value = self.parse_or(var, default)?;
        if value == 0 {
            return Err(ConfigError::Invalid {
                var,
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let metadata = match vars.raw("WALLETTASER_METADATA_URL") {
            Some(url) if url.eq_ignore_ascii_case("memory") => MetadataConfig::Memory,
            Some(url) => MetadataConfig::Sqlite { url },
            None => MetadataConfig::Sqlite {
                url: DEFAULT_METADATA_URL.to_string(),
            },
        };

        let backend = vars
            .raw("WALLETTASER_STORAGE_BACKEND")
            .unwrap_or_else(|| "local".to_string())
            .to_ascii_lowercase();
        let storage = match backend.as_str() {
            "local" => StorageConfig::Local {
                root: PathBuf::from(
                    vars.raw("WALLETTASER_STORAGE_PATH")
                        .unwrap_or_else(|| "storage".to_string()),
                ),
            },
            "s3" => StorageConfig::S3 {
                bucket: vars
                    .raw("WALLETTASER_S3_BUCKET")
                    .ok_or(ConfigError::Missing("WALLETTASER_S3_BUCKET"))?,
                prefix: vars.raw("WALLETTASER_S3_PREFIX").unwrap_or_default(),
            },
            other => {
                return Err(ConfigError::Invalid {
                    var: "WALLETTASER_STORAGE_BACKEND",
                    message: format!("unknown backend {other:?} (expected local or s3)"),
                });
            }
        };

        let retention = RetentionPolicy {
            max_results: vars.parse("WALLETTASER_MAX_RESULTS")?,
            max_age_days: vars.parse("WALLETTASER_MAX_AGE_DAYS")?,
            max_storage_mb: vars.parse("WALLETTASER_MAX_STORAGE_MB")?,
            failed_grace: chrono::Duration::hours(
                vars.parse_or::<u32>("WALLETTASER_FAILED_GRACE_HOURS", 24)?.into(),
            ),
        };

        let max_attempts = vars.positive("WALLETTASER_MAX_ATTEMPTS", 3)?;
        let base_delay = Duration::from_millis(vars.parse_or("WALLETTASER_RETRY_BASE_MS", 500)?);
        let max_delay = Duration::from_millis(vars.parse_or("WALLETTASER_RETRY_MAX_MS", 60_000)?);
        if max_delay < base_delay {
            return Err(ConfigError::Invalid {
                var: "WALLETTASER_RETRY_MAX_MS",
                message: "must not be below WALLETTASER_RETRY_BASE_MS".to_string(),
            });
        }
        let strategy: BackoffStrategy =
            vars.parse_or("WALLETTASER_RETRY_BACKOFF", BackoffStrategy::Exponential)?;
        let retry = RetryPolicy {
            max_attempts: u32::try_from(max_attempts).map_err(|_| ConfigError::Invalid {
                var: "WALLETTASER_MAX_ATTEMPTS",
                message: "too large".to_string(),
            })?,
            base_delay,
            max_delay,
            strategy,
            ..RetryPolicy::default()
        };

        let processor_timeout =
            Duration::from_secs(vars.positive("WALLETTASER_PROCESSOR_TIMEOUT_SECS", 300)?);
        let executor = ExecutorConfig {
            workers: vars.positive("WALLETTASER_WORKERS", 4)? as usize,
            poll_interval: Duration::from_millis(vars.positive("WALLETTASER_POLL_INTERVAL_MS", 500)?),
            processor_timeout,
            retry,
            ..ExecutorConfig::default()
        };

        let stale_after = Duration::from_secs(vars.positive("WALLETTASER_STALE_AFTER_SECS", 900)?);
        // A live run must never look abandoned.
        if stale_after <= processor_timeout {
            return Err(ConfigError::Invalid {
                var: "WALLETTASER_STALE_AFTER_SECS",
                message: "must exceed WALLETTASER_PROCESSOR_TIMEOUT_SECS".to_string(),
            });
        }
        let reaper = ReaperConfig {
            interval: Duration::from_secs(vars.positive("WALLETTASER_REAPER_INTERVAL_SECS", 60)?),
            stale_after,
            ..ReaperConfig::default()
        };

        Ok(Self {
            metadata,
            storage,
            retention,
            executor,
            reaper,
            processor_cmd: vars.raw("WALLETTASER_PROCESSOR_CMD").map(PathBuf::from),
            log_format: vars.parse_or("WALLETTASER_LOG_FORMAT", LogFormat::default())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let s = settings(&[]).unwrap();
        assert_eq!(
            s.metadata,
            MetadataConfig::Sqlite {
                url: DEFAULT_METADATA_URL.to_string()
            }
        );
        assert_eq!(
            s.storage,
            StorageConfig::Local {
                root: PathBuf::from("storage")
            }
        );
        assert!(s.retention.is_unbounded());
        assert_eq!(s.retention.failed_grace, chrono::Duration::hours(24));
        assert_eq!(s.executor.workers, 4);
        assert_eq!(s.executor.retry.max_attempts, 3);
        assert_eq!(s.executor.retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(s.reaper.stale_after, Duration::from_secs(900));
        assert!(s.processor_cmd.is_none());
        assert_eq!(s.log_format, LogFormat::Json);
    }

    #[test]
    fn reads_overrides() {
        let s = settings(&[
            ("WALLETTASER_METADATA_URL", "memory"),
            ("WALLETTASER_STORAGE_BACKEND", "S3"),
            ("WALLETTASER_S3_BUCKET", "reports"),
            ("WALLETTASER_S3_PREFIX", "prod"),
            ("WALLETTASER_MAX_RESULTS", "10"),
            ("WALLETTASER_MAX_STORAGE_MB", "50"),
            ("WALLETTASER_FAILED_GRACE_HOURS", "0"),
            ("WALLETTASER_RETRY_BACKOFF", "linear"),
            ("WALLETTASER_PROCESSOR_CMD", "/usr/local/bin/analyze"),
        ])
        .unwrap();

        assert_eq!(s.metadata, MetadataConfig::Memory);
        assert_eq!(
            s.storage,
            StorageConfig::S3 {
                bucket: "reports".into(),
                prefix: "prod".into()
            }
        );
        assert_eq!(s.retention.max_results, Some(10));
        assert_eq!(s.retention.max_age_days, None);
        assert_eq!(s.retention.max_storage_mb, Some(50));
        assert_eq!(s.retention.failed_grace, chrono::Duration::zero());
        assert_eq!(s.executor.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(s.processor_cmd, Some(PathBuf::from("/usr/local/bin/analyze")));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = settings(&[("WALLETTASER_MAX_RESULTS", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WALLETTASER_MAX_RESULTS", .. }));

        let err = settings(&[("WALLETTASER_STORAGE_BACKEND", "ftp")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WALLETTASER_STORAGE_BACKEND", .. }));

        let err = settings(&[("WALLETTASER_WORKERS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WALLETTASER_WORKERS", .. }));

        assert_eq!(
            settings(&[("WALLETTASER_STORAGE_BACKEND", "s3")]).unwrap_err(),
            ConfigError::Missing("WALLETTASER_S3_BUCKET")
        );
    }

    #[test]
    fn staleness_must_exceed_processor_timeout() {
        let err = settings(&[
            ("WALLETTASER_PROCESSOR_TIMEOUT_SECS", "600"),
            ("WALLETTASER_STALE_AFTER_SECS", "600"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WALLETTASER_STALE_AFTER_SECS", .. }));
    }

    #[test]
    fn log_format_treats_blank_as_unset() {
        let s = settings(&[("WALLETTASER_LOG_FORMAT", "  ")]).unwrap();
        assert_eq!(s.log_format, LogFormat::Json);

        let s = settings(&[("WALLETTASER_LOG_FORMAT", "Pretty")]).unwrap();
        assert_eq!(s.log_format, LogFormat::Pretty);

        let err = settings(&[("WALLETTASER_LOG_FORMAT", "xml")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WALLETTASER_LOG_FORMAT", .. }));
    }
}
