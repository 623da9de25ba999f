//! Infrastructure layer: metadata store, blob storage, execution, retention.

pub mod config;
pub mod db;
pub mod jobs;
pub mod processor;
pub mod retention;
pub mod service;
pub mod storage;
pub mod tags;


pub use config::{ConfigError, MetadataConfig, Settings};
pub use retention::{RetentionEnforcer, SweepReport};
pub use service::{AssetDownload, JobService, ServiceError, VendorOverview};
