//! `wallettaser-core`: domain foundation for the job & artifact lifecycle.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the job state machine, manifest/asset types, vendor tags and
//! retention planning.

pub mod error;
pub mod id;
pub mod job;
pub mod manifest;
pub mod retention;
pub mod tag;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, TenantId};
pub use job::{Job, JobOptions, JobStatus, Transition, timestamp_now};
pub use manifest::{Asset, MANIFEST_NAME, Manifest};
pub use retention::{LedgerEntry, RETAIN_FLOOR, RetentionPolicy};
pub use tag::{Classification, VendorTag, normalize_vendor};
