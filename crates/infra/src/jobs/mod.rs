//! Job lifecycle: persistence, the registry contract, execution and recovery.
//!
//! ## Components
//!
//! - `JobStore`: persistence with a status compare-and-swap (in-memory or SQLite)
//! - `JobRegistry`: validated creation, tenant-scoped reads, transitions
//! - `TaskExecutor`: worker pool that claims and runs PENDING jobs
//! - `Reaper`: returns abandoned PROCESSING jobs to the queue
//! - `RetryPolicy`: backoff between transient failures

pub mod executor;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod sqlite;
pub mod store;
pub mod types;

pub use executor::{ExecutorConfig, ExecutorHandle, ExecutorStats, RunOutcome, TaskExecutor};
pub use queue::JobQueue;
pub use reaper::{ReapReport, Reaper, ReaperConfig, ReaperHandle};
pub use registry::{JobPage, JobRegistry, RegistryError};
pub use sqlite::SqliteJobStore;
pub use store::{ExpectedState, InMemoryJobStore, JobCursor, JobStore, JobStoreError};
pub use types::{BackoffStrategy, RetryPolicy};
