use std::sync::Arc;

use anyhow::Context;

use wallettaser_infra::jobs::{
    InMemoryJobStore, JobQueue, JobRegistry, JobStore, Reaper, SqliteJobStore, TaskExecutor,
};
use wallettaser_infra::processor::CommandProcessor;
use wallettaser_infra::storage::build_storage;
use wallettaser_infra::tags::{InMemoryVendorTagStore, SqliteVendorTagStore, VendorTagStore};
use wallettaser_infra::{MetadataConfig, RetentionEnforcer, Settings, db};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; real deployments set the variables directly.
    let _ = dotenvy::dotenv();

    let settings = Settings::from_env()?;
    wallettaser_observability::init(settings.log_format);

    let program = settings
        .processor_cmd
        .clone()
        .context("WALLETTASER_PROCESSOR_CMD must be set")?;

    let (jobs, tags): (Arc<dyn JobStore>, Arc<dyn VendorTagStore>) = match &settings.metadata {
        MetadataConfig::Memory => {
            tracing::warn!("using in-memory metadata; jobs are lost on restart");
            let jobs: Arc<dyn JobStore> = InMemoryJobStore::arc();
            let tags: Arc<dyn VendorTagStore> = InMemoryVendorTagStore::arc();
            (jobs, tags)
        }
        MetadataConfig::Sqlite { url } => {
            let pool = db::connect(url)
                .await
                .context("failed to open metadata database")?;
            let jobs: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(pool.clone()));
            let tags: Arc<dyn VendorTagStore> = Arc::new(SqliteVendorTagStore::new(pool));
            (jobs, tags)
        }
    };

    let registry = JobRegistry::new(jobs);
    let storage = build_storage(&settings.storage)?;
    let retention = RetentionEnforcer::new(registry.clone(), storage.clone(), settings.retention.clone());
    let queue = JobQueue::new();

    let executor = TaskExecutor::new(
        registry.clone(),
        tags,
        storage,
        Arc::new(CommandProcessor::new(program)),
        retention.clone(),
        queue.clone(),
        settings.executor.clone(),
    )
    .spawn();
    let reaper = Reaper::new(
        registry,
        retention,
        queue,
        settings.executor.retry.clone(),
        settings.reaper.clone(),
    )
    .spawn();

    tracing::info!(
        workers = settings.executor.workers,
        stale_after_secs = settings.reaper.stale_after.as_secs(),
        "worker started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested, waiting for in-flight jobs");

    reaper.shutdown().await;
    let stats = executor.shutdown().await;

    tracing::info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        retried = stats.jobs_retried,
        "worker stopped"
    );
    Ok(())
}
