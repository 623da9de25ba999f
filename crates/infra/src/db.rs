//! SQLite connection pool and schema.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        job_id          TEXT PRIMARY KEY,
        tenant_id       TEXT NOT NULL,
        status          TEXT NOT NULL,
        source_ref      TEXT NOT NULL,
        options         TEXT NOT NULL,
        attempts        INTEGER NOT NULL DEFAULT 0,
        created_at      INTEGER NOT NULL,
        started_at      INTEGER NULL,
        completed_at    INTEGER NULL,
        not_before      INTEGER NULL,
        error_detail    TEXT NULL,
        summary         TEXT NULL,
        manifest_ref    TEXT NULL,
        artifact_bytes  INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_jobs_tenant_created
        ON jobs (tenant_id, created_at DESC, job_id DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_jobs_status
        ON jobs (status, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vendor_tags (
        tenant_id       TEXT NOT NULL,
        vendor          TEXT NOT NULL,
        classification  TEXT NOT NULL,
        last_updated    INTEGER NOT NULL,
        PRIMARY KEY (tenant_id, vendor)
    )
    "#,
];

/// Open a pool for `url` and create the schema.
///
/// In-memory databases are limited to one connection, since every SQLite
/// connection to `:memory:` is a separate database.
pub async fn connect(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = url.contains(":memory:");
    let mut options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(8)
    };
    let pool = pool_options.connect_with(options).await?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Create tables and indexes if they do not exist.
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub(crate) fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    connect("sqlite::memory:").await.unwrap()
}
