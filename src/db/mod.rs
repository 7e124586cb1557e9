//! Database connection and operations

pub mod catalog;
pub mod job_records;
pub mod sqlite_helpers;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::{info, warn};

pub use catalog::CatalogRepository;
pub use job_records::JobRecordRepository;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS job_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        priority INTEGER NOT NULL,
        type_tag TEXT NOT NULL,
        dedup_key TEXT NOT NULL,
        parameters TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (queue, dedup_key)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_job_records_dispatch
        ON job_records (queue, priority, updated_at, id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS provider_series (
        provider TEXT NOT NULL,
        series_id INTEGER NOT NULL,
        local_id INTEGER,
        title TEXT NOT NULL,
        poster_url TEXT,
        payload TEXT NOT NULL,
        fetched_at TEXT NOT NULL,
        PRIMARY KEY (provider, series_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS file_hashes (
        path TEXT PRIMARY KEY,
        size INTEGER NOT NULL,
        crc32 TEXT NOT NULL,
        sha256 TEXT NOT NULL,
        hashed_at TEXT NOT NULL
    )
    "#,
];

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database wrapper from an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the maximum connection pool size from environment or default
    fn get_max_connections() -> u32 {
        std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5)
    }

    /// Accepts `sqlite:` URLs or a plain file path
    fn connect_options(url: &str) -> Result<SqliteConnectOptions> {
        let options = if url.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(url).with_context(|| format!("Invalid database URL '{}'", url))?
        } else {
            let path = std::path::Path::new(url);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            SqliteConnectOptions::new().filename(path)
        };
        Ok(options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5)))
    }

    /// Create a new database connection pool
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(Self::get_max_connections())
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(Self::connect_options(url)?)
            .await
            .with_context(|| format!("Failed to open database '{}'", url))?;

        Ok(Self { pool })
    }

    /// Create a new database connection pool with retry logic
    /// Retries every `retry_interval` until `timeout` has passed
    pub async fn connect_with_retry(url: &str, retry_interval: Duration, timeout: Duration) -> Result<Self> {
        let started = std::time::Instant::now();
        loop {
            match Self::connect(url).await {
                Ok(db) => return Ok(db),
                Err(e) if started.elapsed() + retry_interval < timeout => {
                    warn!(
                        service = "database",
                        error = %e,
                        retry_in_secs = retry_interval.as_secs(),
                        "Database connection failed, retrying"
                    );
                    tokio::time::sleep(retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Create tables and indexes that don't exist yet
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to apply schema")?;
        }
        info!(service = "database", "Schema ready");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get the job record store
    pub fn job_records(&self) -> JobRecordRepository {
        JobRecordRepository::new(self.pool.clone())
    }

    /// Get the metadata catalog
    pub fn catalog(&self) -> CatalogRepository {
        CatalogRepository::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;

    /// A migrated database in a temp dir; keep the dir alive for the test's duration
    pub async fn temp_database() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let db = Database::connect(path.to_str().unwrap()).await.unwrap();
        db.ensure_schema().await.unwrap();
        (db, dir)
    }
}
