//! Database service: wraps the SQLite pool for lifecycle (start/stop/health) and dependencies.
//!
//! Services that need the database (e.g. the queues) declare `dependencies: ["database"]`.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::query;
use tracing::info;

use crate::db::Database;
use crate::services::manager::{Service, ServiceHealth};

/// Service that owns the database pool and provides start/stop/health.
pub struct DatabaseService {
    db: Database,
}

impl DatabaseService {
    /// Create a new database service with an already-connected pool.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl Service for DatabaseService {
    fn name(&self) -> &str {
        "database"
    }

    async fn start(&self) -> Result<()> {
        info!(service = "database", "Database service starting");
        // Pool is already connected by caller; just verify
        query("SELECT 1").execute(self.db.pool()).await?;
        self.db.ensure_schema().await?;
        info!(service = "database", "Database service started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!(service = "database", "Closing database pool");
        self.db.close().await;
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        if self.db.pool().is_closed() {
            return Ok(ServiceHealth::unhealthy("pool closed"));
        }
        Ok(match query("SELECT 1").execute(self.db.pool()).await {
            Ok(_) => ServiceHealth::healthy(),
            Err(e) => ServiceHealth::unhealthy(e.to_string()),
        })
    }
}
