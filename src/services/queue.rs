//! Queue service: runs the scheduler's dispatch loops under the services manager

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::info;

use crate::queue::{QueueState, Scheduler};
use crate::services::manager::{Service, ServiceHealth};

pub struct QueueService {
    scheduler: Scheduler,
    depends_on_database: bool,
}

impl QueueService {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            depends_on_database: true,
        }
    }

    /// For schedulers backed by an in-memory store
    pub fn without_database(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            depends_on_database: false,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

#[async_trait]
impl Service for QueueService {
    fn name(&self) -> &str {
        "queues"
    }

    fn dependencies(&self) -> Vec<String> {
        if self.depends_on_database {
            vec!["database".to_string()]
        } else {
            Vec::new()
        }
    }

    async fn start(&self) -> Result<()> {
        self.scheduler.start();
        info!(service = "queues", "Queue dispatch loops running");
        Ok(())
    }

    /// Dispatch loops can't be restarted once cancelled, so stopping is final
    async fn stop(&self) -> Result<()> {
        self.scheduler.shutdown().await;
        Ok(())
    }

    /// Refused: a stop would leave nothing for start to bring back
    async fn restart(&self) -> Result<()> {
        bail!("queues cannot be restarted in place; restart the process")
    }

    async fn health(&self) -> Result<ServiceHealth> {
        let backing_off: Vec<String> = self
            .scheduler
            .queues()
            .iter()
            .filter(|queue| queue.state().state == QueueState::Paused && !queue.is_paused())
            .map(|queue| queue.name().to_string())
            .collect();
        if !backing_off.is_empty() {
            return Ok(ServiceHealth::degraded(format!(
                "job store unavailable for: {}",
                backing_off.join(", ")
            )));
        }
        if self.scheduler.queues().iter().any(|queue| queue.is_cancelled()) {
            return Ok(ServiceHealth::unhealthy("queues cancelled"));
        }
        Ok(ServiceHealth::healthy())
    }
}
