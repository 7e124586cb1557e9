//! Scheduler: the set of queues plus everything they share

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use super::QueueName;
use super::controller::{EnqueueResult, QueueController, QueueSettings};
use super::filters::{AcquisitionFilter, PartitionBans};
use super::job::Job;
use super::partition::PartitionLimiter;
use super::registry::JobRegistry;
use super::state::QueueStateEvent;
use super::store::{JobStore, NewJobRecord};
use crate::error::{QueueError, QueueResult};
use crate::services::providers::JobServices;

/// Configures and builds a [`Scheduler`]
///
/// A queue gets a controller when it has explicit settings or at least one
/// registered job type routed to it.
pub struct SchedulerBuilder {
    store: Arc<dyn JobStore>,
    registry: JobRegistry,
    settings: HashMap<QueueName, QueueSettings>,
    partition_limits: HashMap<String, usize>,
    filters: Vec<Arc<dyn AcquisitionFilter>>,
    services: JobServices,
    start_paused: bool,
}

impl SchedulerBuilder {
    pub fn queue(mut self, name: QueueName, settings: QueueSettings) -> Self {
        self.settings.insert(name, settings);
        self
    }

    /// Override a partition's declared maximum. Zero leaves the declared value.
    pub fn partition_limit(mut self, partition: impl Into<String>, max: usize) -> Self {
        self.partition_limits.insert(partition.into(), max);
        self
    }

    pub fn partition_limits(mut self, limits: HashMap<String, usize>) -> Self {
        self.partition_limits.extend(limits);
        self
    }

    pub fn filter(mut self, filter: Arc<dyn AcquisitionFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn services(mut self, services: JobServices) -> Self {
        self.services = services;
        self
    }

    /// Start every queue paused
    pub fn start_paused(mut self, paused: bool) -> Self {
        self.start_paused = paused;
        self
    }

    pub fn build(self) -> Scheduler {
        let registry = Arc::new(self.registry);
        let limiter = Arc::new(PartitionLimiter::new(&registry, &self.partition_limits));
        let bans = Arc::new(PartitionBans::new());

        let mut filters: Vec<Arc<dyn AcquisitionFilter>> = vec![bans.clone() as Arc<dyn AcquisitionFilter>];
        filters.extend(self.filters);

        let queues = QueueName::ALL
            .into_iter()
            .filter(|name| {
                self.settings.contains_key(name) || registry.descriptors().any(|d| d.queue == *name)
            })
            .map(|name| {
                QueueController::new(
                    name,
                    self.settings.get(&name).cloned().unwrap_or_default(),
                    self.store.clone(),
                    registry.clone(),
                    limiter.clone(),
                    filters.clone(),
                    self.start_paused,
                )
            })
            .collect();

        Scheduler {
            inner: Arc::new(SchedulerInner {
                registry,
                limiter,
                bans,
                services: Arc::new(self.services),
                queues,
            }),
        }
    }
}

struct SchedulerInner {
    registry: Arc<JobRegistry>,
    limiter: Arc<PartitionLimiter>,
    bans: Arc<PartitionBans>,
    services: Arc<JobServices>,
    queues: Vec<QueueController>,
}

/// Cheap-to-clone handle shared by producers, operators and running jobs
///
/// Call [`Scheduler::shutdown`] before dropping the last handle; dispatch
/// loops hold a handle of their own until they are cancelled.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn builder(store: Arc<dyn JobStore>, registry: JobRegistry) -> SchedulerBuilder {
        SchedulerBuilder {
            store,
            registry,
            settings: HashMap::new(),
            partition_limits: HashMap::new(),
            filters: Vec::new(),
            services: JobServices::default(),
            start_paused: false,
        }
    }

    /// Spawn every queue's dispatch loop. Must be called inside a tokio runtime.
    pub fn start(&self) {
        for queue in &self.inner.queues {
            queue.start(self.clone());
        }
        info!(
            queues = ?self.inner.queues.iter().map(|q| q.name().as_str()).collect::<Vec<_>>(),
            job_types = self.inner.registry.len(),
            "Scheduler started"
        );
    }

    /// Persist `job` on its queue using the type's default priority
    pub async fn enqueue<J: Job>(&self, job: &J) -> QueueResult<EnqueueResult> {
        self.enqueue_with_priority(job, job.priority()).await
    }

    /// Persist `job` with an explicit priority, e.g. [`USER_PRIORITY`](super::USER_PRIORITY)
    pub async fn enqueue_with_priority<J: Job>(&self, job: &J, priority: i32) -> QueueResult<EnqueueResult> {
        let record = self.new_record(job, priority)?;
        self.queue(J::QUEUE)?
            .enqueue_record(record, J::CONFLICT_POLICY)
            .await
    }

    pub(crate) fn new_record<J: Job>(&self, job: &J, priority: i32) -> QueueResult<NewJobRecord> {
        if !self.inner.registry.contains(J::TYPE_TAG) {
            return Err(QueueError::UnknownJobType(J::TYPE_TAG.to_string()));
        }
        Ok(NewJobRecord {
            queue: J::QUEUE,
            priority,
            type_tag: J::TYPE_TAG.to_string(),
            dedup_key: job.dedup_key(),
            parameters: job.to_parameters()?,
        })
    }

    pub fn queue(&self, name: QueueName) -> QueueResult<&QueueController> {
        self.inner
            .queues
            .iter()
            .find(|queue| queue.name() == name)
            .ok_or(QueueError::QueueNotConfigured(name))
    }

    pub fn queues(&self) -> &[QueueController] {
        &self.inner.queues
    }

    pub fn states(&self) -> Vec<QueueStateEvent> {
        self.inner.queues.iter().map(|q| q.state()).collect()
    }

    pub async fn pause_all(&self) {
        for queue in &self.inner.queues {
            queue.pause().await;
        }
    }

    pub async fn resume_all(&self) {
        for queue in &self.inner.queues {
            queue.resume().await;
        }
    }

    /// Keep jobs of `partition` from starting on any queue for `duration`
    pub fn ban_partition(&self, partition: &str, duration: Duration, reason: impl Into<String>) -> DateTime<Utc> {
        let until = self.inner.bans.ban(partition, duration, reason);
        self.wake_all();
        until
    }

    pub fn lift_partition_ban(&self, partition: &str) -> bool {
        let lifted = self.inner.bans.lift(partition);
        self.wake_all();
        lifted
    }

    pub fn bans(&self) -> &PartitionBans {
        &self.inner.bans
    }

    pub fn limiter(&self) -> &PartitionLimiter {
        &self.inner.limiter
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn services(&self) -> &Arc<JobServices> {
        &self.inner.services
    }

    /// Ask every dispatch loop to re-check for eligible work
    pub fn wake_all(&self) {
        for queue in &self.inner.queues {
            queue.wake();
        }
    }

    /// Cancel every queue and wait for in-flight jobs to finish
    pub async fn shutdown(&self) {
        info!("Scheduler shutting down");
        for queue in &self.inner.queues {
            queue.cancel().await;
        }
        for queue in &self.inner.queues {
            queue.wait_for_drain().await;
        }
        info!("Scheduler stopped");
    }
}
