//! The job contract every schedulable unit of work implements

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::QueueName;
use super::scheduler::Scheduler;
use super::store::NewJobRecord;
use crate::error::QueueResult;
use crate::services::providers::JobServices;

/// Priority reserved for work a user explicitly asked for
pub const USER_PRIORITY: i32 = 1;

/// Priority used by job types that don't pick their own
pub const DEFAULT_PRIORITY: i32 = 6;

/// What enqueue does when a pending record already carries the same dedup key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Delete the existing record and store the new one
    Replace,
    /// Keep the existing record, drop the new one
    Ignore,
    /// Reject the enqueue with `QueueError::DuplicateJob`
    Error,
}

/// How many jobs sharing a partition may execute at once, across all queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Partitioning {
    /// No partition, limited only by worker slots
    #[default]
    Unbounded,
    /// At most one job of this type at a time; the partition is the type tag
    Exclusive,
    /// At most `max` jobs tagged `tag` at a time
    Shared { tag: &'static str, max: usize },
}

impl Partitioning {
    /// Partition tag for a job of `type_tag`, if any
    pub fn tag(&self, type_tag: &'static str) -> Option<&'static str> {
        match self {
            Partitioning::Unbounded => None,
            Partitioning::Exclusive => Some(type_tag),
            Partitioning::Shared { tag, .. } => Some(tag),
        }
    }

    /// Declared concurrency bound, if any
    pub fn max(&self) -> Option<usize> {
        match self {
            Partitioning::Unbounded => None,
            Partitioning::Exclusive => Some(1),
            Partitioning::Shared { max, .. } => Some(*max),
        }
    }
}

/// A unit of work that can be persisted, rehydrated and executed
///
/// Type-level properties are associated constants so they can't drift
/// between the record that was stored and the job that is rehydrated from it.
/// Parameters round-trip through serde_json.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct RefreshSeries { series_id: u64 }
///
/// #[async_trait]
/// impl Job for RefreshSeries {
///     const TYPE_TAG: &'static str = "RefreshSeries";
///     const PARTITIONING: Partitioning = Partitioning::Shared { tag: "TvDB", max: 4 };
///
///     fn dedup_key(&self) -> String {
///         format!("tvdb:refresh:{}", self.series_id)
///     }
///
///     async fn execute(&self, ctx: &JobContext) -> anyhow::Result<()> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable name persisted with every record. Must be unique per registry.
    const TYPE_TAG: &'static str;

    /// Queue records of this type are routed to
    const QUEUE: QueueName = QueueName::General;

    /// Priority used unless [`Job::priority`] is overridden. Lower runs first.
    const PRIORITY: i32 = DEFAULT_PRIORITY;

    const PARTITIONING: Partitioning = Partitioning::Unbounded;

    const CONFLICT_POLICY: ConflictPolicy = ConflictPolicy::Replace;

    /// Identity used to collapse duplicate pending work within a queue
    fn dedup_key(&self) -> String;

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    /// Human readable one-liner shown in queue state
    fn describe(&self) -> String {
        format!("{} ({})", Self::TYPE_TAG, self.dedup_key())
    }

    fn to_parameters(&self) -> QueueResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    async fn execute(&self, ctx: &JobContext) -> anyhow::Result<()>;
}

/// Handed to a running job
///
/// Gives access to the scheduler (for follow-up work and partition bans),
/// the shared collaborators, and a token that fires when the queue is cancelled.
#[derive(Clone)]
pub struct JobContext {
    scheduler: Scheduler,
    record_id: i64,
    cancellation: CancellationToken,
    deferred: Arc<Mutex<Vec<(NewJobRecord, ConflictPolicy)>>>,
}

impl JobContext {
    pub(crate) fn new(scheduler: Scheduler, record_id: i64, cancellation: CancellationToken) -> Self {
        Self {
            scheduler,
            record_id,
            cancellation,
            deferred: Arc::default(),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn services(&self) -> &Arc<JobServices> {
        self.scheduler.services()
    }

    /// Id of the record being executed
    pub fn record_id(&self) -> i64 {
        self.record_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Enqueue `job` once this execution is over and its record is deleted
    ///
    /// Lets a job put itself back even when its dedup key still belongs to the
    /// record being executed.
    pub fn requeue_after_completion<J: Job>(&self, job: &J) -> QueueResult<()> {
        let record = self.scheduler.new_record(job, job.priority())?;
        self.deferred.lock().push((record, J::CONFLICT_POLICY));
        Ok(())
    }

    pub(crate) fn take_deferred(&self) -> Vec<(NewJobRecord, ConflictPolicy)> {
        std::mem::take(&mut *self.deferred.lock())
    }
}
