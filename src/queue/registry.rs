//! Type-tag registry used to rehydrate persisted records into runnable jobs

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::warn;

use super::QueueName;
use super::job::{ConflictPolicy, Job, JobContext, Partitioning};
use crate::error::{QueueError, QueueResult};

/// Object-safe view of a rehydrated [`Job`]
#[async_trait]
pub trait ErasedJob: Send + Sync {
    fn type_tag(&self) -> &'static str;
    fn key(&self) -> String;
    fn label(&self) -> String;
    async fn run(&self, ctx: &JobContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<J: Job> ErasedJob for J {
    fn type_tag(&self) -> &'static str {
        J::TYPE_TAG
    }

    fn key(&self) -> String {
        Job::dedup_key(self)
    }

    fn label(&self) -> String {
        Job::describe(self)
    }

    async fn run(&self, ctx: &JobContext) -> anyhow::Result<()> {
        Job::execute(self, ctx).await
    }
}

type Rehydrate = fn(&str) -> QueueResult<Box<dyn ErasedJob>>;

fn rehydrate<J: Job>(parameters: &str) -> QueueResult<Box<dyn ErasedJob>> {
    let job: J = serde_json::from_str(parameters)?;
    Ok(Box::new(job))
}

/// Static properties of a registered job type
#[derive(Clone, Copy)]
pub struct JobDescriptor {
    pub type_tag: &'static str,
    pub queue: QueueName,
    pub partitioning: Partitioning,
    pub conflict_policy: ConflictPolicy,
    rehydrate: Rehydrate,
}

impl JobDescriptor {
    pub fn of<J: Job>() -> Self {
        Self {
            type_tag: J::TYPE_TAG,
            queue: J::QUEUE,
            partitioning: J::PARTITIONING,
            conflict_policy: J::CONFLICT_POLICY,
            rehydrate: rehydrate::<J>,
        }
    }

    pub fn partition_tag(&self) -> Option<&'static str> {
        self.partitioning.tag(self.type_tag)
    }

    pub fn partition_max(&self) -> Option<usize> {
        self.partitioning.max()
    }

    pub fn rehydrate(&self, parameters: &str) -> QueueResult<Box<dyn ErasedJob>> {
        (self.rehydrate)(parameters)
    }
}

impl std::fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("type_tag", &self.type_tag)
            .field("queue", &self.queue)
            .field("partitioning", &self.partitioning)
            .field("conflict_policy", &self.conflict_policy)
            .finish()
    }
}

/// Maps persisted type tags to job types
///
/// Every job type the process may find in the store has to be registered
/// before the scheduler starts; records with unknown tags are dropped.
#[derive(Debug, Default)]
pub struct JobRegistry {
    types: HashMap<&'static str, JobDescriptor>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type. Registering the same tag twice keeps the latest.
    pub fn register<J: Job>(mut self) -> Self {
        if self.types.insert(J::TYPE_TAG, JobDescriptor::of::<J>()).is_some() {
            warn!(type_tag = J::TYPE_TAG, "Job type registered twice; keeping the latest");
        }
        self
    }

    pub fn get(&self, type_tag: &str) -> Option<&JobDescriptor> {
        self.types.get(type_tag)
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.types.contains_key(type_tag)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &JobDescriptor> {
        self.types.values()
    }

    /// Rebuild a job from its persisted type tag and parameters
    pub fn rehydrate(&self, type_tag: &str, parameters: &str) -> QueueResult<Box<dyn ErasedJob>> {
        self.get(type_tag)
            .ok_or_else(|| QueueError::UnknownJobType(type_tag.to_string()))?
            .rehydrate(parameters)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
