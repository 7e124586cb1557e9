//! Persistent, priority-ordered, partitioned job scheduler
//!
//! Producers build a [`Job`] and hand it to [`Scheduler::enqueue`]. The owning
//! [`QueueController`] resolves dedup conflicts against the [`JobStore`] and wakes
//! that queue's dispatch loop, which repeatedly claims the most urgent record whose
//! partition still has room, rehydrates it through the [`JobRegistry`] and runs it on
//! a bounded set of worker slots. Finished records (successful or not) are deleted.

mod controller;
mod dispatcher;
pub mod filters;
pub mod job;
pub mod partition;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use controller::{EnqueueResult, QueueController, QueueSettings};
pub use filters::{AcquisitionFilter, PartitionBans};
pub use job::{ConflictPolicy, DEFAULT_PRIORITY, Job, JobContext, Partitioning, USER_PRIORITY};
pub use partition::{PartitionLimiter, PartitionPermit};
pub use registry::{ErasedJob, JobDescriptor, JobRegistry};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use state::{QueueItem, QueueSnapshot, QueueState, QueueStateEvent};
pub use store::{Exclusions, JobRecord, JobStore, MemoryJobStore, NewJobRecord};

/// Logical queues, each with its own dispatch loop and worker budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    /// Provider lookups, cross-referencing and everything else
    General,
    /// File hashing and media inspection
    Hasher,
    /// Artwork downloads and validation
    Images,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::General, QueueName::Hasher, QueueName::Images];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::General => "general",
            QueueName::Hasher => "hasher",
            QueueName::Images => "images",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" => Ok(QueueName::General),
            "hasher" => Ok(QueueName::Hasher),
            "images" | "image" => Ok(QueueName::Images),
            other => Err(format!("unknown queue '{}'", other)),
        }
    }
}
