//! Observable queue state

use serde::Serialize;

use super::QueueName;
use super::store::JobRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    /// Nothing executing, nothing eligible
    Idle,
    /// At least one job executing
    Running,
    /// Paused by an operator, or backing off after a store failure
    Paused,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Idle => "idle",
            QueueState::Running => "running",
            QueueState::Paused => "paused",
        }
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published whenever a queue's observable state changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStateEvent {
    pub queue: QueueName,
    pub state: QueueState,
    /// Most recently started job that is still running, or the store error while backing off
    pub current_job_description: Option<String>,
    /// Records waiting in the store, excluding the ones executing
    pub pending_count: u64,
    pub running_count: usize,
}

impl QueueStateEvent {
    pub fn idle(queue: QueueName) -> Self {
        Self {
            queue,
            state: QueueState::Idle,
            current_job_description: None,
            pending_count: 0,
            running_count: 0,
        }
    }
}

/// A record as shown to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueItem {
    pub record_id: i64,
    pub type_tag: String,
    pub dedup_key: String,
    pub priority: i32,
    pub description: String,
}

impl QueueItem {
    pub(crate) fn from_record(record: &JobRecord, description: String) -> Self {
        Self {
            record_id: record.id,
            type_tag: record.type_tag.clone(),
            dedup_key: record.dedup_key.clone(),
            priority: record.priority,
            description,
        }
    }
}

/// Waiting and executing work for one queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub state: QueueStateEvent,
    /// In dispatch order
    pub waiting: Vec<QueueItem>,
    pub executing: Vec<QueueItem>,
}
