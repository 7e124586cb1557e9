//! Durable job record storage
//!
//! The scheduler only talks to [`JobStore`]. The SQLite implementation lives in
//! `db::job_records`; [`MemoryJobStore`] backs tests and ephemeral setups.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::QueueName;
use crate::error::{QueueError, QueueResult};

/// A persisted job awaiting (or undergoing) execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub queue: QueueName,
    pub priority: i32,
    pub type_tag: String,
    pub dedup_key: String,
    /// serde_json encoding of the job's fields
    pub parameters: String,
    pub updated_at: DateTime<Utc>,
}

/// A record before the store assigned it an id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJobRecord {
    pub queue: QueueName,
    pub priority: i32,
    pub type_tag: String,
    pub dedup_key: String,
    pub parameters: String,
}

/// Records the dispatch loop must not select this round
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    /// Types whose partition is saturated or banned
    pub type_tags: HashSet<String>,
    /// Records already executing or awaiting deletion
    pub record_ids: HashSet<i64>,
}

impl Exclusions {
    pub fn allows(&self, record: &JobRecord) -> bool {
        !self.type_tags.contains(&record.type_tag) && !self.record_ids.contains(&record.id)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a record. Fails with `DuplicateJob` if the dedup key is taken.
    async fn insert(&self, record: NewJobRecord) -> QueueResult<JobRecord>;

    /// Atomically swap `existing_id` for a fresh record
    async fn replace(&self, existing_id: i64, record: NewJobRecord) -> QueueResult<JobRecord>;

    async fn find_by_dedup_key(&self, queue: QueueName, dedup_key: &str) -> QueueResult<Option<JobRecord>>;

    async fn delete_by_dedup_key(&self, queue: QueueName, dedup_key: &str) -> QueueResult<u64>;

    /// Delete one record; returns whether it existed
    async fn delete_by_id(&self, id: i64) -> QueueResult<bool>;

    /// The most urgent allowed record: lowest priority, then oldest, then lowest id
    async fn next_eligible(&self, queue: QueueName, exclusions: &Exclusions) -> QueueResult<Option<JobRecord>>;

    /// Records in `queue` other than `excluded`
    async fn count_pending(&self, queue: QueueName, excluded: &HashSet<i64>) -> QueueResult<u64>;

    /// Up to `limit` records in dispatch order
    async fn list_pending(&self, queue: QueueName, limit: usize) -> QueueResult<Vec<JobRecord>>;

    async fn delete_all(&self, queue: QueueName) -> QueueResult<u64>;
}

/// Dispatch ordering shared by every store implementation
pub fn dispatch_order(a: &JobRecord, b: &JobRecord) -> std::cmp::Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.updated_at.cmp(&b.updated_at))
        .then(a.id.cmp(&b.id))
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    records: BTreeMap<i64, JobRecord>,
}

impl MemoryState {
    fn find(&self, queue: QueueName, dedup_key: &str) -> Option<&JobRecord> {
        self.records
            .values()
            .find(|r| r.queue == queue && r.dedup_key == dedup_key)
    }

    fn push(&mut self, record: NewJobRecord) -> JobRecord {
        self.next_id += 1;
        let record = JobRecord {
            id: self.next_id,
            queue: record.queue,
            priority: record.priority,
            type_tag: record.type_tag,
            dedup_key: record.dedup_key,
            parameters: record.parameters,
            updated_at: Utc::now(),
        };
        self.records.insert(record.id, record.clone());
        record
    }
}

/// In-process store with the same semantics as the SQLite one
///
/// [`MemoryJobStore::set_unavailable`] makes every call fail with
/// `StoreUnavailable`, which is how outage handling gets exercised.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every record across all queues, by id
    pub fn records(&self) -> Vec<JobRecord> {
        self.state.lock().records.values().cloned().collect()
    }

    fn check(&self) -> QueueResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::StoreUnavailable(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn pending(state: &MemoryState, queue: QueueName) -> Vec<&JobRecord> {
        let mut pending: Vec<&JobRecord> = state.records.values().filter(|r| r.queue == queue).collect();
        pending.sort_by(|a, b| dispatch_order(a, b));
        pending
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, record: NewJobRecord) -> QueueResult<JobRecord> {
        self.check()?;
        let mut state = self.state.lock();
        if state.find(record.queue, &record.dedup_key).is_some() {
            return Err(QueueError::DuplicateJob {
                queue: record.queue,
                dedup_key: record.dedup_key,
            });
        }
        Ok(state.push(record))
    }

    async fn replace(&self, existing_id: i64, record: NewJobRecord) -> QueueResult<JobRecord> {
        self.check()?;
        let mut state = self.state.lock();
        state.records.remove(&existing_id);
        if state.find(record.queue, &record.dedup_key).is_some() {
            return Err(QueueError::DuplicateJob {
                queue: record.queue,
                dedup_key: record.dedup_key,
            });
        }
        Ok(state.push(record))
    }

    async fn find_by_dedup_key(&self, queue: QueueName, dedup_key: &str) -> QueueResult<Option<JobRecord>> {
        self.check()?;
        Ok(self.state.lock().find(queue, dedup_key).cloned())
    }

    async fn delete_by_dedup_key(&self, queue: QueueName, dedup_key: &str) -> QueueResult<u64> {
        self.check()?;
        let mut state = self.state.lock();
        let before = state.records.len();
        state
            .records
            .retain(|_, r| !(r.queue == queue && r.dedup_key == dedup_key));
        Ok((before - state.records.len()) as u64)
    }

    async fn delete_by_id(&self, id: i64) -> QueueResult<bool> {
        self.check()?;
        Ok(self.state.lock().records.remove(&id).is_some())
    }

    async fn next_eligible(&self, queue: QueueName, exclusions: &Exclusions) -> QueueResult<Option<JobRecord>> {
        self.check()?;
        let state = self.state.lock();
        Ok(Self::pending(&state, queue)
            .into_iter()
            .find(|r| exclusions.allows(r))
            .cloned())
    }

    async fn count_pending(&self, queue: QueueName, excluded: &HashSet<i64>) -> QueueResult<u64> {
        self.check()?;
        let state = self.state.lock();
        Ok(state
            .records
            .values()
            .filter(|r| r.queue == queue && !excluded.contains(&r.id))
            .count() as u64)
    }

    async fn list_pending(&self, queue: QueueName, limit: usize) -> QueueResult<Vec<JobRecord>> {
        self.check()?;
        let state = self.state.lock();
        Ok(Self::pending(&state, queue)
            .into_iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_all(&self, queue: QueueName) -> QueueResult<u64> {
        self.check()?;
        let mut state = self.state.lock();
        let before = state.records.len();
        state.records.retain(|_, r| r.queue != queue);
        Ok((before - state.records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn record(queue: QueueName, priority: i32, key: &str) -> NewJobRecord {
        NewJobRecord {
            queue,
            priority,
            type_tag: "Sample".to_string(),
            dedup_key: key.to_string(),
            parameters: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_next_eligible_orders_by_priority_then_age() {
        let store = MemoryJobStore::new();
        store.insert(record(QueueName::General, 5, "a")).await.unwrap();
        store.insert(record(QueueName::General, 1, "b")).await.unwrap();
        store.insert(record(QueueName::General, 5, "c")).await.unwrap();
        store.insert(record(QueueName::Images, 0, "d")).await.unwrap();

        let order: Vec<String> = store
            .list_pending(QueueName::General, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.dedup_key)
            .collect();
        assert_eq!(order, vec!["b", "a", "c"]);

        let next = store
            .next_eligible(QueueName::General, &Exclusions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.dedup_key, "b");

        let mut exclusions = Exclusions::default();
        exclusions.record_ids.insert(next.id);
        let next = store
            .next_eligible(QueueName::General, &exclusions)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.dedup_key, "a");

        exclusions.type_tags.insert("Sample".to_string());
        assert!(
            store
                .next_eligible(QueueName::General, &exclusions)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_dedup_key_is_unique_per_queue() {
        let store = MemoryJobStore::new();
        store.insert(record(QueueName::General, 6, "k")).await.unwrap();
        store.insert(record(QueueName::Images, 6, "k")).await.unwrap();
        assert_matches!(
            store.insert(record(QueueName::General, 2, "k")).await,
            Err(QueueError::DuplicateJob { .. })
        );

        let existing = store
            .find_by_dedup_key(QueueName::General, "k")
            .await
            .unwrap()
            .unwrap();
        let replaced = store
            .replace(existing.id, record(QueueName::General, 2, "k"))
            .await
            .unwrap();
        assert_ne!(replaced.id, existing.id);
        assert_eq!(replaced.priority, 2);
        assert_eq!(store.count_pending(QueueName::General, &HashSet::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryJobStore::new();
        store.set_unavailable(true);
        let err = store.count_pending(QueueName::General, &HashSet::new()).await.unwrap_err();
        assert!(err.is_retryable());

        store.set_unavailable(false);
        assert_eq!(store.delete_all(QueueName::General).await.unwrap(), 0);
    }
}
