//! Per-queue state shared between the operator surface and the dispatch loop

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::QueueName;
use super::dispatcher;
use super::filters::AcquisitionFilter;
use super::job::ConflictPolicy;
use super::partition::PartitionLimiter;
use super::registry::JobRegistry;
use super::scheduler::Scheduler;
use super::state::{QueueItem, QueueSnapshot, QueueState, QueueStateEvent};
use super::store::{Exclusions, JobRecord, JobStore, NewJobRecord};
use crate::error::{QueueError, QueueResult};

const EVENT_CAPACITY: usize = 64;

/// Tunables for one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Maximum jobs this queue executes at once
    pub worker_slots: usize,
    /// How often an idle loop re-checks the store without being woken
    pub poll_interval: Duration,
    /// Upper bound for the retry delay while the store is unreachable
    pub store_backoff_max: Duration,
}

impl QueueSettings {
    pub fn with_workers(worker_slots: usize) -> Self {
        Self {
            worker_slots,
            ..Self::default()
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            worker_slots: 1,
            poll_interval: Duration::from_secs(5),
            store_backoff_max: Duration::from_secs(60),
        }
    }
}

/// What an enqueue did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Queued { record_id: i64 },
    /// An older pending record with the same dedup key was replaced
    Replaced { record_id: i64, previous_id: i64 },
    /// A record with the same dedup key was already pending; nothing stored
    AlreadyQueued { record_id: i64 },
}

impl EnqueueResult {
    pub fn record_id(&self) -> i64 {
        match self {
            EnqueueResult::Queued { record_id }
            | EnqueueResult::Replaced { record_id, .. }
            | EnqueueResult::AlreadyQueued { record_id } => *record_id,
        }
    }
}

struct RunningJob {
    record: JobRecord,
    description: String,
    started_seq: u64,
}

pub(super) struct QueueInner {
    pub(super) name: QueueName,
    pub(super) settings: QueueSettings,
    pub(super) store: Arc<dyn JobStore>,
    pub(super) registry: Arc<JobRegistry>,
    pub(super) limiter: Arc<PartitionLimiter>,
    pub(super) filters: Vec<Arc<dyn AcquisitionFilter>>,
    pub(super) wake: Notify,
    /// Stops the dispatch loop
    pub(super) stop: CancellationToken,
    /// Handed to running jobs
    pub(super) job_cancel: CancellationToken,
    pub(super) tracker: TaskTracker,
    /// Held while a record is selected and claimed; Clear takes it to stop dispatch
    pub(super) dispatch_gate: AsyncMutex<()>,
    paused: AtomicBool,
    enqueue_lock: AsyncMutex<()>,
    running: Mutex<HashMap<i64, RunningJob>>,
    started_seq: AtomicU64,
    pending_deletes: Mutex<HashSet<i64>>,
    store_failure: Mutex<Option<String>>,
    publish_lock: AsyncMutex<()>,
    last_event: RwLock<QueueStateEvent>,
    events: broadcast::Sender<QueueStateEvent>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueueInner {
    pub(super) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Type tags and record ids the next selection must skip
    pub(super) fn exclusions(&self) -> Exclusions {
        let now = Utc::now();
        let banned: HashSet<String> = self
            .filters
            .iter()
            .flat_map(|filter| filter.excluded_partitions(now))
            .collect();

        let type_tags = self
            .registry
            .descriptors()
            .filter(|d| {
                d.partition_tag()
                    .is_some_and(|tag| banned.contains(tag) || self.limiter.is_saturated(tag))
            })
            .map(|d| d.type_tag.to_string())
            .collect();

        Exclusions {
            type_tags,
            record_ids: self.busy_ids(),
        }
    }

    /// Records executing or awaiting deletion
    fn busy_ids(&self) -> HashSet<i64> {
        // running before pending_deletes: finish() fills the latter before draining the former
        let mut ids: HashSet<i64> = self.running.lock().keys().copied().collect();
        ids.extend(self.pending_deletes.lock().iter().copied());
        ids
    }

    pub(super) fn mark_running(&self, record: &JobRecord, description: String) {
        let started_seq = self.started_seq.fetch_add(1, Ordering::SeqCst);
        self.running.lock().insert(
            record.id,
            RunningJob {
                record: record.clone(),
                description,
                started_seq,
            },
        );
    }

    /// Delete a record that is done (or unusable) and stop tracking it as running
    pub(super) async fn finish(&self, record_id: i64) {
        if let Err(err) = self.store.delete_by_id(record_id).await {
            warn!(queue = %self.name, record_id, error = %err, "Failed to delete job record; will retry");
            self.pending_deletes.lock().insert(record_id);
        }
        self.running.lock().remove(&record_id);
    }

    pub(super) async fn flush_pending_deletes(&self) -> QueueResult<()> {
        let ids: Vec<i64> = self.pending_deletes.lock().iter().copied().collect();
        for id in ids {
            self.store.delete_by_id(id).await?;
            self.pending_deletes.lock().remove(&id);
            debug!(queue = %self.name, record_id = id, "Deferred job record deletion succeeded");
        }
        Ok(())
    }

    pub(super) fn set_store_failure(&self, failure: Option<String>) {
        *self.store_failure.lock() = failure;
    }

    /// Wait for a wake-up, the poll interval, or the stop signal. False means stop.
    pub(super) async fn idle_wait(&self) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = self.wake.notified() => true,
            _ = tokio::time::sleep(self.settings.poll_interval) => true,
        }
    }

    fn compose_event(&self, stored: Option<u64>) -> QueueStateEvent {
        let (running_count, current) = {
            let running = self.running.lock();
            let current = running
                .values()
                .max_by_key(|job| job.started_seq)
                .map(|job| job.description.clone());
            (running.len(), current)
        };
        let pending_count = stored.unwrap_or_else(|| self.last_event.read().pending_count);
        let failure = self.store_failure.lock().clone();

        let state = if self.is_paused() || failure.is_some() {
            QueueState::Paused
        } else if running_count > 0 {
            QueueState::Running
        } else {
            QueueState::Idle
        };

        QueueStateEvent {
            queue: self.name,
            state,
            current_job_description: failure.or(current),
            pending_count,
            running_count,
        }
    }

    /// Recompute state and broadcast it if anything changed
    pub(super) async fn publish_state(&self) {
        let _guard = self.publish_lock.lock().await;
        let stored = match self.store.count_pending(self.name, &self.busy_ids()).await {
            Ok(stored) => Some(stored),
            Err(err) => {
                debug!(queue = %self.name, error = %err, "Could not count pending jobs");
                None
            }
        };
        let event = self.compose_event(stored);
        {
            let mut last = self.last_event.write();
            if *last == event {
                return;
            }
            *last = event.clone();
        }
        debug!(
            queue = %self.name,
            state = %event.state,
            pending = event.pending_count,
            running = event.running_count,
            "Queue state changed"
        );
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Handle to one queue: enqueue, pause, resume, cancel, clear and observe
#[derive(Clone)]
pub struct QueueController {
    inner: Arc<QueueInner>,
}

impl QueueController {
    pub(super) fn new(
        name: QueueName,
        settings: QueueSettings,
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        limiter: Arc<PartitionLimiter>,
        filters: Vec<Arc<dyn AcquisitionFilter>>,
        start_paused: bool,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut initial = QueueStateEvent::idle(name);
        if start_paused {
            initial.state = QueueState::Paused;
        }
        Self {
            inner: Arc::new(QueueInner {
                name,
                settings,
                store,
                registry,
                limiter,
                filters,
                wake: Notify::new(),
                stop: CancellationToken::new(),
                job_cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                dispatch_gate: AsyncMutex::new(()),
                paused: AtomicBool::new(start_paused),
                enqueue_lock: AsyncMutex::new(()),
                running: Mutex::new(HashMap::new()),
                started_seq: AtomicU64::new(0),
                pending_deletes: Mutex::new(HashSet::new()),
                store_failure: Mutex::new(None),
                publish_lock: AsyncMutex::new(()),
                last_event: RwLock::new(initial),
                events,
                loop_handle: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> QueueName {
        self.inner.name
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    /// Spawn the dispatch loop. Later calls are no-ops.
    pub(super) fn start(&self, scheduler: Scheduler) {
        let mut handle = self.inner.loop_handle.lock();
        if handle.is_some() || self.inner.stop.is_cancelled() {
            return;
        }
        *handle = Some(dispatcher::spawn(self.inner.clone(), scheduler));
    }

    /// Store a record, resolving dedup conflicts with `policy`
    pub(crate) async fn enqueue_record(
        &self,
        record: NewJobRecord,
        policy: ConflictPolicy,
    ) -> QueueResult<EnqueueResult> {
        let inner = &self.inner;
        let result = {
            let _guard = inner.enqueue_lock.lock().await;
            let existing = match inner.store.find_by_dedup_key(inner.name, &record.dedup_key).await {
                Err(QueueError::CorruptRecord { id, reason }) => {
                    warn!(queue = %inner.name, record_id = id, error = %reason, "Replacing unreadable job record");
                    inner.store.delete_by_id(id).await?;
                    None
                }
                other => other?,
            };
            match existing {
                None => EnqueueResult::Queued {
                    record_id: inner.store.insert(record).await?.id,
                },
                Some(existing) => match policy {
                    ConflictPolicy::Replace => EnqueueResult::Replaced {
                        record_id: inner.store.replace(existing.id, record).await?.id,
                        previous_id: existing.id,
                    },
                    ConflictPolicy::Ignore => EnqueueResult::AlreadyQueued {
                        record_id: existing.id,
                    },
                    ConflictPolicy::Error => {
                        return Err(QueueError::DuplicateJob {
                            queue: inner.name,
                            dedup_key: record.dedup_key,
                        });
                    }
                },
            }
        };

        match result {
            EnqueueResult::AlreadyQueued { record_id } => {
                debug!(queue = %inner.name, record_id, "Job already queued; ignoring duplicate");
            }
            _ => {
                debug!(queue = %inner.name, result = ?result, "Job enqueued");
                inner.wake.notify_one();
                inner.publish_state().await;
            }
        }
        Ok(result)
    }

    /// Stop starting new jobs. Running jobs finish normally.
    pub async fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!(queue = %self.inner.name, "Queue paused");
        }
        self.inner.publish_state().await;
    }

    pub async fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!(queue = %self.inner.name, "Queue resumed");
        }
        self.inner.wake.notify_one();
        self.inner.publish_state().await;
    }

    pub fn is_paused(&self) -> bool {
        self.inner.is_paused()
    }

    /// Stop the dispatch loop for good and signal running jobs to stop
    ///
    /// Use [`wait_for_drain`](Self::wait_for_drain) to wait for them to finish.
    pub async fn cancel(&self) {
        if !self.inner.stop.is_cancelled() {
            info!(queue = %self.inner.name, "Queue cancelled");
        }
        self.inner.stop.cancel();
        self.inner.job_cancel.cancel();
        self.inner.tracker.close();
        self.inner.publish_state().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Wait until every in-flight job has finished, and the loop too once cancelled
    pub async fn wait_for_drain(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        if self.inner.stop.is_cancelled() {
            let handle = self.inner.loop_handle.lock().take();
            if let Some(handle) = handle {
                if let Err(err) = handle.await {
                    warn!(queue = %self.inner.name, error = %err, "Dispatch loop ended abnormally");
                }
            }
        } else {
            // reopen so later waits observe new work
            self.inner.tracker.reopen();
        }
    }

    /// Delete every record in this queue, then resume dispatching
    ///
    /// Jobs already executing run to completion.
    pub async fn clear(&self) -> QueueResult<u64> {
        let inner = &self.inner;
        let deleted = {
            let _gate = inner.dispatch_gate.lock().await;
            let _enqueue = inner.enqueue_lock.lock().await;
            let deleted = inner.store.delete_all(inner.name).await?;
            inner.pending_deletes.lock().clear();
            deleted
        };
        inner.paused.store(false, Ordering::SeqCst);
        info!(queue = %inner.name, deleted, "Queue cleared");
        inner.wake.notify_one();
        inner.publish_state().await;
        Ok(deleted)
    }

    /// Last published state
    pub fn state(&self) -> QueueStateEvent {
        self.inner.last_event.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueStateEvent> {
        self.inner.events.subscribe()
    }

    /// Stored records that are neither executing nor awaiting deletion
    pub async fn count_pending(&self) -> QueueResult<u64> {
        self.inner
            .store
            .count_pending(self.inner.name, &self.inner.busy_ids())
            .await
    }

    /// Waiting (up to `limit`, in dispatch order) and executing work
    pub async fn snapshot(&self, limit: usize) -> QueueResult<QueueSnapshot> {
        let inner = &self.inner;
        inner.publish_state().await;

        let (executing, skip) = {
            let running = inner.running.lock();
            let mut jobs: Vec<&RunningJob> = running.values().collect();
            jobs.sort_by_key(|job| job.started_seq);
            let executing: Vec<QueueItem> = jobs
                .iter()
                .map(|job| QueueItem::from_record(&job.record, job.description.clone()))
                .collect();
            let mut skip: HashSet<i64> = running.keys().copied().collect();
            skip.extend(inner.pending_deletes.lock().iter().copied());
            (executing, skip)
        };

        let waiting = inner
            .store
            .list_pending(inner.name, limit.saturating_add(skip.len()))
            .await?
            .into_iter()
            .filter(|record| !skip.contains(&record.id))
            .take(limit)
            .map(|record| {
                let description = inner
                    .registry
                    .rehydrate(&record.type_tag, &record.parameters)
                    .map(|job| job.label())
                    .unwrap_or_else(|_| format!("{} ({})", record.type_tag, record.dedup_key));
                QueueItem::from_record(&record, description)
            })
            .collect();

        Ok(QueueSnapshot {
            state: self.state(),
            waiting,
            executing,
        })
    }

    pub(super) fn wake(&self) {
        self.inner.wake.notify_one();
    }
}
