//! Shared harness for scheduler integration tests
//!
//! Jobs are rehydrated from their JSON parameters, so they can't carry handles.
//! Each test registers a [`Run`] under a unique id and its jobs look it up by
//! that id to report what happened.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use media_queue::queue::{
    ConflictPolicy, Job, JobContext, JobRegistry, JobStore, MemoryJobStore, Partitioning, QueueName,
    QueueSettings, Scheduler, SchedulerBuilder,
};

static RUNS: LazyLock<Mutex<HashMap<String, Arc<Run>>>> = LazyLock::new(|| Mutex::new(HashMap::new()));
static NEXT_RUN: AtomicUsize = AtomicUsize::new(0);

/// What a scripted job does once it has started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Behaviour {
    #[default]
    Succeed,
    Fail,
    Panic,
    /// Block until [`Run::release`] or queue cancellation
    Hold,
}

/// Everything the jobs of one test observed
pub struct Run {
    pub id: String,
    started: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
    in_flight: Mutex<HashMap<String, usize>>,
    peak: Mutex<HashMap<String, usize>>,
    release: CancellationToken,
}

impl Run {
    pub fn new() -> Arc<Run> {
        let id = format!("run-{}", NEXT_RUN.fetch_add(1, Ordering::SeqCst));
        let release = CancellationToken::new();
        let run = Arc::new(Run {
            id: id.clone(),
            started: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            peak: Mutex::new(HashMap::new()),
            release,
        });
        RUNS.lock().insert(id, run.clone());
        run
    }

    fn get(id: &str) -> Arc<Run> {
        RUNS.lock().get(id).cloned().expect("job references an unknown run")
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    /// Highest number of jobs of `group` seen executing at once
    pub fn peak(&self, group: &str) -> usize {
        self.peak.lock().get(group).copied().unwrap_or(0)
    }

    pub fn in_flight(&self, group: &str) -> usize {
        self.in_flight.lock().get(group).copied().unwrap_or(0)
    }

    /// Let every held job finish
    pub fn release(&self) {
        self.release.cancel();
    }

    fn enter(&self, group: &str, key: &str) {
        self.started.lock().push(key.to_string());
        let mut in_flight = self.in_flight.lock();
        let current = in_flight.entry(group.to_string()).or_default();
        *current += 1;
        let mut peak = self.peak.lock();
        let max = peak.entry(group.to_string()).or_default();
        *max = (*max).max(*current);
    }

    fn exit(&self, group: &str, key: &str) {
        if let Some(current) = self.in_flight.lock().get_mut(group) {
            *current -= 1;
        }
        self.finished.lock().push(key.to_string());
    }
}

async fn act(ctx: &JobContext, run: &str, group: &str, key: &str, behaviour: Behaviour) -> anyhow::Result<()> {
    let run = Run::get(run);
    run.enter(group, key);

    if behaviour == Behaviour::Hold {
        tokio::select! {
            _ = run.release.cancelled() => {}
            _ = ctx.cancellation().cancelled() => {
                run.cancelled.lock().push(key.to_string());
            }
        }
    } else {
        tokio::task::yield_now().await;
    }

    run.exit(group, key);
    match behaviour {
        Behaviour::Fail => anyhow::bail!("{} failed on purpose", key),
        Behaviour::Panic => panic!("{} panicked on purpose", key),
        _ => Ok(()),
    }
}

macro_rules! scripted_job {
    ($name:ident, $tag:literal, $queue:expr, $partitioning:expr, $policy:expr, $group:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name {
            pub run: String,
            pub key: String,
            #[serde(default)]
            pub behaviour: Behaviour,
            #[serde(default)]
            pub payload: String,
        }

        impl $name {
            pub fn new(run: &Run, key: &str) -> Self {
                Self {
                    run: run.id.clone(),
                    key: key.to_string(),
                    behaviour: Behaviour::Succeed,
                    payload: String::new(),
                }
            }

            pub fn with(mut self, behaviour: Behaviour) -> Self {
                self.behaviour = behaviour;
                self
            }

            pub fn payload(mut self, payload: &str) -> Self {
                self.payload = payload.to_string();
                self
            }
        }

        #[async_trait]
        impl Job for $name {
            const TYPE_TAG: &'static str = $tag;
            const QUEUE: QueueName = $queue;
            const PARTITIONING: Partitioning = $partitioning;
            const CONFLICT_POLICY: ConflictPolicy = $policy;

            fn dedup_key(&self) -> String {
                self.key.clone()
            }

            fn describe(&self) -> String {
                format!("task {}", self.key)
            }

            async fn execute(&self, ctx: &JobContext) -> anyhow::Result<()> {
                act(ctx, &self.run, $group, &self.key, self.behaviour).await
            }
        }
    };
}

scripted_job!(Task, "Task", QueueName::General, Partitioning::Unbounded, ConflictPolicy::Replace, "free");
scripted_job!(IgnoreTask, "IgnoreTask", QueueName::General, Partitioning::Unbounded, ConflictPolicy::Ignore, "free");
scripted_job!(StrictTask, "StrictTask", QueueName::General, Partitioning::Unbounded, ConflictPolicy::Error, "free");
scripted_job!(
    TvdbTask,
    "TvdbTask",
    QueueName::General,
    Partitioning::Shared { tag: "TvDB", max: 2 },
    ConflictPolicy::Replace,
    "TvDB"
);
scripted_job!(
    TvdbImageTask,
    "TvdbImageTask",
    QueueName::Images,
    Partitioning::Shared { tag: "TvDB", max: 2 },
    ConflictPolicy::Replace,
    "TvDB"
);
scripted_job!(HashTask, "HashTask", QueueName::Hasher, Partitioning::Exclusive, ConflictPolicy::Ignore, "HashTask");

pub fn registry() -> JobRegistry {
    JobRegistry::new()
        .register::<Task>()
        .register::<IgnoreTask>()
        .register::<StrictTask>()
        .register::<TvdbTask>()
        .register::<TvdbImageTask>()
        .register::<HashTask>()
}

pub fn fast_settings(workers: usize) -> QueueSettings {
    QueueSettings {
        worker_slots: workers,
        poll_interval: Duration::from_millis(50),
        store_backoff_max: Duration::from_millis(100),
    }
}

/// Scheduler over a fresh in-memory store with every queue at `workers` slots
pub fn builder(store: &Arc<MemoryJobStore>, workers: usize) -> SchedulerBuilder {
    let store: Arc<dyn JobStore> = store.clone();
    let mut builder = Scheduler::builder(store, registry());
    for queue in QueueName::ALL {
        builder = builder.queue(queue, fast_settings(workers));
    }
    builder
}

pub fn memory_store() -> Arc<MemoryJobStore> {
    Arc::new(MemoryJobStore::new())
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Let the dispatch loops run for a moment
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
