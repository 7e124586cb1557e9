//! Scheduler behaviour against the in-memory job store

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

use common::*;
use media_queue::queue::{EnqueueResult, JobRegistry, JobStore, NewJobRecord, QueueName, QueueState, Scheduler};
use media_queue::QueueError;
use media_queue::services::{QueueService, ServicesManager};

#[tokio::test]
async fn test_ignore_keeps_first_record() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).build();

    let first = scheduler
        .enqueue(&IgnoreTask::new(&run, "k").payload("first"))
        .await
        .unwrap();
    let second = scheduler
        .enqueue(&IgnoreTask::new(&run, "k").payload("second"))
        .await
        .unwrap();

    assert_eq!(second, EnqueueResult::AlreadyQueued { record_id: first.record_id() });
    let records = store.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].parameters.contains("first"));
}

#[tokio::test]
async fn test_replace_keeps_latest_parameters() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).build();

    let first = scheduler.enqueue(&Task::new(&run, "k").payload("first")).await.unwrap();
    let second = scheduler.enqueue(&Task::new(&run, "k").payload("second")).await.unwrap();

    assert_matches!(second, EnqueueResult::Replaced { previous_id, .. } if previous_id == first.record_id());
    let records = store.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].parameters.contains("second"));
    assert_eq!(records[0].id, second.record_id());
}

#[tokio::test]
async fn test_error_policy_rejects_duplicate() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).build();

    scheduler.enqueue(&StrictTask::new(&run, "k").payload("first")).await.unwrap();
    let before = store.records();

    let result = scheduler.enqueue(&StrictTask::new(&run, "k").payload("second")).await;
    assert_matches!(
        result,
        Err(QueueError::DuplicateJob { queue: QueueName::General, dedup_key }) if dedup_key == "k"
    );
    assert_eq!(store.records(), before);
}

#[tokio::test]
async fn test_dedup_is_per_queue() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).build();

    scheduler.enqueue(&Task::new(&run, "shared")).await.unwrap();
    scheduler.enqueue(&HashTask::new(&run, "shared")).await.unwrap();
    assert_eq!(store.records().len(), 2);
}

#[tokio::test]
async fn test_unregistered_type_is_rejected() {
    let run = Run::new();
    let store = memory_store();
    let store_dyn: Arc<dyn JobStore> = store.clone();
    let scheduler = Scheduler::builder(store_dyn, JobRegistry::new().register::<Task>()).build();

    assert_matches!(
        scheduler.enqueue(&StrictTask::new(&run, "k")).await,
        Err(QueueError::UnknownJobType(tag)) if tag == "StrictTask"
    );
    assert_matches!(
        scheduler.queue(QueueName::Hasher).err(),
        Some(QueueError::QueueNotConfigured(QueueName::Hasher))
    );
}

#[tokio::test]
async fn test_priority_order() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).build();

    for (key, priority) in [("p5", 5), ("p1", 1), ("p3", 3)] {
        scheduler.enqueue_with_priority(&Task::new(&run, key), priority).await.unwrap();
    }
    scheduler.start();

    wait_until("three jobs", || run.finished().len() == 3).await;
    assert_eq!(run.started(), vec!["p1", "p3", "p5"]);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_partition_bound() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 10).build();

    for i in 0..5 {
        scheduler
            .enqueue(&TvdbTask::new(&run, &format!("tvdb:{}", i)).with(Behaviour::Hold))
            .await
            .unwrap();
    }
    scheduler
        .enqueue(&Task::new(&run, "other").with(Behaviour::Hold))
        .await
        .unwrap();
    scheduler.start();

    wait_until("two TvDB jobs and the other job", || {
        run.in_flight("TvDB") == 2 && run.in_flight("free") == 1
    })
    .await;
    settle().await;
    assert_eq!(run.in_flight("TvDB"), 2);
    assert_eq!(scheduler.limiter().in_flight("TvDB"), 2);

    run.release();
    wait_until("all six jobs", || run.finished().len() == 6).await;
    assert_eq!(run.peak("TvDB"), 2);
    assert_eq!(scheduler.limiter().in_flight("TvDB"), 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_partition_is_shared_across_queues() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 4).build();

    for i in 0..3 {
        scheduler
            .enqueue(&TvdbTask::new(&run, &format!("general:{}", i)).with(Behaviour::Hold))
            .await
            .unwrap();
        scheduler
            .enqueue(&TvdbImageTask::new(&run, &format!("images:{}", i)).with(Behaviour::Hold))
            .await
            .unwrap();
    }
    scheduler.start();

    wait_until("partition to fill", || run.in_flight("TvDB") == 2).await;
    settle().await;
    assert_eq!(run.in_flight("TvDB"), 2);

    run.release();
    wait_until("all jobs", || run.finished().len() == 6).await;
    assert_eq!(run.peak("TvDB"), 2);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_partition_override_from_config() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 10).partition_limit("TvDB", 1).build();

    for i in 0..3 {
        scheduler
            .enqueue(&TvdbTask::new(&run, &format!("tvdb:{}", i)).with(Behaviour::Hold))
            .await
            .unwrap();
    }
    scheduler.start();

    wait_until("first job", || run.in_flight("TvDB") == 1).await;
    settle().await;
    assert_eq!(run.started().len(), 1);

    run.release();
    wait_until("all jobs", || run.finished().len() == 3).await;
    assert_eq!(run.peak("TvDB"), 1);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_failed_and_panicking_jobs_run_once() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).build();

    scheduler.enqueue_with_priority(&Task::new(&run, "fails").with(Behaviour::Fail), 1).await.unwrap();
    scheduler.enqueue_with_priority(&Task::new(&run, "panics").with(Behaviour::Panic), 2).await.unwrap();
    scheduler.enqueue_with_priority(&Task::new(&run, "after"), 3).await.unwrap();
    scheduler.start();

    wait_until("every job", || run.finished().len() == 3).await;
    let queue = scheduler.queue(QueueName::General).unwrap();
    wait_until("store to drain", || store.records().is_empty()).await;
    settle().await;

    assert_eq!(run.started(), vec!["fails", "panics", "after"]);
    assert_eq!(queue.count_pending().await.unwrap(), 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_pause_blocks_and_resume_dispatches() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).build();
    scheduler.start();

    let queue = scheduler.queue(QueueName::General).unwrap();
    queue.pause().await;
    scheduler.enqueue(&Task::new(&run, "waits")).await.unwrap();
    settle().await;

    assert!(run.started().is_empty());
    assert_eq!(queue.state().state, QueueState::Paused);
    assert_eq!(queue.state().pending_count, 1);

    queue.resume().await;
    wait_until("job after resume", || run.finished().len() == 1).await;
    wait_until("idle", || queue.state().state == QueueState::Idle).await;
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_start_paused() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).start_paused(true).build();
    scheduler.enqueue(&Task::new(&run, "waits")).await.unwrap();
    scheduler.start();
    settle().await;

    assert!(run.started().is_empty());
    assert!(scheduler.states().iter().all(|s| s.state == QueueState::Paused));

    scheduler.resume_all().await;
    wait_until("job", || run.finished().len() == 1).await;
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_clear_on_empty_queue_is_idle() {
    let store = memory_store();
    let scheduler = builder(&store, 1).build();
    scheduler.start();

    let queue = scheduler.queue(QueueName::General).unwrap();
    assert_eq!(queue.clear().await.unwrap(), 0);
    assert_eq!(queue.state().state, QueueState::Idle);
    assert_eq!(queue.state().pending_count, 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_clear_removes_pending_and_unpauses() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).build();
    scheduler.start();

    let queue = scheduler.queue(QueueName::General).unwrap();
    queue.pause().await;
    for key in ["a", "b", "c"] {
        scheduler.enqueue(&Task::new(&run, key)).await.unwrap();
    }
    scheduler.enqueue(&HashTask::new(&run, "other-queue")).await.unwrap();

    assert_eq!(queue.clear().await.unwrap(), 3);
    assert!(!queue.is_paused());
    assert_eq!(queue.state().state, QueueState::Idle);

    wait_until("hasher job", || run.finished() == vec!["other-queue"]).await;
    settle().await;
    assert_eq!(run.started(), vec!["other-queue"]);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_replace_moves_job_ahead() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).build();

    scheduler.enqueue_with_priority(&Task::new(&run, "unrelated"), 8).await.unwrap();
    scheduler
        .enqueue_with_priority(&TvdbTask::new(&run, "tvdb:search:100"), 8)
        .await
        .unwrap();
    scheduler
        .enqueue_with_priority(&TvdbTask::new(&run, "tvdb:search:100"), 2)
        .await
        .unwrap();

    let tvdb: Vec<_> = store
        .records()
        .into_iter()
        .filter(|r| r.dedup_key == "tvdb:search:100")
        .collect();
    assert_eq!(tvdb.len(), 1);
    assert_eq!(tvdb[0].priority, 2);

    scheduler.start();
    wait_until("both jobs", || run.finished().len() == 2).await;
    assert_eq!(run.started(), vec!["tvdb:search:100", "unrelated"]);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_replace_while_running_keeps_new_record() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 2).build();
    scheduler.start();

    scheduler
        .enqueue(&Task::new(&run, "k").with(Behaviour::Hold).payload("old"))
        .await
        .unwrap();
    wait_until("old job", || run.started().len() == 1).await;

    scheduler.enqueue(&Task::new(&run, "k").payload("new")).await.unwrap();
    run.release();
    wait_until("both runs", || run.finished().len() == 2).await;
    wait_until("store to drain", || store.records().is_empty()).await;
    assert_eq!(run.started(), vec!["k", "k"]);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_replace_while_running_counts_new_record_as_pending() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).build();
    scheduler.start();

    scheduler
        .enqueue(&Task::new(&run, "k").with(Behaviour::Hold).payload("old"))
        .await
        .unwrap();
    wait_until("old job", || run.started().len() == 1).await;

    scheduler.enqueue(&Task::new(&run, "k").payload("new")).await.unwrap();
    let queue = scheduler.queue(QueueName::General).unwrap();
    assert_eq!(queue.count_pending().await.unwrap(), 1);
    let state = queue.state();
    assert_eq!(state.state, QueueState::Running);
    assert_eq!(state.pending_count, 1);
    assert_eq!(state.running_count, 1);

    run.release();
    wait_until("both runs", || run.finished().len() == 2).await;
    wait_until("idle", || queue.state().state == QueueState::Idle).await;
    assert_eq!(queue.state().pending_count, 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_unknown_and_corrupt_records_are_dropped() {
    let run = Run::new();
    let store = memory_store();
    for (type_tag, parameters) in [("RemovedJob", "{}"), ("Task", "not json")] {
        store
            .insert(NewJobRecord {
                queue: QueueName::General,
                priority: 1,
                type_tag: type_tag.to_string(),
                dedup_key: format!("{}:poison", type_tag),
                parameters: parameters.to_string(),
            })
            .await
            .unwrap();
    }
    let scheduler = builder(&store, 1).build();
    scheduler.enqueue(&Task::new(&run, "healthy")).await.unwrap();
    scheduler.start();

    wait_until("healthy job", || run.finished() == vec!["healthy"]).await;
    wait_until("store to drain", || store.records().is_empty()).await;
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_store_outage_pauses_then_recovers() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).build();
    scheduler.enqueue(&Task::new(&run, "survivor")).await.unwrap();

    store.set_unavailable(true);
    scheduler.start();
    let queue = scheduler.queue(QueueName::General).unwrap();
    wait_until("backoff state", || queue.state().state == QueueState::Paused).await;
    assert!(
        queue
            .state()
            .current_job_description
            .is_some_and(|d| d.contains("unavailable"))
    );
    assert!(!queue.is_paused());
    assert!(run.started().is_empty());

    store.set_unavailable(false);
    wait_until("job after recovery", || run.finished().len() == 1).await;
    wait_until("idle", || queue.state().state == QueueState::Idle).await;
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_ban_blocks_partition_until_lifted() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 4).build();
    scheduler.ban_partition("TvDB", Duration::from_secs(3600), "429 from provider");

    scheduler.enqueue_with_priority(&TvdbTask::new(&run, "banned"), 1).await.unwrap();
    scheduler.enqueue_with_priority(&Task::new(&run, "free"), 5).await.unwrap();
    scheduler.start();

    wait_until("unbanned job", || run.finished() == vec!["free"]).await;
    settle().await;
    assert_eq!(run.started(), vec!["free"]);
    assert!(scheduler.bans().is_banned("TvDB"));

    assert!(scheduler.lift_partition_ban("TvDB"));
    wait_until("banned job after lift", || run.finished().len() == 2).await;
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_expired_ban_is_ignored() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).build();
    scheduler.ban_partition("TvDB", Duration::from_millis(50), "short");
    scheduler.enqueue(&TvdbTask::new(&run, "later")).await.unwrap();
    scheduler.start();

    wait_until("job after ban expiry", || run.finished().len() == 1).await;
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_cancel_signals_jobs_and_drains() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 2).build();
    scheduler.enqueue(&Task::new(&run, "long").with(Behaviour::Hold)).await.unwrap();
    scheduler.start();
    wait_until("job to start", || run.started().len() == 1).await;

    let queue = scheduler.queue(QueueName::General).unwrap();
    queue.cancel().await;
    queue.wait_for_drain().await;

    assert!(queue.is_cancelled());
    assert_eq!(run.cancelled(), vec!["long"]);
    assert_eq!(run.finished(), vec!["long"]);

    scheduler.enqueue(&Task::new(&run, "never")).await.unwrap();
    settle().await;
    assert_eq!(run.started(), vec!["long"]);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_wait_for_drain_without_cancel() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 2).build();
    scheduler.start();
    scheduler.enqueue(&Task::new(&run, "held").with(Behaviour::Hold)).await.unwrap();
    wait_until("job to start", || run.started().len() == 1).await;

    let queue = scheduler.queue(QueueName::General).unwrap().clone();
    let release_run = run.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        release_run.release();
    });
    queue.wait_for_drain().await;
    assert_eq!(run.finished(), vec!["held"]);

    // the queue keeps dispatching afterwards
    scheduler.enqueue(&Task::new(&run, "next")).await.unwrap();
    wait_until("next job", || run.finished().len() == 2).await;
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_state_events() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).build();
    scheduler.start();
    let queue = scheduler.queue(QueueName::General).unwrap();
    wait_until("idle", || queue.state().state == QueueState::Idle).await;
    let mut events = queue.subscribe();

    scheduler.enqueue(&Task::new(&run, "observed").with(Behaviour::Hold)).await.unwrap();
    wait_until("job to start", || run.started().len() == 1).await;
    wait_until("running state", || queue.state().state == QueueState::Running).await;
    let running = queue.state();
    assert_eq!(running.current_job_description.as_deref(), Some("task observed"));
    assert_eq!(running.running_count, 1);
    assert_eq!(running.pending_count, 0);

    run.release();
    wait_until("idle again", || queue.state().state == QueueState::Idle).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| e.state == QueueState::Running));
    assert_eq!(seen.last().map(|e| e.state), Some(QueueState::Idle));
    for pair in seen.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_lists_waiting_and_executing() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).build();
    scheduler.enqueue_with_priority(&Task::new(&run, "running").with(Behaviour::Hold), 1).await.unwrap();
    scheduler.start();
    wait_until("first job", || run.started().len() == 1).await;

    for (key, priority) in [("low", 9), ("high", 2), ("mid", 5)] {
        scheduler.enqueue_with_priority(&Task::new(&run, key), priority).await.unwrap();
    }

    let snapshot = scheduler.queue(QueueName::General).unwrap().snapshot(10).await.unwrap();
    let executing: Vec<_> = snapshot.executing.iter().map(|i| i.dedup_key.as_str()).collect();
    let waiting: Vec<_> = snapshot.waiting.iter().map(|i| i.dedup_key.as_str()).collect();
    assert_eq!(executing, vec!["running"]);
    assert_eq!(waiting, vec!["high", "mid", "low"]);
    assert_eq!(snapshot.waiting[0].description, "task high");
    assert_eq!(snapshot.state.pending_count, 3);

    run.release();
    wait_until("everything", || run.finished().len() == 4).await;
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_worker_slots_bound_unpartitioned_jobs() {
    let run = Run::new();
    let store = memory_store();
    let store_dyn: Arc<dyn JobStore> = store.clone();
    let scheduler = Scheduler::builder(store_dyn, registry())
        .queue(QueueName::General, fast_settings(3))
        .build();
    for i in 0..6 {
        scheduler
            .enqueue(&Task::new(&run, &format!("job:{}", i)).with(Behaviour::Hold))
            .await
            .unwrap();
    }
    scheduler.start();

    wait_until("slots to fill", || run.in_flight("free") == 3).await;
    settle().await;
    assert_eq!(run.started().len(), 3);

    run.release();
    wait_until("all jobs", || run.finished().len() == 6).await;
    assert_eq!(run.peak("free"), 3);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_queue_service_refuses_restart_and_keeps_running() {
    let run = Run::new();
    let store = memory_store();
    let scheduler = builder(&store, 1).build();
    let manager = ServicesManager::builder()
        .add_service(Arc::new(QueueService::without_database(scheduler.clone())))
        .start()
        .await
        .unwrap();

    assert!(manager.restart_one("queues").await.is_err());
    assert!(manager.is_started("queues").await);
    assert!(scheduler.queues().iter().all(|q| !q.is_cancelled()));

    scheduler.enqueue(&Task::new(&run, "after-restart")).await.unwrap();
    wait_until("job after refused restart", || run.finished() == vec!["after-restart"]).await;

    manager.stop_all().await.unwrap();
    assert!(scheduler.queues().iter().all(|q| q.is_cancelled()));
}
