//! The per-queue dispatch loop
//!
//! One task per queue selects the next eligible record, claims its partition,
//! marks it running and hands it to a worker slot. Completion deletes the
//! record, releases the slot and partition, and wakes every queue since
//! partitions are shared.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::controller::QueueInner;
use super::job::JobContext;
use super::partition::PartitionPermit;
use super::registry::ErasedJob;
use super::scheduler::Scheduler;
use super::store::JobRecord;
use crate::error::{QueueError, QueueResult};

enum Cycle {
    /// A job was handed to a worker
    Dispatched,
    /// Something changed under us (dropped record, lost partition race); go again
    Again,
    /// Nothing is eligible right now
    Nothing,
    Paused,
}

pub(super) fn spawn(inner: Arc<QueueInner>, scheduler: Scheduler) -> JoinHandle<()> {
    tokio::spawn(run(inner, scheduler))
}

fn store_backoff(max: Duration) -> ExponentialBackoff {
    let initial = Duration::from_millis(500).min(max);
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        max_interval: max,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

async fn run(inner: Arc<QueueInner>, scheduler: Scheduler) {
    let slots = Arc::new(Semaphore::new(inner.settings.worker_slots.max(1)));
    let mut backoff = store_backoff(inner.settings.store_backoff_max);

    info!(
        queue = %inner.name,
        worker_slots = inner.settings.worker_slots.max(1),
        "Dispatch loop started"
    );
    inner.publish_state().await;

    loop {
        if inner.stop.is_cancelled() {
            break;
        }
        if inner.is_paused() {
            if !inner.idle_wait().await {
                break;
            }
            continue;
        }

        let slot = tokio::select! {
            biased;
            _ = inner.stop.cancelled() => break,
            slot = slots.clone().acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => break,
            },
        };

        match next_cycle(&inner, &scheduler, slot).await {
            Ok(Cycle::Dispatched) | Ok(Cycle::Again) => backoff.reset(),
            Ok(Cycle::Paused) => {}
            Ok(Cycle::Nothing) => {
                backoff.reset();
                inner.publish_state().await;
                if !inner.idle_wait().await {
                    break;
                }
            }
            Err(err) if err.is_retryable() => {
                let delay = backoff
                    .next_backoff()
                    .unwrap_or(inner.settings.store_backoff_max);
                warn!(
                    queue = %inner.name,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "Job store unavailable; backing off"
                );
                inner.set_store_failure(Some(err.to_string()));
                inner.publish_state().await;
                let stopped = tokio::select! {
                    _ = inner.stop.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                };
                inner.set_store_failure(None);
                if stopped {
                    break;
                }
            }
            Err(err) => {
                error!(queue = %inner.name, error = %err, "Dispatch cycle failed");
                if !inner.idle_wait().await {
                    break;
                }
            }
        }
    }

    inner.publish_state().await;
    info!(queue = %inner.name, "Dispatch loop stopped");
}

async fn next_cycle(
    inner: &Arc<QueueInner>,
    scheduler: &Scheduler,
    slot: OwnedSemaphorePermit,
) -> QueueResult<Cycle> {
    let _gate = inner.dispatch_gate.lock().await;
    if inner.is_paused() || inner.stop.is_cancelled() {
        return Ok(Cycle::Paused);
    }

    inner.flush_pending_deletes().await?;

    let exclusions = inner.exclusions();
    let record = match inner.store.next_eligible(inner.name, &exclusions).await {
        Ok(Some(record)) => record,
        Ok(None) => return Ok(Cycle::Nothing),
        Err(QueueError::CorruptRecord { id, reason }) => {
            warn!(
                queue = %inner.name,
                record_id = id,
                error = %reason,
                "Dropping job record that cannot be decoded"
            );
            inner.finish(id).await;
            return Ok(Cycle::Again);
        }
        Err(err) => return Err(err),
    };

    let job = match inner.registry.rehydrate(&record.type_tag, &record.parameters) {
        Ok(job) => job,
        Err(err) => {
            warn!(
                queue = %inner.name,
                record_id = record.id,
                type_tag = %record.type_tag,
                dedup_key = %record.dedup_key,
                error = %err,
                "Dropping job record that cannot be rehydrated"
            );
            inner.finish(record.id).await;
            return Ok(Cycle::Again);
        }
    };

    let partition_tag = inner
        .registry
        .get(&record.type_tag)
        .and_then(|descriptor| descriptor.partition_tag());
    let partition = match partition_tag {
        Some(tag) => match inner.limiter.try_acquire(tag) {
            Some(permit) => Some(permit),
            None => {
                debug!(queue = %inner.name, partition = tag, "Partition filled before claim");
                return Ok(Cycle::Again);
            }
        },
        None => None,
    };

    inner.mark_running(&record, job.label());
    debug!(
        queue = %inner.name,
        record_id = record.id,
        type_tag = %record.type_tag,
        priority = record.priority,
        "Dispatching job"
    );
    inner.tracker.spawn(execute(
        inner.clone(),
        scheduler.clone(),
        record,
        job,
        slot,
        partition,
    ));
    inner.publish_state().await;
    Ok(Cycle::Dispatched)
}

async fn execute(
    inner: Arc<QueueInner>,
    scheduler: Scheduler,
    record: JobRecord,
    job: Box<dyn ErasedJob>,
    slot: OwnedSemaphorePermit,
    partition: Option<PartitionPermit>,
) {
    let span = info_span!(
        "job",
        queue = %inner.name,
        record_id = record.id,
        type_tag = %record.type_tag,
        dedup_key = %record.dedup_key,
    );

    async move {
        let ctx = JobContext::new(scheduler.clone(), record.id, inner.job_cancel.clone());
        let started = Instant::now();
        debug!("Job started");

        let outcome = AssertUnwindSafe(job.run(&ctx)).catch_unwind().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok(())) => info!(elapsed_ms, "Job completed"),
            Ok(Err(err)) => {
                let err = QueueError::job_execution(&record.type_tag, &record.dedup_key, format!("{err:#}"));
                warn!(elapsed_ms, error = %err, "Job failed; record removed");
            }
            Err(panic) => {
                let err = QueueError::job_execution(&record.type_tag, &record.dedup_key, panic_message(&*panic));
                error!(elapsed_ms, error = %err, "Job panicked; record removed");
            }
        }

        inner.finish(record.id).await;
        for (follow_up, policy) in ctx.take_deferred() {
            let queue = follow_up.queue;
            let dedup_key = follow_up.dedup_key.clone();
            let result = match scheduler.queue(queue) {
                Ok(controller) => controller.enqueue_record(follow_up, policy).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(result) => debug!(record_id = result.record_id(), "Requeued after completion"),
                Err(err) => warn!(%queue, %dedup_key, error = %err, "Could not requeue job"),
            }
        }
        drop(partition);
        drop(slot);
        scheduler.wake_all();
        inner.publish_state().await;
    }
    .instrument(span)
    .await
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with a non-string payload".to_string())
}
