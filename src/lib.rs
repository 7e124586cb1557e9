//! Persistent, priority-ordered, partitioned job scheduler
//!
//! Jobs are persisted as records in a [`queue::JobStore`], picked by a dispatch
//! loop per [`queue::QueueName`] in priority order, and executed on a bounded
//! worker pool while partition limits and bans keep remote providers from
//! being overloaded.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod queue;
pub mod services;

pub use error::{QueueError, QueueResult};
pub use queue::{ConflictPolicy, Job, JobContext, JobRegistry, Partitioning, QueueName, Scheduler};
