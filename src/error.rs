//! Error types for the job scheduler
//!
//! Enqueue-time conflicts, unknown persisted job types, job failures and store
//! outages each get their own variant so callers can tell recoverable problems
//! from ones that only need logging.

use thiserror::Error;

use crate::queue::QueueName;

/// Main scheduler error type
#[derive(Error, Debug)]
pub enum QueueError {
    /// A pending job with the same dedup key exists and the job type uses
    /// [`ConflictPolicy::Error`](crate::queue::ConflictPolicy::Error)
    #[error("job '{dedup_key}' is already queued on the {queue} queue")]
    DuplicateJob { queue: QueueName, dedup_key: String },

    /// A persisted record names a type tag nothing registered
    #[error("no job type registered for tag '{0}'")]
    UnknownJobType(String),

    /// A job's execute step failed or panicked
    #[error("job {type_tag} '{dedup_key}' failed: {message}")]
    JobExecution {
        type_tag: String,
        dedup_key: String,
        message: String,
    },

    /// The job record store could not be reached
    #[error("job store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    /// A stored row that can't be turned back into a record
    #[error("job record {id} is unreadable: {reason}")]
    CorruptRecord { id: i64, reason: String },

    /// Job parameters could not be encoded or decoded
    #[error("job parameters could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The scheduler has no controller for this queue
    #[error("the {0} queue is not configured")]
    QueueNotConfigured(QueueName),

    /// Catch-all for unexpected failures
    #[error("internal scheduler error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Whether the dispatch loop should back off and try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Create a job execution error
    pub fn job_execution(
        type_tag: impl Into<String>,
        dedup_key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::JobExecution {
            type_tag: type_tag.into(),
            dedup_key: dedup_key.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for scheduler operations
pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_errors_are_retryable() {
        assert!(QueueError::StoreUnavailable(sqlx::Error::PoolClosed).is_retryable());
        assert!(!QueueError::UnknownJobType("Gone".to_string()).is_retryable());
        assert!(
            !QueueError::DuplicateJob {
                queue: QueueName::General,
                dedup_key: "tvdb:search:1".to_string(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_display() {
        let err = QueueError::DuplicateJob {
            queue: QueueName::General,
            dedup_key: "tvdb:search:100".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "job 'tvdb:search:100' is already queued on the general queue"
        );

        let err = QueueError::job_execution("HashFile", "hash:/a.mkv", "permission denied");
        assert_eq!(
            err.to_string(),
            "job HashFile 'hash:/a.mkv' failed: permission denied"
        );
    }
}
