//! Queue Backend Trait

use crate::job::{JobId, JobRecord, JobState};
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Job has not been enqueued")]
    NotEnqueued,
    #[error("Job {id} is {actual}, expected {expected}")]
    InvalidState {
        id: JobId,
        expected: JobState,
        actual: JobState,
    },
    #[error("Offset of {0}s is out of range")]
    OutOfRange(u64),
    #[error("Backend does not support {0}")]
    Unsupported(&'static str),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Rows touched by a cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Expired leases put back in the queue
    pub released: u64,
    /// Terminal jobs removed by the threshold policy
    pub deleted: u64,
}

/// Per-state counts with every state present
pub fn zeroed_counts() -> HashMap<JobState, u64> {
    JobState::ALL.iter().map(|state| (*state, 0)).collect()
}

/// Storage and queueing contract, bound to a single queue.
///
/// Every state transition touches exactly one row and is guarded by the
/// state it expects, so concurrent callers never double-claim or overwrite
/// each other's results.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// The queue this backend instance serves
    fn queue_id(&self) -> &str;

    /// Prepare storage for the queue
    async fn create_queue(&self) -> Result<(), QueueError> {
        Ok(())
    }

    /// Remove the queue and every job belonging to it, returns the jobs removed
    async fn delete_queue(&self) -> Result<u64, QueueError>;

    /// Release expired leases and apply the retention threshold
    async fn cleanup_queue(&self) -> Result<CleanupReport, QueueError>;

    /// Enqueue a job, available after `delay` seconds
    async fn enqueue_job(&self, job: &mut JobRecord, delay: u64) -> Result<JobId, QueueError>;

    /// Enqueue several jobs, ids follow the slice order
    async fn enqueue_jobs(&self, jobs: &mut [JobRecord], delay: u64) -> Result<Vec<JobId>, QueueError>;

    /// Claim the next available job, `None` when nothing is eligible
    async fn claim_job(&self) -> Result<Option<JobRecord>, QueueError>;

    /// Processing -> Success, persisting the job's message
    async fn on_success(&self, job: &mut JobRecord) -> Result<(), QueueError>;

    /// Processing -> Failure, persisting the job's message
    async fn on_failure(&self, job: &mut JobRecord) -> Result<(), QueueError>;

    /// Failure -> Queued, available after `delay` seconds
    async fn retry_job(&self, job: &mut JobRecord, delay: u64) -> Result<(), QueueError>;

    /// Number of jobs per state
    async fn count_jobs(&self) -> Result<HashMap<JobState, u64>, QueueError>;

    async fn load_job(&self, id: JobId) -> Result<Option<JobRecord>, QueueError>;

    /// Processing -> Queued without counting a retry
    async fn release_job(&self, _job: &mut JobRecord) -> Result<(), QueueError> {
        Err(QueueError::Unsupported("releasing jobs"))
    }

    async fn delete_job(&self, _id: JobId) -> Result<(), QueueError> {
        Err(QueueError::Unsupported("deleting jobs"))
    }
}
