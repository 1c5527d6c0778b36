//! Processor: drains a queue within its processing time budget

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{QueueBackend, QueueError};
use crate::clock::{after_secs, Clock};
use crate::job::{JobRecord, JobResult, JobState};
use crate::job_type::{JobType, JobTypeRegistry};
use crate::queue::Queue;

#[derive(Debug, Clone)]
pub struct Processor {
    registry: Arc<JobTypeRegistry>,
    clock: Arc<dyn Clock>,
}

impl Processor {
    pub fn new(registry: Arc<JobTypeRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { registry, clock }
    }

    /// Claim and process jobs until the queue is drained or the queue's
    /// processing time has elapsed. Returns the number of jobs handled.
    ///
    /// The time budget is only checked between jobs. Storage errors abort
    /// the batch; a job claimed but not yet resolved stays `Processing`
    /// until its lease expires.
    pub async fn process_queue(&self, queue: &Queue) -> Result<usize, QueueError> {
        let backend = queue.backend();
        let budget = queue.config().processing_time;
        // An offset past the end of time is as good as unlimited
        let deadline = match budget {
            0 => None,
            secs => after_secs(self.clock.now(), secs).ok(),
        };
        let mut handled = 0;

        while let Some(job) = backend.claim_job().await? {
            if self.process_job(backend.as_ref(), job).await? {
                handled += 1;
            }
            if deadline.is_some_and(|deadline| self.clock.now() >= deadline) {
                debug!(queue = %queue.id(), budget_secs = budget, "Processing time exhausted");
                break;
            }
        }

        info!(queue = %queue.id(), handled, "Processed queue");
        Ok(handled)
    }

    /// Run one claimed job and record its outcome.
    ///
    /// Returns `false` when the job's lease was lost before it could be
    /// resolved (expired and re-queued, or deleted).
    pub async fn process_job(
        &self,
        backend: &dyn QueueBackend,
        mut job: JobRecord,
    ) -> Result<bool, QueueError> {
        let job_id = job.require_id()?;
        let handler = self.registry.get(&job.job_type);

        let result = match &handler {
            Some(handler) => execute(handler.as_ref(), &job).await,
            None => JobResult::failure(format!("Unknown job type: {}", job.job_type)),
        };
        job.message = result.message.clone();

        if result.state == JobState::Success {
            if !lease_held(backend.on_success(&mut job).await, &job)? {
                return Ok(false);
            }
            debug!(job_id, job_type = %job.job_type, "Job succeeded");
            return Ok(true);
        }

        if !lease_held(backend.on_failure(&mut job).await, &job)? {
            return Ok(false);
        }

        // Unknown job types are never retried
        let Some(handler) = handler else {
            warn!(job_id, job_type = %job.job_type, "No handler registered for job type");
            return Ok(true);
        };

        let max_retries = result.max_retries.unwrap_or_else(|| handler.max_retries());
        if job.num_retries < max_retries {
            let delay = result
                .retry_delay
                .unwrap_or_else(|| handler.backoff().delay(job.num_retries));
            match backend.retry_job(&mut job, delay).await {
                Err(e @ QueueError::OutOfRange(_)) => {
                    warn!(job_id, error = %e, "Retry delay out of range, job left failed");
                    return Ok(true);
                }
                // A threshold sweep may remove the failed row before it is re-queued
                outcome => {
                    if !lease_held(outcome, &job)? {
                        return Ok(true);
                    }
                }
            }
            info!(
                job_id,
                attempt = job.num_retries,
                delay_secs = delay,
                "Job failed, scheduling retry"
            );
        } else {
            warn!(
                job_id,
                job_type = %job.job_type,
                message = job.message.as_deref().unwrap_or_default(),
                "Job failed"
            );
        }
        Ok(true)
    }
}

async fn execute(handler: &dyn JobType, job: &JobRecord) -> JobResult {
    match AssertUnwindSafe(handler.process(job)).catch_unwind().await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => JobResult::failure(e.to_string()),
        Err(panic) => JobResult::failure(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "Job handler panicked".to_string()
    }
}

/// Lost leases are reported as `Ok(false)`, other errors pass through
fn lease_held(outcome: Result<(), QueueError>, job: &JobRecord) -> Result<bool, QueueError> {
    match outcome {
        Ok(()) => Ok(true),
        Err(e @ (QueueError::InvalidState { .. } | QueueError::NotFound(_))) => {
            warn!(job_id = ?job.id, error = %e, "Lease lost before the job could be resolved");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
