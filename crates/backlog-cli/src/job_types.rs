//! Built-in job types, so queues can be exercised without plugins

use async_trait::async_trait;
use backlog_queue::{JobRecord, JobResult, JobType, JobTypeRegistry};

/// Succeeds with the payload's `message`
pub struct Echo;

#[async_trait]
impl JobType for Echo {
    async fn process(&self, job: &JobRecord) -> anyhow::Result<JobResult> {
        Ok(match job.payload.get("message").and_then(|m| m.as_str()) {
            Some(message) => JobResult::success_with(message),
            None => JobResult::success(),
        })
    }
}

/// Always fails; `retries` and `delay` in the payload request retries
pub struct Fail;

#[async_trait]
impl JobType for Fail {
    async fn process(&self, job: &JobRecord) -> anyhow::Result<JobResult> {
        let message = job
            .payload
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Failed on purpose");
        let retries = job.payload.get("retries").and_then(|r| r.as_u64());
        let delay = job.payload.get("delay").and_then(|d| d.as_u64()).unwrap_or(0);

        Ok(match retries {
            Some(retries) => JobResult::failure_with_retry(message, u32::try_from(retries)?, delay),
            None => JobResult::failure(message),
        })
    }
}

pub fn builtin_registry() -> JobTypeRegistry {
    let mut registry = JobTypeRegistry::new();
    registry.register("echo", Echo).register("fail", Fail);
    registry
}
