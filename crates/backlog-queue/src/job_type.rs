//! Job type handlers and their registry

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::job::{BackoffStrategy, JobRecord, JobResult};

/// Executes the jobs of one type.
///
/// Returning `Err` (or panicking) marks the job as failed with the error's
/// message; it never aborts the surrounding batch.
#[async_trait]
pub trait JobType: Send + Sync {
    async fn process(&self, job: &JobRecord) -> anyhow::Result<JobResult>;

    /// Max retries allowed
    fn max_retries(&self) -> u32 {
        0
    }

    /// Backoff strategy
    fn backoff(&self) -> BackoffStrategy {
        BackoffStrategy::default()
    }
}

/// Resolves job types by their string id
#[derive(Default, Clone)]
pub struct JobTypeRegistry {
    handlers: HashMap<String, Arc<dyn JobType>>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type handler, replacing any previous one with the same id
    pub fn register<J: JobType + 'static>(&mut self, id: &str, handler: J) -> &mut Self {
        self.handlers.insert(id.to_string(), Arc::new(handler));
        self
    }

    pub fn register_arc(&mut self, id: &str, handler: Arc<dyn JobType>) -> &mut Self {
        self.handlers.insert(id.to_string(), handler);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn JobType>> {
        self.handlers.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl fmt::Debug for JobTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobTypeRegistry")
            .field("job_types", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl JobType for Noop {
        async fn process(&self, _job: &JobRecord) -> anyhow::Result<JobResult> {
            Ok(JobResult::success())
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = JobTypeRegistry::new();
        registry.register("noop", Noop).register("other", Noop);

        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.ids(), vec!["noop", "other"]);
        assert_eq!(registry.get("noop").map(|h| h.max_retries()), Some(0));
    }
}
