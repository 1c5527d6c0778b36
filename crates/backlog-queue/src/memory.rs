//! In-memory queue implementation

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::backend::{zeroed_counts, CleanupReport, QueueBackend, QueueError};
use crate::clock::{after_secs, days_before, Clock};
use crate::config::{QueueConfig, ThresholdType};
use crate::job::{JobId, JobRecord, JobState};

#[derive(Debug, Default)]
struct MemoryStore {
    last_id: JobId,
    jobs: BTreeMap<JobId, JobRecord>,
}

/// Volatile backend. Instances created through [`MemoryBackend::for_queue`]
/// share one id space and job table.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    config: QueueConfig,
    store: Arc<RwLock<MemoryStore>>,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    pub fn new(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store: Arc::default(),
            clock,
        }
    }

    /// Backend for another queue over the same storage
    pub fn for_queue(&self, config: QueueConfig) -> Self {
        Self {
            config,
            store: self.store.clone(),
            clock: self.clock.clone(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(0)
    }

    fn owned_mut<'a>(
        &self,
        store: &'a mut MemoryStore,
        id: JobId,
        expected: JobState,
    ) -> Result<&'a mut JobRecord, QueueError> {
        let stored = store
            .jobs
            .get_mut(&id)
            .filter(|job| job.queue_id.as_deref() == Some(self.config.id.as_str()))
            .ok_or(QueueError::NotFound(id))?;
        if stored.state != expected {
            return Err(QueueError::InvalidState {
                id,
                expected,
                actual: stored.state,
            });
        }
        Ok(stored)
    }

    async fn resolve(&self, job: &mut JobRecord, state: JobState) -> Result<(), QueueError> {
        let id = job.require_id()?;
        let now = self.now();
        let mut store = self.store.write().await;
        let stored = self.owned_mut(&mut store, id, JobState::Processing)?;
        stored.state = state;
        stored.message = job.message.clone();
        stored.processed_time = Some(now);
        stored.expires_time = None;
        *job = stored.clone();
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn queue_id(&self) -> &str {
        &self.config.id
    }

    async fn delete_queue(&self) -> Result<u64, QueueError> {
        let mut store = self.store.write().await;
        let before = store.jobs.len();
        store
            .jobs
            .retain(|_, job| job.queue_id.as_deref() != Some(self.config.id.as_str()));
        Ok((before - store.jobs.len()) as u64)
    }

    async fn cleanup_queue(&self) -> Result<CleanupReport, QueueError> {
        let now = self.now();
        let mut store = self.store.write().await;
        let mut report = CleanupReport::default();
        let queue_id = self.config.id.as_str();

        for job in store.jobs.values_mut() {
            if job.queue_id.as_deref() == Some(queue_id)
                && job.state == JobState::Processing
                && job.expires_time.is_some_and(|expires| expires <= now)
            {
                job.state = JobState::Queued;
                job.expires_time = None;
                report.released += 1;
            }
        }

        let threshold = self.config.threshold;
        let states = threshold.states.states();
        let matching = |job: &JobRecord| {
            job.queue_id.as_deref() == Some(queue_id) && states.contains(&job.state)
        };
        let doomed: Vec<JobId> = match threshold.kind {
            ThresholdType::None => Vec::new(),
            ThresholdType::Items => {
                let mut terminal: Vec<&JobRecord> =
                    store.jobs.values().filter(|&job| matching(job)).collect();
                terminal.sort_by(|a, b| b.processed_time.cmp(&a.processed_time).then(b.id.cmp(&a.id)));
                terminal
                    .into_iter()
                    .skip(usize::try_from(threshold.limit).unwrap_or(usize::MAX))
                    .filter_map(|job| job.id)
                    .collect()
            }
            ThresholdType::Days => {
                let cutoff = days_before(now, threshold.limit);
                store
                    .jobs
                    .values()
                    .filter(|&job| matching(job) && job.processed_time.is_some_and(|t| t < cutoff))
                    .filter_map(|job| job.id)
                    .collect()
            }
        };
        for id in &doomed {
            store.jobs.remove(id);
        }
        report.deleted = doomed.len() as u64;

        debug!(queue = %queue_id, released = report.released, deleted = report.deleted, "Cleaned up queue");
        Ok(report)
    }

    async fn enqueue_job(&self, job: &mut JobRecord, delay: u64) -> Result<JobId, QueueError> {
        let ids = self.enqueue_jobs(std::slice::from_mut(job), delay).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| QueueError::Storage("enqueue returned no id".into()))
    }

    async fn enqueue_jobs(&self, jobs: &mut [JobRecord], delay: u64) -> Result<Vec<JobId>, QueueError> {
        let available = after_secs(self.now(), delay)?;
        let mut store = self.store.write().await;
        let mut ids = Vec::with_capacity(jobs.len());

        for job in jobs.iter_mut() {
            store.last_id += 1;
            let id = store.last_id;
            job.id = Some(id);
            job.queue_id = Some(self.config.id.clone());
            job.state = JobState::Queued;
            job.available_time = Some(available);
            job.expires_time = None;
            job.processed_time = None;
            store.jobs.insert(id, job.clone());
            ids.push(id);
        }
        Ok(ids)
    }

    async fn claim_job(&self) -> Result<Option<JobRecord>, QueueError> {
        let now = self.now();
        let mut store = self.store.write().await;
        let queue_id = self.config.id.as_str();

        let candidate = store
            .jobs
            .values()
            .filter(|job| {
                job.queue_id.as_deref() == Some(queue_id)
                    && job.state == JobState::Queued
                    && job.available_time.is_some_and(|t| t <= now)
            })
            .min_by_key(|job| (job.available_time, job.id))
            .and_then(|job| job.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let expires = after_secs(now, self.config.lease_time)?;
        let Some(job) = store.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.state = JobState::Processing;
        job.expires_time = Some(expires);
        Ok(Some(job.clone()))
    }

    async fn on_success(&self, job: &mut JobRecord) -> Result<(), QueueError> {
        self.resolve(job, JobState::Success).await
    }

    async fn on_failure(&self, job: &mut JobRecord) -> Result<(), QueueError> {
        self.resolve(job, JobState::Failure).await
    }

    async fn retry_job(&self, job: &mut JobRecord, delay: u64) -> Result<(), QueueError> {
        let id = job.require_id()?;
        let available = after_secs(self.now(), delay)?;
        let mut store = self.store.write().await;
        let stored = self.owned_mut(&mut store, id, JobState::Failure)?;
        stored.state = JobState::Queued;
        stored.num_retries += 1;
        stored.available_time = Some(available);
        stored.processed_time = None;
        stored.expires_time = None;
        *job = stored.clone();
        Ok(())
    }

    async fn count_jobs(&self) -> Result<HashMap<JobState, u64>, QueueError> {
        let store = self.store.read().await;
        let mut counts = zeroed_counts();
        for job in store
            .jobs
            .values()
            .filter(|job| job.queue_id.as_deref() == Some(self.config.id.as_str()))
        {
            *counts.entry(job.state).or_default() += 1;
        }
        Ok(counts)
    }

    async fn load_job(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let store = self.store.read().await;
        Ok(store
            .jobs
            .get(&id)
            .filter(|job| job.queue_id.as_deref() == Some(self.config.id.as_str()))
            .cloned())
    }

    async fn release_job(&self, job: &mut JobRecord) -> Result<(), QueueError> {
        let id = job.require_id()?;
        let mut store = self.store.write().await;
        let stored = self.owned_mut(&mut store, id, JobState::Processing)?;
        stored.state = JobState::Queued;
        stored.expires_time = None;
        *job = stored.clone();
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> Result<(), QueueError> {
        let mut store = self.store.write().await;
        let owned = store
            .jobs
            .get(&id)
            .is_some_and(|job| job.queue_id.as_deref() == Some(self.config.id.as_str()));
        if !owned {
            return Err(QueueError::NotFound(id));
        }
        store.jobs.remove(&id);
        Ok(())
    }
}
