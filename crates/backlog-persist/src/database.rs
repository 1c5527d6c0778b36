//! Durable queue backend on a relational table.
//!
//! Claiming selects the best candidate row, then flips it from `queued` to
//! `processing` with an update guarded by `state = 'queued'`. The guard
//! makes the transition a compare-and-swap: when another worker wins the
//! row the update touches nothing and the claim starts over.

use async_trait::async_trait;
use backlog_queue::{
    backend::zeroed_counts,
    clock::{after_secs, days_before},
    CleanupReport, Clock, JobId, JobRecord, JobState, QueueBackend,
    QueueConfig, QueueError, ThresholdType,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{Sqlite, SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::sqlite::{storage_error, MIGRATOR};

/// Attempts per claim before reporting an empty pass
pub const CLAIM_ATTEMPTS: usize = 3;

const JOB_COLUMNS: &str = "job_id, queue_id, job_type, payload, state, message, num_retries, \
                           available, processed, expires";

/// Queue backend storing jobs in the `backlog_jobs` table
#[derive(Debug, Clone)]
pub struct DatabaseBackend {
    pool: SqlitePool,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl DatabaseBackend {
    pub fn new(pool: SqlitePool, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            config,
            clock,
        }
    }

    /// Backend for another queue over the same pool
    pub fn for_queue(&self, config: QueueConfig) -> Self {
        Self {
            pool: self.pool.clone(),
            config,
            clock: self.clock.clone(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn now(&self) -> i64 {
        self.clock.now().timestamp()
    }

    /// Explain why a guarded update touched no row
    async fn transition_error(&self, id: JobId, expected: JobState) -> QueueError {
        match self.load_job(id).await {
            Ok(Some(job)) => QueueError::InvalidState {
                id,
                expected,
                actual: job.state,
            },
            Ok(None) => QueueError::NotFound(id),
            Err(e) => e,
        }
    }

    async fn resolve(&self, job: &mut JobRecord, state: JobState) -> Result<(), QueueError> {
        let id = job.require_id()?;
        let now = self.now();
        let processed = timestamp(now)?;

        let updated = sqlx::query(
            r#"
            UPDATE backlog_jobs
            SET state = ?, message = ?, processed = ?, expires = NULL
            WHERE job_id = ? AND queue_id = ? AND state = 'processing'
            "#,
        )
        .bind(state.as_str())
        .bind(job.message.as_deref())
        .bind(now)
        .bind(id)
        .bind(&self.config.id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?
        .rows_affected();

        if updated == 0 {
            return Err(self.transition_error(id, JobState::Processing).await);
        }

        job.state = state;
        job.processed_time = Some(processed);
        job.expires_time = None;
        debug!(job_id = id, queue = %self.config.id, state = %state, "Resolved job");
        Ok(())
    }

    /// Flip one selected row to `processing`. The guard re-checks `available`
    /// so a row re-queued with a delay after the select is left alone.
    async fn try_claim(&self, id: JobId, now: i64, expires: DateTime<Utc>) -> Result<bool, QueueError> {
        let claimed = sqlx::query(
            r#"
            UPDATE backlog_jobs
            SET state = 'processing', expires = ?
            WHERE job_id = ? AND state = 'queued' AND available <= ?
            "#,
        )
        .bind(expires.timestamp())
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?
        .rows_affected();
        Ok(claimed == 1)
    }

    /// Delete terminal jobs the retention threshold no longer covers
    async fn apply_threshold(&self, now: i64) -> Result<u64, QueueError> {
        let threshold = self.config.threshold;
        let states = threshold.states.states();

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM backlog_jobs WHERE queue_id = ");
        builder.push_bind(&self.config.id);
        push_state_filter(&mut builder, states);

        match threshold.kind {
            ThresholdType::None => return Ok(0),
            ThresholdType::Items => {
                builder.push(" AND job_id NOT IN (SELECT job_id FROM backlog_jobs WHERE queue_id = ");
                builder.push_bind(&self.config.id);
                push_state_filter(&mut builder, states);
                builder.push(" ORDER BY processed DESC, job_id DESC LIMIT ");
                builder.push_bind(i64::try_from(threshold.limit).unwrap_or(i64::MAX));
                builder.push(")");
            }
            ThresholdType::Days => {
                builder.push(" AND processed < ");
                builder.push_bind(days_before(timestamp(now)?, threshold.limit).timestamp());
            }
        }

        let deleted = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(storage_error)?
            .rows_affected();
        Ok(deleted)
    }
}

fn push_state_filter(builder: &mut QueryBuilder<'_, Sqlite>, states: &'static [JobState]) {
    builder.push(" AND state IN (");
    let mut separated = builder.separated(", ");
    for state in states {
        separated.push_bind(state.as_str());
    }
    separated.push_unseparated(")");
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| QueueError::Storage(format!("Invalid timestamp in DB: {}", secs)))
}

/// Whole-second instant `secs` after `now`, checked before anything is written
fn later(now: i64, secs: u64) -> Result<DateTime<Utc>, QueueError> {
    after_secs(timestamp(now)?, secs)
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord, QueueError> {
    let id: i64 = row.try_get("job_id").map_err(storage_error)?;
    let queue_id: String = row.try_get("queue_id").map_err(storage_error)?;
    let job_type: String = row.try_get("job_type").map_err(storage_error)?;
    let payload: String = row.try_get("payload").map_err(storage_error)?;
    let state: String = row.try_get("state").map_err(storage_error)?;
    let message: Option<String> = row.try_get("message").map_err(storage_error)?;
    let num_retries: i64 = row.try_get("num_retries").map_err(storage_error)?;
    let available: i64 = row.try_get("available").map_err(storage_error)?;
    let processed: Option<i64> = row.try_get("processed").map_err(storage_error)?;
    let expires: Option<i64> = row.try_get("expires").map_err(storage_error)?;

    Ok(JobRecord {
        id: Some(id),
        queue_id: Some(queue_id),
        job_type,
        payload: serde_json::from_str(&payload)?,
        state: state.parse::<JobState>().map_err(storage_error)?,
        message,
        num_retries: u32::try_from(num_retries).map_err(storage_error)?,
        available_time: Some(timestamp(available)?),
        processed_time: processed.map(timestamp).transpose()?,
        expires_time: expires.map(timestamp).transpose()?,
    })
}

#[async_trait]
impl QueueBackend for DatabaseBackend {
    fn queue_id(&self) -> &str {
        &self.config.id
    }

    async fn create_queue(&self) -> Result<(), QueueError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(format!("Migration failed: {}", e)))
    }

    async fn delete_queue(&self) -> Result<u64, QueueError> {
        let deleted = sqlx::query("DELETE FROM backlog_jobs WHERE queue_id = ?")
            .bind(&self.config.id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?
            .rows_affected();
        debug!(queue = %self.config.id, deleted, "Deleted queue");
        Ok(deleted)
    }

    async fn cleanup_queue(&self) -> Result<CleanupReport, QueueError> {
        let now = self.now();

        let released = sqlx::query(
            r#"
            UPDATE backlog_jobs
            SET state = 'queued', expires = NULL
            WHERE queue_id = ? AND state = 'processing' AND expires <= ?
            "#,
        )
        .bind(&self.config.id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?
        .rows_affected();

        let deleted = self.apply_threshold(now).await?;

        debug!(queue = %self.config.id, released, deleted, "Cleaned up queue");
        Ok(CleanupReport { released, deleted })
    }

    async fn enqueue_job(&self, job: &mut JobRecord, delay: u64) -> Result<JobId, QueueError> {
        let ids = self.enqueue_jobs(std::slice::from_mut(job), delay).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| QueueError::Storage("enqueue returned no id".into()))
    }

    async fn enqueue_jobs(&self, jobs: &mut [JobRecord], delay: u64) -> Result<Vec<JobId>, QueueError> {
        let available = later(self.now(), delay)?;
        let mut ids = Vec::with_capacity(jobs.len());

        // One transaction keeps the batch's ids contiguous and in slice order
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        for job in jobs.iter() {
            let payload = serde_json::to_string(&job.payload)?;
            let id = sqlx::query(
                r#"
                INSERT INTO backlog_jobs (queue_id, job_type, payload, state, num_retries, available)
                VALUES (?, ?, ?, 'queued', ?, ?)
                "#,
            )
            .bind(&self.config.id)
            .bind(&job.job_type)
            .bind(payload)
            .bind(i64::from(job.num_retries))
            .bind(available.timestamp())
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?
            .last_insert_rowid();
            ids.push(id);
        }
        tx.commit().await.map_err(storage_error)?;

        for (job, id) in jobs.iter_mut().zip(&ids) {
            job.id = Some(*id);
            job.queue_id = Some(self.config.id.clone());
            job.state = JobState::Queued;
            job.available_time = Some(available);
            job.processed_time = None;
            job.expires_time = None;
        }
        debug!(queue = %self.config.id, count = ids.len(), "Enqueued jobs");
        Ok(ids)
    }

    async fn claim_job(&self) -> Result<Option<JobRecord>, QueueError> {
        let select = format!(
            "SELECT {} FROM backlog_jobs \
             WHERE queue_id = ? AND state = 'queued' AND available <= ? \
             ORDER BY available ASC, job_id ASC LIMIT 1",
            JOB_COLUMNS
        );

        for attempt in 1..=CLAIM_ATTEMPTS {
            let now = self.now();
            let row = sqlx::query(&select)
                .bind(&self.config.id)
                .bind(now)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;
            let Some(row) = row else {
                return Ok(None);
            };
            let mut job = job_from_row(&row)?;
            let id = job.require_id()?;

            let expires = later(now, self.config.lease_time)?;

            if self.try_claim(id, now, expires).await? {
                job.state = JobState::Processing;
                job.expires_time = Some(expires);
                debug!(job_id = id, queue = %self.config.id, "Claimed job");
                return Ok(Some(job));
            }
            debug!(job_id = id, attempt, "Lost claim race");
        }

        Ok(None)
    }

    async fn on_success(&self, job: &mut JobRecord) -> Result<(), QueueError> {
        self.resolve(job, JobState::Success).await
    }

    async fn on_failure(&self, job: &mut JobRecord) -> Result<(), QueueError> {
        self.resolve(job, JobState::Failure).await
    }

    async fn retry_job(&self, job: &mut JobRecord, delay: u64) -> Result<(), QueueError> {
        let id = job.require_id()?;
        let available = later(self.now(), delay)?;

        let num_retries: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE backlog_jobs
            SET state = 'queued', num_retries = num_retries + 1, available = ?, processed = NULL, expires = NULL
            WHERE job_id = ? AND queue_id = ? AND state = 'failure'
            RETURNING num_retries
            "#,
        )
        .bind(available.timestamp())
        .bind(id)
        .bind(&self.config.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        let Some(num_retries) = num_retries else {
            return Err(self.transition_error(id, JobState::Failure).await);
        };

        job.state = JobState::Queued;
        job.num_retries = u32::try_from(num_retries).map_err(storage_error)?;
        job.available_time = Some(available);
        job.processed_time = None;
        job.expires_time = None;
        debug!(job_id = id, num_retries, delay_secs = delay, "Re-queued job");
        Ok(())
    }

    async fn count_jobs(&self) -> Result<HashMap<JobState, u64>, QueueError> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS jobs FROM backlog_jobs WHERE queue_id = ? GROUP BY state",
        )
        .bind(&self.config.id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        let mut counts = zeroed_counts();
        for row in rows {
            let state: String = row.try_get("state").map_err(storage_error)?;
            let jobs: i64 = row.try_get("jobs").map_err(storage_error)?;
            let state: JobState = state.parse().map_err(storage_error)?;
            counts.insert(state, u64::try_from(jobs).unwrap_or_default());
        }
        Ok(counts)
    }

    async fn load_job(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let query = format!(
            "SELECT {} FROM backlog_jobs WHERE job_id = ? AND queue_id = ?",
            JOB_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(&self.config.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn release_job(&self, job: &mut JobRecord) -> Result<(), QueueError> {
        let id = job.require_id()?;
        let released = sqlx::query(
            r#"
            UPDATE backlog_jobs
            SET state = 'queued', expires = NULL
            WHERE job_id = ? AND queue_id = ? AND state = 'processing'
            "#,
        )
        .bind(id)
        .bind(&self.config.id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?
        .rows_affected();

        if released == 0 {
            return Err(self.transition_error(id, JobState::Processing).await);
        }
        job.state = JobState::Queued;
        job.expires_time = None;
        debug!(job_id = id, "Released job");
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> Result<(), QueueError> {
        let deleted = sqlx::query("DELETE FROM backlog_jobs WHERE job_id = ? AND queue_id = ?")
            .bind(id)
            .bind(&self.config.id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?
            .rows_affected();

        if deleted == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::{connect, SqliteConfig};
    use backlog_queue::{MockClock, ThresholdPolicy, ThresholdStates};
    use serde_json::json;

    async fn backend(config: QueueConfig) -> (DatabaseBackend, MockClock) {
        let pool = connect(&SqliteConfig::memory()).await.unwrap();
        let clock = MockClock::at_timestamp(1_700_000_000);
        (DatabaseBackend::new(pool, config, Arc::new(clock.clone())), clock)
    }

    async fn succeed_next(backend: &DatabaseBackend) -> JobRecord {
        let mut job = backend.claim_job().await.unwrap().expect("job to claim");
        backend.on_success(&mut job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_payload_round_trip() {
        let (backend, _) = backend(QueueConfig::new("test")).await;
        let payload = json!({ "to": "a@example.com", "tries": [1, 2] });
        let mut job = JobRecord::new("email", payload.clone());
        let id = backend.enqueue_job(&mut job, 0).await.unwrap();

        let loaded = backend.load_job(id).await.unwrap().unwrap();
        assert_eq!(loaded.payload, payload);
        assert_eq!(loaded, job);
    }

    #[tokio::test]
    async fn test_claim_sets_lease() {
        let (backend, _) = backend(QueueConfig::new("test").with_lease_time(30)).await;
        let mut job = JobRecord::new("job", json!({}));
        backend.enqueue_job(&mut job, 0).await.unwrap();

        let claimed = backend.claim_job().await.unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Processing);
        assert_eq!(claimed.expires_time.map(|t| t.timestamp()), Some(1_700_000_030));
        assert_eq!(backend.load_job(claimed.id.unwrap()).await.unwrap(), Some(claimed));
    }

    #[tokio::test]
    async fn test_retry_requires_failure() {
        let (backend, _) = backend(QueueConfig::new("test")).await;
        let mut job = JobRecord::new("job", json!({}));
        backend.enqueue_job(&mut job, 0).await.unwrap();

        let err = backend.retry_job(&mut job, 0).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidState {
                expected: JobState::Failure,
                actual: JobState::Queued,
                ..
            }
        ));

        let mut ghost = JobRecord::new("job", json!({}));
        ghost.id = Some(999);
        assert!(matches!(
            backend.on_failure(&mut ghost).await.unwrap_err(),
            QueueError::NotFound(999)
        ));
    }

    #[tokio::test]
    async fn test_days_threshold() {
        let config = QueueConfig::new("test").with_threshold(ThresholdPolicy::days(1, ThresholdStates::All));
        let (backend, clock) = backend(config).await;

        let mut jobs = vec![JobRecord::new("job", json!({})), JobRecord::new("job", json!({}))];
        backend.enqueue_jobs(&mut jobs, 0).await.unwrap();
        let old = succeed_next(&backend).await;

        clock.advance_secs(86_400);
        let mut recent = backend.claim_job().await.unwrap().unwrap();
        backend.on_failure(&mut recent).await.unwrap();

        clock.advance_secs(1);
        let report = backend.cleanup_queue().await.unwrap();
        assert_eq!(report, CleanupReport { released: 0, deleted: 1 });
        assert!(backend.load_job(old.id.unwrap()).await.unwrap().is_none());
        assert!(backend.load_job(recent.id.unwrap()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_success_only_threshold_keeps_failures() {
        let config = QueueConfig::new("test").with_threshold(ThresholdPolicy::items(1, ThresholdStates::Success));
        let (backend, clock) = backend(config).await;

        let mut jobs: Vec<JobRecord> = (0..3).map(|_| JobRecord::new("job", json!({}))).collect();
        backend.enqueue_jobs(&mut jobs, 0).await.unwrap();

        let mut failed = backend.claim_job().await.unwrap().unwrap();
        backend.on_failure(&mut failed).await.unwrap();
        clock.advance_secs(1);
        succeed_next(&backend).await;
        clock.advance_secs(1);
        let newest = succeed_next(&backend).await;

        let report = backend.cleanup_queue().await.unwrap();
        assert_eq!(report.deleted, 1);
        let counts = backend.count_jobs().await.unwrap();
        assert_eq!(counts[&JobState::Success], 1);
        assert_eq!(counts[&JobState::Failure], 1);
        assert!(backend.load_job(newest.id.unwrap()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_claim_respects_retry_delay() {
        let (backend, clock) = backend(QueueConfig::new("test")).await;
        let mut job = JobRecord::new("job", json!({}));
        let id = backend.enqueue_job(&mut job, 0).await.unwrap();
        let selected_at = clock.now().timestamp();

        // Another worker claims, fails and re-queues the row after our select
        let mut other = backend.claim_job().await.unwrap().unwrap();
        backend.on_failure(&mut other).await.unwrap();
        backend.retry_job(&mut other, 60).await.unwrap();

        let expires = later(selected_at, 300).unwrap();
        assert!(!backend.try_claim(id, selected_at, expires).await.unwrap());
        let stored = backend.load_job(id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.available_time.map(|t| t.timestamp()), Some(selected_at + 60));

        clock.advance_secs(60);
        let now = clock.now().timestamp();
        assert!(backend.try_claim(id, now, later(now, 300).unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_out_of_range_enqueue_writes_nothing() {
        let (backend, _) = backend(QueueConfig::new("test")).await;

        for delay in [10_000_000_000_000, u64::MAX] {
            let mut job = JobRecord::new("job", json!({}));
            let err = backend.enqueue_job(&mut job, delay).await.unwrap_err();
            assert!(matches!(err, QueueError::OutOfRange(d) if d == delay));
            assert!(job.id.is_none());
        }

        assert_eq!(backend.count_jobs().await.unwrap()[&JobState::Queued], 0);
        assert!(backend.load_job(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_lease_leaves_job_queued() {
        let (backend, _) = backend(QueueConfig::new("test").with_lease_time(10_000_000_000_000)).await;
        let mut job = JobRecord::new("job", json!({}));
        let id = backend.enqueue_job(&mut job, 0).await.unwrap();

        assert!(matches!(backend.claim_job().await, Err(QueueError::OutOfRange(_))));
        let counts = backend.count_jobs().await.unwrap();
        assert_eq!(counts[&JobState::Queued], 1);
        assert_eq!(counts[&JobState::Processing], 0);
        assert_eq!(backend.load_job(id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn test_out_of_range_retry_leaves_job_failed() {
        let (backend, _) = backend(QueueConfig::new("test")).await;
        let mut job = JobRecord::new("job", json!({}));
        let id = backend.enqueue_job(&mut job, 0).await.unwrap();
        let mut job = backend.claim_job().await.unwrap().unwrap();
        backend.on_failure(&mut job).await.unwrap();

        assert!(backend.retry_job(&mut job, u64::MAX).await.is_err());
        let stored = backend.load_job(id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failure);
        assert_eq!(stored.num_retries, 0);
    }
}
