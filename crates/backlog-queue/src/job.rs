//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job Identifier, assigned by the backend at enqueue time
pub type JobId = i64;

/// Job State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in queue
    Queued,
    /// Claimed by a worker, lease running
    Processing,
    /// Successfully completed
    Success,
    /// Permanently failed (until retried)
    Failure,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Queued,
        JobState::Processing,
        JobState::Success,
        JobState::Failure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    /// Success and Failure are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown job state: {0}")]
pub struct ParseJobStateError(String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(ParseJobStateError(other.to_string())),
        }
    }
}

/// A persisted job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unset until the job is enqueued
    pub id: Option<JobId>,
    pub queue_id: Option<String>,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub message: Option<String>,
    pub num_retries: u32,
    pub available_time: Option<DateTime<Utc>>,
    pub processed_time: Option<DateTime<Utc>>,
    /// Lease expiry, only set while `Processing`
    pub expires_time: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a new, not yet enqueued, job
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            queue_id: None,
            job_type: job_type.into(),
            payload,
            state: JobState::Queued,
            message: None,
            num_retries: 0,
            available_time: None,
            processed_time: None,
            expires_time: None,
        }
    }

    /// The id of an enqueued job
    pub fn require_id(&self) -> Result<JobId, crate::backend::QueueError> {
        self.id.ok_or(crate::backend::QueueError::NotEnqueued)
    }
}

/// Result of job execution
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub state: JobState,
    pub message: Option<String>,
    /// Overrides the job type's max retries
    pub max_retries: Option<u32>,
    /// Overrides the job type's retry delay (seconds)
    pub retry_delay: Option<u64>,
}

impl JobResult {
    pub fn success() -> Self {
        Self {
            state: JobState::Success,
            message: None,
            max_retries: None,
            retry_delay: None,
        }
    }

    pub fn success_with(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::success()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            state: JobState::Failure,
            message: Some(message.into()),
            max_retries: None,
            retry_delay: None,
        }
    }

    /// Failure that asks for up to `max_retries` retries, `retry_delay` seconds apart
    pub fn failure_with_retry(message: impl Into<String>, max_retries: u32, retry_delay: u64) -> Self {
        Self {
            max_retries: Some(max_retries),
            retry_delay: Some(retry_delay),
            ..Self::failure(message)
        }
    }
}

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    Constant { secs: u64 },
    Exponential { initial_secs: u64, multiplier: f64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Constant { secs: 0 }
    }
}

impl BackoffStrategy {
    /// Delay in seconds before retry number `attempt + 1`
    pub fn delay(&self, attempt: u32) -> u64 {
        match self {
            Self::Constant { secs } => *secs,
            Self::Exponential {
                initial_secs,
                multiplier,
            } => (*initial_secs as f64 * multiplier.powi(attempt as i32)) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_round_trips_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn test_new_job_is_queued_and_unassigned() {
        let job = JobRecord::new("echo", json!({"message": "hi"}));
        assert_eq!(job.state, JobState::Queued);
        assert!(job.id.is_none());
        assert!(job.expires_time.is_none());
        assert_eq!(job.num_retries, 0);
        assert!(job.require_id().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Success.is_terminal());
        assert!(JobState::Failure.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Processing.is_terminal());
    }

    #[test]
    fn test_backoff_strategy_exponential() {
        let strategy = BackoffStrategy::Exponential {
            initial_secs: 1,
            multiplier: 2.0,
        };
        assert_eq!(strategy.delay(0), 1);
        assert_eq!(strategy.delay(3), 8);
        assert_eq!(BackoffStrategy::Constant { secs: 5 }.delay(10), 5);
    }
}
