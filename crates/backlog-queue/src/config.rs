//! Queue configuration
//!
//! Queues are defined by the administrative layer; this crate only consumes
//! the settings that drive claiming, processing and cleanup.

use serde::{Deserialize, Serialize};

use crate::job::JobState;

/// Upper bound for `lease_time` and `processing_time` (100 years)
pub const MAX_PERIOD_SECS: u64 = 100 * 365 * 86_400;

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing setting: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How old terminal jobs are trimmed by the cleanup sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdType {
    /// Keep everything
    #[default]
    None,
    /// Keep the `limit` most recently processed jobs
    Items,
    /// Keep jobs processed within the last `limit` days
    Days,
}

/// Which terminal states the threshold applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdStates {
    #[default]
    Success,
    /// Success and Failure
    All,
}

impl ThresholdStates {
    pub fn states(&self) -> &'static [JobState] {
        match self {
            Self::Success => &[JobState::Success],
            Self::All => &[JobState::Success, JobState::Failure],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ThresholdPolicy {
    #[serde(rename = "type", default)]
    pub kind: ThresholdType,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub states: ThresholdStates,
}

impl ThresholdPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn items(limit: u64, states: ThresholdStates) -> Self {
        Self {
            kind: ThresholdType::Items,
            limit,
            states,
        }
    }

    pub fn days(limit: u64, states: ThresholdStates) -> Self {
        Self {
            kind: ThresholdType::Days,
            limit,
            states,
        }
    }
}

fn default_lease_time() -> u64 {
    300
}

fn default_processing_time() -> u64 {
    90
}

/// Settings of a single queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Machine name, scopes every job row
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Seconds a claimed job stays leased
    #[serde(default = "default_lease_time")]
    pub lease_time: u64,
    /// Seconds one processor invocation may run, 0 = unlimited
    #[serde(default = "default_processing_time")]
    pub processing_time: u64,
    #[serde(default)]
    pub threshold: ThresholdPolicy,
}

impl QueueConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
            lease_time: default_lease_time(),
            processing_time: default_processing_time(),
            threshold: ThresholdPolicy::none(),
        }
    }

    pub fn with_lease_time(mut self, secs: u64) -> Self {
        self.lease_time = secs;
        self
    }

    pub fn with_processing_time(mut self, secs: u64) -> Self {
        self.processing_time = secs;
        self
    }

    pub fn with_threshold(mut self, threshold: ThresholdPolicy) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Missing("id"));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::Invalid(format!(
                "queue id '{}' may only contain letters, digits, '_' and '-'",
                self.id
            )));
        }
        if self.lease_time == 0 {
            return Err(ConfigError::Missing("lease_time"));
        }
        for (name, secs) in [
            ("lease_time", self.lease_time),
            ("processing_time", self.processing_time),
        ] {
            if secs > MAX_PERIOD_SECS {
                return Err(ConfigError::Invalid(format!(
                    "queue '{}': {} of {}s exceeds {}s",
                    self.id, name, secs, MAX_PERIOD_SECS
                )));
            }
        }
        if self.threshold.kind != ThresholdType::None && self.threshold.limit == 0 {
            return Err(ConfigError::Invalid(format!(
                "queue '{}': threshold limit must be positive",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::new("default");
        assert_eq!(config.lease_time, 300);
        assert_eq!(config.processing_time, 90);
        assert_eq!(config.threshold.kind, ThresholdType::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(QueueConfig::new("").validate().is_err());
        assert!(QueueConfig::new("a b").validate().is_err());
        assert!(QueueConfig::new("q").with_lease_time(0).validate().is_err());
        let config = QueueConfig::new("q").with_threshold(ThresholdPolicy::items(0, ThresholdStates::All));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_periods() {
        let config = QueueConfig::new("q").with_lease_time(MAX_PERIOD_SECS);
        assert!(config.validate().is_ok());
        let config = QueueConfig::new("q").with_lease_time(10_000_000_000_000);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        let config = QueueConfig::new("q").with_processing_time(MAX_PERIOD_SECS + 1);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_deserialize_threshold() {
        let config: QueueConfig = serde_json::from_value(serde_json::json!({
            "id": "emails",
            "lease_time": 60,
            "threshold": { "type": "days", "limit": 7, "states": "all" }
        }))
        .unwrap();
        assert_eq!(config.processing_time, 90);
        assert_eq!(config.threshold, ThresholdPolicy::days(7, ThresholdStates::All));
        assert_eq!(config.threshold.states.states().len(), 2);
    }
}
