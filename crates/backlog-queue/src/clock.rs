//! Injectable time source

use chrono::{DateTime, Duration, Utc};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use crate::backend::QueueError;

/// Source of "now" for backends and processors
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// `from` moved `secs` seconds ahead
pub fn after_secs(from: DateTime<Utc>, secs: u64) -> Result<DateTime<Utc>, QueueError> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delta| from.checked_add_signed(delta))
        .ok_or(QueueError::OutOfRange(secs))
}

/// `from` moved `days` days back, clamped to the earliest representable instant
pub fn days_before(from: DateTime<Utc>, days: u64) -> DateTime<Utc> {
    i64::try_from(days)
        .ok()
        .and_then(Duration::try_days)
        .and_then(|delta| from.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
///
/// Clones share the same instant, so a handler holding a clone can
/// advance the time seen by the processor and the backend.
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Start at a whole Unix second
    pub fn at_timestamp(secs: i64) -> Self {
        Self::new(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.lock() = instant;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.lock();
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        // A panic while holding the guard cannot leave a DateTime half-written
        self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock_clones_share_time() {
        let clock = MockClock::at_timestamp(1_700_000_000);
        let handle = clock.clone();

        handle.advance_secs(10);
        assert_eq!(clock.now().timestamp(), 1_700_000_010);

        handle.advance(Duration::milliseconds(1500));
        assert_eq!(clock.now().timestamp_millis(), 1_700_000_011_500);
    }

    #[test]
    fn test_after_secs_rejects_unrepresentable_offsets() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(after_secs(start, 60).unwrap().timestamp(), 1_700_000_060);
        assert!(matches!(after_secs(start, u64::MAX), Err(QueueError::OutOfRange(u64::MAX))));
        assert!(after_secs(start, 10_000_000_000_000_000).is_err());
    }

    #[test]
    fn test_days_before_clamps() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(days_before(start, 1).timestamp(), 1_700_000_000 - 86_400);
        assert_eq!(days_before(start, u64::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
