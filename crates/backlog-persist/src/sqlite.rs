//! SQLite connection setup

use backlog_queue::QueueError;
use serde::Deserialize;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub(crate) static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite configuration options
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:backlog.db" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// How long a writer waits for the database lock
    pub busy_timeout_secs: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:backlog.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    /// Create config for in-memory database (testing)
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }

    /// Every connection to `:memory:` opens its own empty database
    fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

pub(crate) fn storage_error(e: impl std::fmt::Display) -> QueueError {
    QueueError::Storage(e.to_string())
}

/// Open a pool and bring the schema up to date
pub async fn connect(config: &SqliteConfig) -> Result<SqlitePool, QueueError> {
    let mut options = SqliteConnectOptions::from_str(&config.url)
        .map_err(storage_error)?
        .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

    if config.wal_mode {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
    if config.is_memory() {
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>);
    }

    let pool = pool_options
        .connect_with(options)
        .await
        .map_err(storage_error)?;

    info!(url = %config.url, wal = config.wal_mode, "Connected to SQLite");

    MIGRATOR
        .run(&pool)
        .await
        .map_err(|e| QueueError::Storage(format!("Migration failed: {}", e)))?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory_runs_migrations() {
        let pool = connect(&SqliteConfig::memory()).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM backlog_jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_memory_detection() {
        assert!(SqliteConfig::memory().is_memory());
        assert!(!SqliteConfig::default().is_memory());
    }
}
