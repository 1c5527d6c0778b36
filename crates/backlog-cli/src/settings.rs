//! Configuration loading
//!
//! Settings come from an optional TOML file, overridden by `BACKLOG__*`
//! environment variables (e.g. `BACKLOG__DATABASE__URL`).

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

use backlog_persist::{connect, DatabaseBackend, SqliteConfig};
use backlog_queue::{Queue, QueueConfig, SystemClock};

fn default_queues() -> Vec<QueueConfig> {
    vec![QueueConfig::new("default")]
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: SqliteConfig,
    #[serde(default = "default_queues")]
    pub queues: Vec<QueueConfig>,
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("BACKLOG").separator("__"))
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?
            .try_deserialize()
            .context("Invalid configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for queue in &self.queues {
            queue.validate()?;
            if !seen.insert(queue.id.as_str()) {
                bail!("Queue '{}' is configured twice", queue.id);
            }
        }
        Ok(())
    }

    pub fn queue_config(&self, id: &str) -> Result<&QueueConfig> {
        self.queues
            .iter()
            .find(|queue| queue.id == id)
            .ok_or_else(|| anyhow!("Unknown queue '{}'", id))
    }

    /// Connect to the database and bind the named queue to it
    pub async fn open_queue(&self, id: &str) -> Result<Queue> {
        let config = self.queue_config(id)?.clone();
        let pool = connect(&self.database)
            .await
            .with_context(|| format!("Failed to open {}", self.database.url))?;
        let backend = DatabaseBackend::new(pool, config.clone(), Arc::new(SystemClock));
        Ok(Queue::new(config, Arc::new(backend))?)
    }
}
