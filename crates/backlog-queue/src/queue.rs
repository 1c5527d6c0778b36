//! A configured queue bound to its backend

use std::sync::Arc;

use crate::backend::QueueBackend;
use crate::config::{ConfigError, QueueConfig};

#[derive(Clone)]
pub struct Queue {
    config: QueueConfig,
    backend: Arc<dyn QueueBackend>,
}

impl Queue {
    /// Bind a backend to its queue settings, validating them first
    pub fn new(config: QueueConfig, backend: Arc<dyn QueueBackend>) -> Result<Self, ConfigError> {
        config.validate()?;
        if backend.queue_id() != config.id {
            return Err(ConfigError::Invalid(format!(
                "backend serves queue '{}', not '{}'",
                backend.queue_id(),
                config.id
            )));
        }
        Ok(Self { config, backend })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("config", &self.config).finish_non_exhaustive()
    }
}
