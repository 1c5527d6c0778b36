//! Worker Pool for long-running queue processing

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use crate::processor::Processor;
use crate::queue::Queue;

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Independent single-job workers
    pub concurrency: usize,
    /// Sleep after a pass that found nothing to do
    pub poll_interval: Duration,
    /// Minimum time between cleanup sweeps
    pub cleanup_interval: Duration,
    /// Pause after a storage error
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(60),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Runs `concurrency` workers against one queue until shut down.
///
/// Each worker holds at most one lease at a time; exclusivity between
/// workers comes entirely from the backend's claim.
pub struct WorkerPool {
    queue: Queue,
    processor: Processor,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(queue: Queue, processor: Processor, config: WorkerConfig) -> Self {
        Self {
            queue,
            processor,
            config,
        }
    }

    /// Run until `shutdown` flips to `true`, returns the jobs handled
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> usize {
        let workers = self.config.concurrency.max(1);
        info!(
            queue = %self.queue.id(),
            "Worker pool started with concurrency {}",
            workers
        );

        let mut set = JoinSet::new();
        for _ in 0..workers {
            let worker_id = Uuid::new_v4();
            let span = tracing::info_span!("worker", %worker_id);
            let queue = self.queue.clone();
            let processor = self.processor.clone();
            let config = self.config;
            let shutdown = shutdown.clone();
            set.spawn(work(queue, processor, config, shutdown).instrument(span));
        }

        let mut total = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(handled) => total += handled,
                Err(e) => error!("Worker task failed: {}", e),
            }
        }
        info!(queue = %self.queue.id(), total, "Worker pool stopped");
        total
    }
}

async fn work(
    queue: Queue,
    processor: Processor,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let mut total = 0;
    let mut last_cleanup: Option<tokio::time::Instant> = None;

    while !*shutdown.borrow() {
        if last_cleanup.map_or(true, |at| at.elapsed() >= config.cleanup_interval) {
            match queue.backend().cleanup_queue().await {
                Ok(report) => {
                    if report.released > 0 || report.deleted > 0 {
                        info!(
                            queue = %queue.id(),
                            released = report.released,
                            deleted = report.deleted,
                            "Cleanup sweep"
                        );
                    }
                }
                Err(e) => error!(queue = %queue.id(), "Cleanup failed: {}", e),
            }
            last_cleanup = Some(tokio::time::Instant::now());
        }

        let pause = match processor.process_queue(&queue).await {
            Ok(0) => config.poll_interval,
            Ok(handled) => {
                total += handled;
                continue;
            }
            Err(e) => {
                error!(queue = %queue.id(), "Queue error: {}", e);
                config.error_backoff
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::default();
        assert!(config.concurrency > 0);
        assert!(config.poll_interval.as_millis() > 0);
        assert!(config.cleanup_interval >= config.poll_interval);
    }
}
