//! Processing commands - one-shot (cron style) and long-running workers

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use backlog_queue::{Processor, SystemClock, WorkerConfig, WorkerPool};

use crate::job_types::builtin_registry;
use crate::settings::Settings;
use crate::{print_info, print_success};

#[derive(Args)]
pub struct ProcessArgs {
    /// Queue id
    queue: String,

    /// Skip the lease-expiry and threshold sweep before processing
    #[arg(long)]
    no_cleanup: bool,
}

#[derive(Args)]
pub struct WorkArgs {
    /// Queue id
    queue: String,

    /// Number of concurrent workers
    #[arg(short = 'n', long, default_value_t = 1)]
    concurrency: usize,

    /// Milliseconds to sleep when the queue is empty
    #[arg(long, default_value_t = 1000)]
    poll_ms: u64,

    /// Seconds between cleanup sweeps
    #[arg(long, default_value_t = 60)]
    cleanup_secs: u64,
}

fn processor() -> Processor {
    Processor::new(Arc::new(builtin_registry()), Arc::new(SystemClock))
}

pub async fn process(settings: &Settings, args: ProcessArgs) -> Result<()> {
    let queue = settings.open_queue(&args.queue).await?;

    if !args.no_cleanup {
        let report = queue.backend().cleanup_queue().await?;
        info!(released = report.released, deleted = report.deleted, "Cleanup sweep");
    }

    let handled = processor().process_queue(&queue).await?;
    print_success(&format!(
        "Processed {} jobs from '{}'",
        handled.to_string().green(),
        queue.id()
    ));
    Ok(())
}

pub async fn work(settings: &Settings, args: WorkArgs) -> Result<()> {
    let queue = settings.open_queue(&args.queue).await?;
    let config = WorkerConfig {
        concurrency: args.concurrency,
        poll_interval: Duration::from_millis(args.poll_ms),
        cleanup_interval: Duration::from_secs(args.cleanup_secs),
        ..Default::default()
    };

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = stop.send(true);
    });

    print_info(&format!(
        "Working on '{}' with {} workers, Ctrl-C to stop",
        queue.id(),
        config.concurrency
    ));
    let pool = WorkerPool::new(queue, processor(), config);
    let handled = pool.run(shutdown).await;
    print_success(&format!("Stopped after {} jobs", handled));
    Ok(())
}
