//! Backlog CLI - queue administration and workers
//!
//! # Usage
//!
//! ```bash
//! # Add a job to the "default" queue
//! backlog enqueue default echo '{"message": "hello"}'
//!
//! # Process the queue once, within its processing time
//! backlog process default
//!
//! # Run workers until Ctrl-C
//! backlog work default --concurrency 4
//!
//! # Inspect
//! backlog count default
//! backlog show default 42
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

mod commands;
mod job_types;
mod settings;

use commands::{jobs, process, queues};

/// Backlog - queued job processing
#[derive(Parser)]
#[command(
    name = "backlog",
    version,
    about = "Backlog CLI - Queued Job Processing",
    long_about = "Backlog stores jobs in per-queue tables and processes them with\n\
                  lease-based claiming, so any number of workers can share a queue."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (TOML)
    #[arg(short, long, env = "BACKLOG_CONFIG", default_value = "backlog.toml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured queues
    #[command(name = "queues")]
    Queues,

    /// Add a job to a queue
    #[command(name = "enqueue")]
    Enqueue(jobs::EnqueueArgs),

    /// Show a single job
    #[command(name = "show")]
    Show(jobs::JobArgs),

    /// Delete a job
    #[command(name = "delete")]
    Delete(jobs::JobArgs),

    /// Put a processing job back in the queue without counting a retry
    #[command(name = "release")]
    Release(jobs::JobArgs),

    /// Re-queue a failed job
    #[command(name = "retry")]
    Retry(jobs::RetryArgs),

    /// Count jobs per state
    #[command(name = "count")]
    Count(queues::QueueArgs),

    /// Release expired leases and trim old jobs
    #[command(name = "cleanup")]
    Cleanup(queues::QueueArgs),

    /// Delete every job of a queue
    #[command(name = "delete-queue")]
    DeleteQueue(queues::QueueArgs),

    /// Process a queue once
    #[command(name = "process")]
    Process(process::ProcessArgs),

    /// Run workers until interrupted
    #[command(name = "work")]
    Work(process::WorkArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing based on verbosity
    setup_logging(cli.verbose);

    let settings = settings::Settings::load(&cli.config)?;

    match cli.command {
        Commands::Queues => queues::list(&settings),
        Commands::Enqueue(args) => jobs::enqueue(&settings, args).await,
        Commands::Show(args) => jobs::show(&settings, args).await,
        Commands::Delete(args) => jobs::delete(&settings, args).await,
        Commands::Release(args) => jobs::release(&settings, args).await,
        Commands::Retry(args) => jobs::retry(&settings, args).await,
        Commands::Count(args) => queues::count(&settings, args).await,
        Commands::Cleanup(args) => queues::cleanup(&settings, args).await,
        Commands::DeleteQueue(args) => queues::delete(&settings, args).await,
        Commands::Process(args) => process::process(&settings, args).await,
        Commands::Work(args) => process::work(&settings, args).await,
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print an info message
pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}
