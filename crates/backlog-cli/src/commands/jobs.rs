//! Job commands - enqueue and inspect or resolve single jobs
//!
//! Usage:
//! ```bash
//! backlog enqueue default echo '{"message": "hi"}' --delay 10
//! backlog show default 42
//! backlog retry default 42 --delay 60
//! ```

use anyhow::{anyhow, Context, Result};
use clap::Args;
use colored::Colorize;
use comfy_table::{Cell, Color};

use backlog_queue::{JobId, JobRecord, JobState, Queue};

use super::table;
use crate::settings::Settings;
use crate::{print_info, print_success};

#[derive(Args)]
pub struct EnqueueArgs {
    /// Queue id
    queue: String,

    /// Job type
    job_type: String,

    /// JSON payload
    #[arg(default_value = "{}")]
    payload: String,

    /// Seconds before the job becomes available
    #[arg(long, default_value_t = 0)]
    delay: u64,
}

#[derive(Args)]
pub struct JobArgs {
    /// Queue id
    queue: String,

    /// Job id
    id: JobId,
}

#[derive(Args)]
pub struct RetryArgs {
    #[command(flatten)]
    job: JobArgs,

    /// Seconds before the job becomes available again
    #[arg(long, default_value_t = 0)]
    delay: u64,
}

pub async fn enqueue(settings: &Settings, args: EnqueueArgs) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&args.payload)
        .with_context(|| format!("Invalid JSON: {}", args.payload))?;
    let queue = settings.open_queue(&args.queue).await?;

    let mut job = JobRecord::new(args.job_type, payload);
    let id = queue.backend().enqueue_job(&mut job, args.delay).await?;
    print_success(&format!("Enqueued job {} in '{}'", id, queue.id()));
    Ok(())
}

pub async fn show(settings: &Settings, args: JobArgs) -> Result<()> {
    let queue = settings.open_queue(&args.queue).await?;
    let job = load(&queue, args.id).await?;

    let mut table = table(&["Field", "Value"]);
    let time = |t: Option<chrono::DateTime<chrono::Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_default();
    table.add_row(vec![Cell::new("id"), Cell::new(args.id)]);
    table.add_row(vec![Cell::new("type"), Cell::new(&job.job_type)]);
    table.add_row(vec![Cell::new("state"), Cell::new(job.state).fg(state_color(job.state))]);
    table.add_row(vec![Cell::new("message"), Cell::new(job.message.as_deref().unwrap_or_default())]);
    table.add_row(vec![Cell::new("retries"), Cell::new(job.num_retries)]);
    table.add_row(vec![Cell::new("available"), Cell::new(time(job.available_time))]);
    table.add_row(vec![Cell::new("processed"), Cell::new(time(job.processed_time))]);
    table.add_row(vec![Cell::new("expires"), Cell::new(time(job.expires_time))]);
    table.add_row(vec![
        Cell::new("payload"),
        Cell::new(serde_json::to_string_pretty(&job.payload)?),
    ]);

    println!("{table}");
    Ok(())
}

pub async fn delete(settings: &Settings, args: JobArgs) -> Result<()> {
    let queue = settings.open_queue(&args.queue).await?;
    queue.backend().delete_job(args.id).await?;
    print_success(&format!("Deleted job {}", args.id));
    Ok(())
}

pub async fn release(settings: &Settings, args: JobArgs) -> Result<()> {
    let queue = settings.open_queue(&args.queue).await?;
    let mut job = load(&queue, args.id).await?;
    queue.backend().release_job(&mut job).await?;
    print_success(&format!("Released job {}", args.id));
    Ok(())
}

pub async fn retry(settings: &Settings, args: RetryArgs) -> Result<()> {
    let queue = settings.open_queue(&args.job.queue).await?;
    let mut job = load(&queue, args.job.id).await?;
    queue.backend().retry_job(&mut job, args.delay).await?;
    print_success(&format!("Job {} queued for retry", args.job.id));
    if args.delay > 0 {
        print_info(&format!("Available in {}s", args.delay.to_string().green()));
    }
    Ok(())
}

async fn load(queue: &Queue, id: JobId) -> Result<JobRecord> {
    queue
        .backend()
        .load_job(id)
        .await?
        .ok_or_else(|| anyhow!("Job {} not found in '{}'", id, queue.id()))
}

pub(crate) fn state_color(state: JobState) -> Color {
    match state {
        JobState::Queued => Color::Blue,
        JobState::Processing => Color::Yellow,
        JobState::Success => Color::Green,
        JobState::Failure => Color::Red,
    }
}
