//! Queue commands - list, count, cleanup and delete queues

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use comfy_table::{Cell, Color};

use backlog_queue::{JobState, ThresholdType};

use super::{jobs::state_color, table};
use crate::settings::Settings;
use crate::{print_info, print_success};

#[derive(Args)]
pub struct QueueArgs {
    /// Queue id
    queue: String,
}

pub fn list(settings: &Settings) -> Result<()> {
    let mut table = table(&["Queue", "Label", "Lease", "Processing time", "Threshold"]);

    for queue in &settings.queues {
        let threshold = match queue.threshold.kind {
            ThresholdType::None => "none".to_string(),
            ThresholdType::Items => format!("{} items ({:?})", queue.threshold.limit, queue.threshold.states),
            ThresholdType::Days => format!("{} days ({:?})", queue.threshold.limit, queue.threshold.states),
        };
        let processing_time = match queue.processing_time {
            0 => "unlimited".to_string(),
            secs => format!("{}s", secs),
        };
        table.add_row(vec![
            Cell::new(&queue.id).fg(Color::Green),
            Cell::new(queue.label.as_deref().unwrap_or_default()),
            Cell::new(format!("{}s", queue.lease_time)),
            Cell::new(processing_time),
            Cell::new(threshold),
        ]);
    }

    println!("{table}");
    println!();
    println!("Database: {}", settings.database.url.dimmed());
    Ok(())
}

pub async fn count(settings: &Settings, args: QueueArgs) -> Result<()> {
    let queue = settings.open_queue(&args.queue).await?;
    let counts = queue.backend().count_jobs().await?;

    let mut table = table(&["State", "Jobs"]);
    for state in JobState::ALL {
        table.add_row(vec![
            Cell::new(state).fg(state_color(state)),
            Cell::new(counts.get(&state).copied().unwrap_or_default()),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn cleanup(settings: &Settings, args: QueueArgs) -> Result<()> {
    let queue = settings.open_queue(&args.queue).await?;
    let report = queue.backend().cleanup_queue().await?;

    print_success(&format!("Cleaned up '{}'", queue.id()));
    print_info(&format!(
        "{} expired leases released, {} old jobs deleted",
        report.released.to_string().yellow(),
        report.deleted.to_string().yellow()
    ));
    Ok(())
}

pub async fn delete(settings: &Settings, args: QueueArgs) -> Result<()> {
    let queue = settings.open_queue(&args.queue).await?;
    let deleted = queue.backend().delete_queue().await?;
    print_success(&format!("Deleted {} jobs from '{}'", deleted, queue.id()));
    Ok(())
}
