//! Sweep command - reclaim abandoned working files

use crate::cache::Sweeper;
use crate::cli::args::{OutputFormat, SweepArgs};
use crate::cli::output;
use crate::config::Config;
use crate::error::{MkimageError, MkimageResult};
use std::time::SystemTime;
use tracing::info;

/// Execute the sweep command
pub async fn execute(args: SweepArgs, config: &Config) -> MkimageResult<()> {
    let sweeper = Sweeper::from_config(&config.cache.work_dir, &config.sweep);

    if args.watch {
        return watch(sweeper).await;
    }

    let pass = sweeper.clone();
    let report = tokio::task::spawn_blocking(move || pass.sweep_once(SystemTime::now()))
        .await
        .map_err(|e| MkimageError::Internal(format!("sweep task failed: {}", e)))?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => output::step_ok_detail(
            &format!(
                "Swept {}: removed {} of {} files",
                sweeper.work_dir().display(),
                report.removed,
                report.scanned
            ),
            &format!("{} errors", report.errors),
        ),
    }
    Ok(())
}

async fn watch(sweeper: Sweeper) -> MkimageResult<()> {
    output::step_ok_detail(
        &format!("Watching {}", sweeper.work_dir().display()),
        &format!(
            "every {}s, ttl {}s",
            sweeper.interval().as_secs(),
            sweeper.ttl().as_secs()
        ),
    );

    let handle = sweeper.spawn();
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| MkimageError::io("waiting for Ctrl-C", e))?;

    info!("Interrupted, stopping sweeper");
    handle.abort();
    Ok(())
}
