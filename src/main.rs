//! mkimage - image resizing proxy core
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use mkimage::cli::{Cli, Commands};
use mkimage::config::{Config, ConfigManager};
use mkimage::error::MkimageResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> MkimageResult<()> {
    let cli = Cli::parse();

    let config_manager = if let Some(ref path) = cli.config {
        ConfigManager::with_path(path.clone())
    } else {
        ConfigManager::new()
    };

    let config = config_manager.load().await?;
    init_logging(cli.verbose, &config);
    debug!("Using config {}", config_manager.path().display());

    match cli.command {
        Commands::Resolve(args) => mkimage::cli::commands::resolve(args, &config).await,
        Commands::Describe(args) => mkimage::cli::commands::describe(args, &config).await,
        Commands::Sweep(args) => mkimage::cli::commands::sweep(args, &config).await,
        Commands::Config(args) => {
            mkimage::cli::commands::config(args, &config_manager, &config).await
        }
    }
}

/// 0 = warn, 1 = info, 2+ = debug; `RUST_LOG` wins when set
fn init_logging(verbose: u8, config: &Config) {
    let level = match (verbose, config.general.verbose) {
        (0, false) => "warn",
        (0, true) | (1, _) => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mkimage={}", level)));

    if config.general.log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .init();
    }
}
