//! Resolve command - run one request through the pipeline

use crate::cli::args::{OutputFormat, ResolveArgs};
use crate::cli::output;
use crate::config::{Config, ConfigManager};
use crate::error::MkimageResult;
use crate::pipeline::{ImageRequest, Resizer, Resolved};

/// Execute the resolve command
pub async fn execute(args: ResolveArgs, config: &Config) -> MkimageResult<()> {
    ConfigManager::ensure_cache_dirs(config).await?;
    let resizer = Resizer::from_config(config)?;

    let request = ImageRequest::new(&args.url, args.operation)
        .with_params(args.params())
        .forced(args.force);
    let resolved = resizer.process(&request).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resolved)?),
        OutputFormat::Text => print_text(&resolved),
    }
    Ok(())
}

fn print_text(resolved: &Resolved) {
    let info = &resolved.info;
    output::section(&resolved.path.display().to_string());
    output::field("format", &info.format);
    output::field("dimensions", format!("{}x{}", info.width, info.height));
    output::field("depth", info.depth);
    output::field("size", format!("{} bytes", info.size));
    output::field("download", output::hit_or_miss(resolved.download_hit));
    output::field("transform", output::hit_or_miss(resolved.transform_hit));
}
