//! Describe command - identify a local image

use crate::cli::args::{DescribeArgs, OutputFormat};
use crate::cli::output;
use crate::config::Config;
use crate::engine::Magick;
use crate::error::{MkimageError, MkimageResult};
use crate::metadata::MetadataCache;
use std::sync::Arc;

/// Execute the describe command
pub async fn execute(args: DescribeArgs, config: &Config) -> MkimageResult<()> {
    if !args.path.is_file() {
        return Err(MkimageError::validation(format!(
            "{} is not a file",
            args.path.display()
        )));
    }

    let metadata = MetadataCache::new(
        Arc::new(Magick::new(&config.transform)),
        config.metadata.capacity,
    );
    let info = metadata.describe(&args.path, args.force).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
        OutputFormat::Text => {
            output::section(&args.path.display().to_string());
            output::field("format", &info.format);
            output::field("dimensions", format!("{}x{}", info.width, info.height));
            output::field("depth", info.depth);
            output::field("size", format!("{} bytes", info.size));
            output::field("name", &info.name);
        }
    }
    Ok(())
}
