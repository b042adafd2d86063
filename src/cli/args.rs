//! CLI argument definitions using clap derive

use crate::engine::{Gravity, Operation, OutputFormat as ImageFormat, Overlay, TransformParams};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// mkimage - image resizing proxy core
///
/// Fetches remote images, transforms them with ImageMagick and caches
/// both the originals and the results on disk.
#[derive(Parser, Debug)]
#[command(name = "mkimage")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "MKIMAGE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download and transform an image, printing the cached file
    Resolve(ResolveArgs),

    /// Show metadata of a local image
    Describe(DescribeArgs),

    /// Remove abandoned working files
    Sweep(SweepArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the resolve command
#[derive(Parser, Debug)]
pub struct ResolveArgs {
    /// Image URL (http:// is assumed when no scheme is given)
    pub url: String,

    /// Operation: resize, stretch, crop, chop or cache
    #[arg(long = "op", default_value = "resize")]
    pub operation: Operation,

    /// Target width in pixels
    #[arg(short, long)]
    pub width: Option<u32>,

    /// Target height in pixels
    #[arg(short = 'H', long)]
    pub height: Option<u32>,

    /// JPEG/WebP quality, 1-100
    #[arg(short, long)]
    pub quality: Option<u8>,

    /// Horizontal crop offset
    #[arg(short)]
    pub x: Option<u32>,

    /// Vertical crop offset
    #[arg(short)]
    pub y: Option<u32>,

    /// Crop anchor, e.g. center or northwest
    #[arg(long)]
    pub gravity: Option<Gravity>,

    /// Image composited over the result (play)
    #[arg(long)]
    pub overlay: Option<Overlay>,

    /// Output format: jpeg, png, webp or gif
    #[arg(short, long)]
    pub format: Option<ImageFormat>,

    /// Ignore cached copies and produce everything again
    #[arg(long)]
    pub force: bool,

    /// Output format
    #[arg(short, long, default_value = "text")]
    pub output: OutputFormat,
}

impl ResolveArgs {
    pub fn params(&self) -> TransformParams {
        TransformParams {
            width: self.width,
            height: self.height,
            x: self.x,
            y: self.y,
            quality: self.quality,
            gravity: self.gravity,
            overlay: self.overlay,
            format: self.format,
        }
    }
}

/// Arguments for the describe command
#[derive(Parser, Debug)]
pub struct DescribeArgs {
    /// Image file
    pub path: PathBuf,

    /// Bypass the metadata cache
    #[arg(long)]
    pub force: bool,

    /// Output format
    #[arg(short, long, default_value = "text")]
    pub output: OutputFormat,
}

/// Arguments for the sweep command
#[derive(Parser, Debug)]
pub struct SweepArgs {
    /// Keep sweeping at the configured interval until interrupted
    #[arg(short, long)]
    pub watch: bool,

    /// Output format
    #[arg(short, long, default_value = "text")]
    pub output: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

/// How results are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
}
