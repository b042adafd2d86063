//! ImageMagick-backed engine
//!
//! Commands are spawned directly with argument vectors (no shell), so paths
//! and parameters never need quoting.

use crate::config::schema::TransformConfig;
use crate::engine::operation::{Gravity, Normalized, Operation, OutputFormat, Overlay};
use crate::engine::{Introspector, TransformJob, Transformer};
use crate::error::{MkimageError, MkimageResult};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, trace};

/// `%m` format, `%z` depth, `%w` width, `%h` height, `%b` size, `%f` name
const IDENTIFY_FORMAT: &str = "%m\n%z\n%w\n%h\n%b\n%f";

/// ImageMagick command-line tools
#[derive(Debug, Clone)]
pub struct Magick {
    magick_bin: String,
    composite_bin: String,
    identify_bin: String,
    play_button: PathBuf,
}

impl Magick {
    pub fn new(config: &TransformConfig) -> Self {
        Self {
            magick_bin: config.magick_bin.clone(),
            composite_bin: config.composite_bin.clone(),
            identify_bin: config.identify_bin.clone(),
            play_button: config.play_button.clone(),
        }
    }

    /// Arguments for the main `magick` invocation of a job
    fn convert_args(job: &TransformJob<'_>) -> MkimageResult<Vec<OsString>> {
        let p = job.params;
        let mut args: Vec<OsString> = vec![
            job.src.into(),
            "-interlace".into(),
            "Plane".into(),
        ];

        match job.operation {
            Operation::Resize => {
                args.push("-resize".into());
                args.push(geometry(p.width, p.height).into());
            }
            Operation::Stretch => {
                args.push("-resize".into());
                args.push(format!("{}!", geometry(p.width, p.height)).into());
            }
            Operation::Chop => {
                let size = geometry(p.width, p.height);
                args.push("-resize".into());
                args.push(format!("{}^", size).into());
                args.push("-gravity".into());
                args.push("center".into());
                args.push("-crop".into());
                args.push(format!("{}+0+0", size).into());
            }
            Operation::Crop => {
                let gravity = p.gravity.unwrap_or(Gravity::Center);
                args.push("-gravity".into());
                args.push(gravity.as_str().into());
                args.push("-crop".into());
                args.push(format!("{}+{}+{}", geometry(p.width, p.height), p.x, p.y).into());
            }
            Operation::Cache => {
                return Err(MkimageError::validation(
                    "the cache operation does not transform images",
                ))
            }
        }

        args.push("-quality".into());
        args.push(p.quality.to_string().into());

        if p.format == Some(OutputFormat::Webp) {
            args.push("-define".into());
            args.push("webp:lossless=false".into());
        }

        args.push(job.dst.into());
        Ok(args)
    }

    /// Arguments compositing the overlay onto `dst` in place
    fn overlay_args(&self, overlay: Overlay, dst: &Path) -> Vec<OsString> {
        let image = match overlay {
            Overlay::Play => &self.play_button,
        };
        vec![
            "-gravity".into(),
            "center".into(),
            "-background".into(),
            "none".into(),
            image.into(),
            dst.into(),
            dst.into(),
        ]
    }

    fn identify_args(path: &Path) -> Vec<OsString> {
        vec![
            "-quiet".into(),
            "-precision".into(),
            "16".into(),
            "-format".into(),
            IDENTIFY_FORMAT.into(),
            path.into(),
        ]
    }

    /// Execute a command and return its stdout, failing on non-zero exit
    async fn exec(&self, program: &str, args: &[OsString]) -> MkimageResult<String> {
        let command = display_command(program, args);
        debug!("Executing: {}", command);
        let start = Instant::now();

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| MkimageError::command_failed(command.clone(), e))?;

        trace!("Executed: {}, took: {} ms", command, start.elapsed().as_millis());

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MkimageError::command_exec(command, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Transformer for Magick {
    async fn transform(&self, job: &TransformJob<'_>) -> MkimageResult<()> {
        let args = Self::convert_args(job)?;
        self.exec(&self.magick_bin, &args).await?;

        if let Some(overlay) = job.params.overlay {
            let args = self.overlay_args(overlay, job.dst);
            self.exec(&self.composite_bin, &args).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Introspector for Magick {
    fn invocation(&self, path: &Path) -> String {
        display_command(&self.identify_bin, &Self::identify_args(path))
    }

    async fn introspect(&self, path: &Path) -> MkimageResult<String> {
        let args = Self::identify_args(path);
        let command = display_command(&self.identify_bin, &args);

        let output = Command::new(&self.identify_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| MkimageError::command_failed(command.clone(), e))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || stderr.starts_with("identify:") {
            return Err(MkimageError::command_exec(command, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// `WxH` with unspecified (zero) sides left empty, as ImageMagick expects
fn geometry(width: u32, height: u32) -> String {
    let side = |v: u32| if v == 0 { String::new() } else { v.to_string() };
    format!("{}x{}", side(width), side(height))
}

/// Human-readable command line, newlines escaped
fn display_command(program: &str, args: &[OsString]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.to_string_lossy().replace('\n', "\\n"));
    }
    line
}
