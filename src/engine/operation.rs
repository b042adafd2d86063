//! Transform operations and their parameters
//!
//! Raw request parameters are normalized per operation before keying, so
//! two requests that mean the same thing share one cache entry.

use crate::error::{MkimageError, MkimageResult};
use std::fmt;
use std::str::FromStr;

/// What to do with a source image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Fit within width x height, keeping aspect ratio
    Resize,
    /// Resize to exactly width x height
    Stretch,
    /// Cut a width x height region at a gravity/offset
    Crop,
    /// Fill width x height, then center-crop the overflow
    Chop,
    /// Download and validate only
    Cache,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resize => "resize",
            Self::Stretch => "stretch",
            Self::Crop => "crop",
            Self::Chop => "chop",
            Self::Cache => "cache",
        }
    }

    /// Whether this operation produces a transformed variant
    pub fn transforms(&self) -> bool {
        !matches!(self, Self::Cache)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Operation {
    type Err = MkimageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "resize" => Ok(Self::Resize),
            "stretch" => Ok(Self::Stretch),
            "crop" => Ok(Self::Crop),
            "chop" => Ok(Self::Chop),
            "cache" => Ok(Self::Cache),
            other => Err(MkimageError::validation(format!(
                "Unknown operation '{}'. Valid operations: resize, stretch, crop, chop, cache",
                other
            ))),
        }
    }
}

/// Crop anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gravity {
    NorthWest,
    North,
    NorthEast,
    West,
    Center,
    East,
    SouthWest,
    South,
    SouthEast,
}

impl Gravity {
    /// Name as understood by ImageMagick's `-gravity`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NorthWest => "NorthWest",
            Self::North => "North",
            Self::NorthEast => "NorthEast",
            Self::West => "West",
            Self::Center => "Center",
            Self::East => "East",
            Self::SouthWest => "SouthWest",
            Self::South => "South",
            Self::SouthEast => "SouthEast",
        }
    }
}

impl fmt::Display for Gravity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Gravity {
    type Err = MkimageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            Self::NorthWest,
            Self::North,
            Self::NorthEast,
            Self::West,
            Self::Center,
            Self::East,
            Self::SouthWest,
            Self::South,
            Self::SouthEast,
        ];
        all.into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| MkimageError::validation(format!("Unknown gravity '{}'", s)))
    }
}

/// Image composited on top of the result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Overlay {
    /// Centered play button
    Play,
}

impl Overlay {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Play => "play",
        }
    }
}

impl FromStr for Overlay {
    type Err = MkimageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "play" => Ok(Self::Play),
            other => Err(MkimageError::validation(format!(
                "Unknown overlay '{}'. Valid overlays: play",
                other
            ))),
        }
    }
}

/// Output encoding, when it should differ from the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Jpeg,
    Png,
    Webp,
    Gif,
}

impl OutputFormat {
    /// File extension the encoder infers the format from
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Gif => "gif",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = MkimageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::Webp),
            "gif" => Ok(Self::Gif),
            other => Err(MkimageError::validation(format!(
                "Unsupported output format '{}'. Valid formats: jpg, png, webp, gif",
                other
            ))),
        }
    }
}

/// Transform parameters as they arrive with a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformParams {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub x: Option<u32>,
    pub y: Option<u32>,
    pub quality: Option<u8>,
    pub gravity: Option<Gravity>,
    pub overlay: Option<Overlay>,
    pub format: Option<OutputFormat>,
}

/// Parameters after defaults and per-operation rules are applied
///
/// A width or height of 0 means "unspecified".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
    pub quality: u8,
    /// Only set for crops
    pub gravity: Option<Gravity>,
    pub overlay: Option<Overlay>,
    pub format: Option<OutputFormat>,
}

impl TransformParams {
    /// Apply defaults and validate against `operation`
    pub fn normalize(&self, operation: Operation, default_quality: u8) -> MkimageResult<Normalized> {
        let quality = self.quality.unwrap_or(default_quality);
        if quality == 0 || quality > 100 {
            return Err(MkimageError::validation(format!(
                "quality must be between 1 and 100, got {}",
                quality
            )));
        }

        let mut width = self.width.unwrap_or(0);
        let mut height = self.height.unwrap_or(0);
        let mut gravity = None;

        match operation {
            Operation::Resize | Operation::Chop => {
                if width == 0 && height == 0 {
                    return Err(MkimageError::validation(
                        "one of width or height must be specified",
                    ));
                }
            }
            Operation::Stretch => {
                if width == 0 || height == 0 {
                    return Err(MkimageError::validation(
                        "both width and height must be specified, and must be greater than 0",
                    ));
                }
            }
            Operation::Crop => {
                if width == 0 {
                    return Err(MkimageError::validation("width must be specified for crop"));
                }
                if height == 0 {
                    height = width;
                }
                // A full offset pair is measured from the top-left corner
                let default = if self.x.is_some() && self.y.is_some() {
                    Gravity::NorthWest
                } else {
                    Gravity::Center
                };
                gravity = Some(self.gravity.unwrap_or(default));
            }
            Operation::Cache => {
                width = 0;
                height = 0;
            }
        }

        Ok(Normalized {
            width,
            height,
            x: self.x.unwrap_or(0),
            y: self.y.unwrap_or(0),
            quality,
            gravity,
            overlay: self.overlay,
            format: self.format,
        })
    }
}
