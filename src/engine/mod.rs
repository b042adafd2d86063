//! Image engine abstraction
//!
//! Pixel work and introspection happen in external executables. These traits
//! are the seam between the caches and whatever runs them: ImageMagick in
//! production, counting fakes in tests.

pub mod magick;
pub mod operation;

pub use magick::Magick;
pub use operation::{Gravity, Normalized, Operation, OutputFormat, Overlay, TransformParams};

use crate::error::MkimageResult;
use async_trait::async_trait;
use std::path::Path;

/// One transform to perform
#[derive(Debug, Clone, Copy)]
pub struct TransformJob<'a> {
    /// Source image
    pub src: &'a Path,
    /// Output file to create
    pub dst: &'a Path,
    pub operation: Operation,
    pub params: &'a Normalized,
}

/// Runs a transform, writing the result to `job.dst`
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, job: &TransformJob<'_>) -> MkimageResult<()>;
}

/// Describes an image file as a fixed-field text record
#[async_trait]
pub trait Introspector: Send + Sync {
    /// Exact invocation used for `path`; doubles as its cache key
    fn invocation(&self, path: &Path) -> String;

    /// Run the introspection and return its raw output
    ///
    /// The record is six newline-separated fields: format, bit depth,
    /// width, height, byte size, file name.
    async fn introspect(&self, path: &Path) -> MkimageResult<String>;
}
