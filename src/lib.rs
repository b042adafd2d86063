//! mkimage - image resizing proxy core
//!
//! Fetches remote images, transforms them with ImageMagick and keeps both
//! the downloads and the derived variants in a sharded on-disk cache that
//! many worker processes can share without a central lock manager.

pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod hosts;
pub mod metadata;
pub mod pipeline;

pub use error::{MkimageError, MkimageResult};
pub use pipeline::{ImageRequest, Resizer, Resolved};
