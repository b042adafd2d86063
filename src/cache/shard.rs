//! Sharded path derivation for the completed and working namespaces
//!
//! A key `abcdef` lands at `<root>/a/b/c/d/abcdef`, which bounds directory
//! fan-out without any bookkeeping.

use crate::error::{MkimageError, MkimageResult};
use std::path::{Path, PathBuf};

/// Number of single-character directory levels above each entry
pub const SHARD_DEPTH: usize = 4;

/// Suffix of files being produced in the working namespace
pub const WORKING_SUFFIX: &str = ".part";

/// Suffix of per-key production lock files
pub const LOCK_SUFFIX: &str = ".lock";

/// Map a key to `<root>/<k0>/<k1>/<k2>/<k3>/<key>`
///
/// Keys shorter than four characters get one level per character.
pub fn shard(root: &Path, key: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for c in key.chars().take(SHARD_DEPTH) {
        path.push(c.to_string());
    }
    path.push(key);
    path
}

/// The two on-disk namespaces: completed entries and in-progress work
#[derive(Debug, Clone)]
pub struct CacheLayout {
    cache_dir: PathBuf,
    work_dir: PathBuf,
}

impl CacheLayout {
    /// Create a layout, rejecting roots that overlap
    pub fn new(cache_dir: PathBuf, work_dir: PathBuf) -> MkimageResult<Self> {
        if cache_dir == work_dir {
            return Err(MkimageError::LayoutInvalid(format!(
                "cache_dir and work_dir are both {}",
                cache_dir.display()
            )));
        }
        if work_dir.starts_with(&cache_dir) || cache_dir.starts_with(&work_dir) {
            return Err(MkimageError::LayoutInvalid(format!(
                "{} and {} must not contain each other",
                cache_dir.display(),
                work_dir.display()
            )));
        }
        Ok(Self {
            cache_dir,
            work_dir,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Where the completed entry for `key` lives
    pub fn cached_path(&self, key: &str) -> PathBuf {
        shard(&self.cache_dir, key)
    }

    /// Where the producer of `key` writes before promotion
    ///
    /// `ext` (without the dot) is appended after the working suffix so
    /// external encoders can infer the output format from the name.
    pub fn working_path(&self, key: &str, ext: Option<&str>) -> PathBuf {
        let mut name = format!("{}{}", key, WORKING_SUFFIX);
        if let Some(ext) = ext {
            name.push('.');
            name.push_str(ext);
        }
        shard(&self.work_dir, key).with_file_name(name)
    }

    /// Lock file guarding production of `key`
    pub fn lock_path(&self, key: &str) -> PathBuf {
        shard(&self.work_dir, key).with_file_name(format!("{}{}", key, LOCK_SUFFIX))
    }
}
