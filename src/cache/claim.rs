//! Consume-or-produce arbitration shared by both cache tiers
//!
//! Completed entries only ever appear in the cache tree by rename, so a file
//! at the cached path is whole. Producers serialize on a lock file in the
//! working tree and write to a `.part` file next to it, which is promoted
//! into place once complete.

use crate::cache::lock::{LockedFile, RetryPolicy};
use crate::cache::shard::CacheLayout;
use crate::error::{MkimageError, MkimageResult};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Outcome of arbitration for one key
#[derive(Debug)]
pub enum Lookup {
    /// A completed entry exists and is safe to serve
    Hit(PathBuf),
    /// The caller is now the sole producer of the entry
    Produce(Claim),
}

/// Exclusive right to produce one cache entry
///
/// Dropping a claim without calling [`Claim::commit`] or [`Claim::abandon`]
/// releases the lock but leaves the working file for the sweeper.
#[derive(Debug)]
pub struct Claim {
    key: String,
    lock: LockedFile,
    working: PathBuf,
    target: PathBuf,
}

impl Claim {
    /// File the producer writes to
    pub fn working_path(&self) -> &Path {
        &self.working
    }

    /// Where the entry will live once committed
    pub fn target_path(&self) -> &Path {
        &self.target
    }

    /// Promote the working file into the cache and release the lock
    ///
    /// If promotion fails the claim is abandoned, so the entry stays absent.
    pub async fn commit(self) -> MkimageResult<PathBuf> {
        if let Err(e) = promote(&self.working, &self.target).await {
            self.abandon().await;
            return Err(e);
        }
        debug!("Promoted {} to {}", self.working.display(), self.target.display());

        if let Err(e) = self.lock.unlink_and_release() {
            warn!("Failed to remove lock file for {}: {}", self.key, e);
        }
        Ok(self.target)
    }

    /// Delete whatever was produced and release the lock
    pub async fn abandon(self) {
        match fs::remove_file(&self.working).await {
            Ok(()) => debug!("Removed partial file {}", self.working.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove partial file {}: {}",
                self.working.display(),
                e
            ),
        }

        if let Err(e) = self.lock.unlink_and_release() {
            warn!("Failed to remove lock file for {}: {}", self.key, e);
        }
    }
}

/// Either find a completed entry for `key` or become its producer
///
/// With `force`, existing entries are ignored and the caller always ends up
/// producing (after any in-flight producer finishes). Contention is retried
/// under `retry` and surfaces as [`MkimageError::LockTimeout`] once its
/// deadline passes.
pub async fn acquire(
    layout: &CacheLayout,
    key: &str,
    ext: Option<&str>,
    force: bool,
    retry: &RetryPolicy,
) -> MkimageResult<Lookup> {
    let target = layout.cached_path(key);
    let lock_path = layout.lock_path(key);
    let working = layout.working_path(key, ext);
    let mut backoff = retry.start();

    loop {
        if !force && exists(&target).await? {
            match LockedFile::probe_shared(&target)
                .map_err(|e| MkimageError::io(format!("opening {}", target.display()), e))?
            {
                Some(_reader) => {
                    trace!("Cache hit for {}", key);
                    return Ok(Lookup::Hit(target));
                }
                None => {
                    backoff.wait(&target).await?;
                    continue;
                }
            }
        }

        ensure_parent(&lock_path).await?;
        let lock = match LockedFile::try_exclusive(&lock_path) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                backoff.wait(&lock_path).await?;
                continue;
            }
            Err(e) => {
                return Err(MkimageError::io(
                    format!("locking {}", lock_path.display()),
                    e,
                ))
            }
        };

        // Someone finished between our existence check and taking the lock.
        if !force && exists(&target).await? {
            let _ = lock.unlink_and_release();
            continue;
        }

        // Leftovers from a producer that died mid-write
        match fs::remove_file(&working).await {
            Ok(()) => debug!("Discarded stale partial file {}", working.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(MkimageError::io(
                    format!("clearing {}", working.display()),
                    e,
                ))
            }
        }

        debug!("Claimed production of {} after {} retries", key, backoff.attempts());
        return Ok(Lookup::Produce(Claim {
            key: key.to_string(),
            lock,
            working,
            target,
        }));
    }
}

/// Atomically move a finished working file to its cached path
///
/// Within one filesystem this is a rename. Across filesystems the file is
/// copied to a hidden sibling of the target and renamed from there, so the
/// target still appears in one step.
pub async fn promote(working: &Path, target: &Path) -> MkimageResult<()> {
    ensure_parent(target).await?;

    match fs::rename(working, target).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => copy_across(working, target).await,
        Err(e) => Err(MkimageError::io(
            format!("renaming {} to {}", working.display(), target.display()),
            e,
        )),
    }
}

async fn copy_across(working: &Path, target: &Path) -> MkimageResult<()> {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = target.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()));

    debug!(
        "Copying {} across filesystems via {}",
        working.display(),
        staging.display()
    );

    let result = async {
        fs::copy(working, &staging).await?;
        fs::File::open(&staging).await?.sync_all().await?;
        fs::rename(&staging, target).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&staging).await;
        return Err(MkimageError::io(
            format!("copying {} to {}", working.display(), target.display()),
            e,
        ));
    }

    fs::remove_file(working)
        .await
        .map_err(|e| MkimageError::io(format!("removing {}", working.display()), e))
}

/// Create the parent directory of `path`
pub async fn ensure_parent(path: &Path) -> MkimageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| MkimageError::io(format!("creating directory {}", parent.display()), e))?;
    }
    Ok(())
}

async fn exists(path: &Path) -> MkimageResult<bool> {
    fs::try_exists(path)
        .await
        .map_err(|e| MkimageError::io(format!("checking {}", path.display()), e))
}
