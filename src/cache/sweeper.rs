//! Periodic reclamation of abandoned working files
//!
//! Producers that crash leave `.part` and `.lock` files in the working
//! tree. Anything there whose status last changed more than `ttl` ago is
//! assumed dead and deleted. Lock files are only deleted once nobody holds
//! them. Producers that legitimately run longer than `ttl` will lose their
//! working files, so `ttl` must exceed the slowest download or transform.

use crate::cache::lock::LockedFile;
use crate::cache::shard::LOCK_SUFFIX;
use crate::config::schema::SweepConfig;
use rand::Rng;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// Outcome of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    /// Files examined
    pub scanned: usize,
    /// Files deleted
    pub removed: usize,
    /// Entries that could not be examined or deleted
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct Sweeper {
    work_dir: PathBuf,
    ttl: Duration,
    interval: Duration,
}

impl Sweeper {
    /// Create a sweeper with a fixed interval
    pub fn new(work_dir: impl Into<PathBuf>, ttl: Duration, interval: Duration) -> Self {
        Self {
            work_dir: work_dir.into(),
            ttl,
            interval,
        }
    }

    /// Create a sweeper whose interval is drawn once from the configured range
    pub fn from_config(work_dir: impl Into<PathBuf>, config: &SweepConfig) -> Self {
        let (min, max) = config.interval_bounds();
        let secs = rand::rng().random_range(min.as_secs()..=max.as_secs());
        Self::new(work_dir, config.ttl(), Duration::from_secs(secs))
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Delete working files whose ctime is more than `ttl` before `now`
    ///
    /// A missing working directory is recreated rather than reported.
    pub fn sweep_once(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();

        if !self.work_dir.exists() {
            match fs::create_dir_all(&self.work_dir) {
                Ok(()) => debug!("Recreated working directory {}", self.work_dir.display()),
                Err(e) => {
                    warn!(
                        "Failed to recreate working directory {}: {}",
                        self.work_dir.display(),
                        e
                    );
                    report.errors += 1;
                }
            }
            return report;
        }

        self.sweep_tree(now, &mut report);

        if report.removed > 0 || report.errors > 0 {
            info!(
                "Swept {}: scanned {}, removed {}, errors {}",
                self.work_dir.display(),
                report.scanned,
                report.removed,
                report.errors
            );
        } else {
            debug!(
                "Swept {}: scanned {}, nothing to remove",
                self.work_dir.display(),
                report.scanned
            );
        }
        report
    }

    fn sweep_tree(&self, now: SystemTime, report: &mut SweepReport) {
        for entry in WalkDir::new(&self.work_dir).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                // Finished and cleaned up by its producer meanwhile
                Err(e) if is_not_found(&e) => continue,
                Err(e) => {
                    warn!("Failed to walk {}: {}", self.work_dir.display(), e);
                    report.errors += 1;
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }

            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) if is_not_found(&e) => continue,
                Err(e) => {
                    warn!("Failed to stat {}: {}", path.display(), e);
                    report.errors += 1;
                    continue;
                }
            };

            report.scanned += 1;
            if !self.is_expired(&metadata, now) {
                continue;
            }

            let is_lock = entry.file_name().to_string_lossy().ends_with(LOCK_SUFFIX);
            let removed = if is_lock {
                remove_lock(path)
            } else {
                remove_file(path)
            };
            match removed {
                Ok(true) => {
                    debug!("Removed stale working file {}", path.display());
                    report.removed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to remove {}: {}", path.display(), e);
                    report.errors += 1;
                }
            }
        }
    }

    fn is_expired(&self, metadata: &fs::Metadata, now: SystemTime) -> bool {
        let changed = status_changed(metadata);
        match now.duration_since(changed) {
            Ok(age) => age > self.ttl,
            // Changed after `now`
            Err(_) => false,
        }
    }

    /// Sweep forever, one pass every `interval`
    pub async fn run(self) {
        info!(
            "Sweeping {} every {}s (ttl {}s)",
            self.work_dir.display(),
            self.interval.as_secs(),
            self.ttl.as_secs()
        );

        loop {
            tokio::time::sleep(self.interval).await;

            let sweeper = self.clone();
            let pass = tokio::task::spawn_blocking(move || sweeper.sweep_once(SystemTime::now()));
            if let Err(e) = pass.await {
                warn!("Sweep pass panicked: {}", e);
            }
        }
    }

    /// Run the sweeper as a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// Delete a lock file unless a live producer holds it
fn remove_lock(path: &Path) -> io::Result<bool> {
    match LockedFile::try_reclaim(path)? {
        Some(lock) => lock.unlink_and_release().map(|()| true),
        None => {
            trace!("{} is held, keeping it", path.display());
            Ok(false)
        }
    }
}

fn remove_file(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn is_not_found(err: &walkdir::Error) -> bool {
    err.io_error()
        .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
}

/// Last status change time (ctime) of a file
fn status_changed(metadata: &fs::Metadata) -> SystemTime {
    let secs = metadata.ctime().max(0) as u64;
    let nanos = metadata.ctime_nsec().clamp(0, 999_999_999) as u32;
    UNIX_EPOCH + Duration::new(secs, nanos)
}
