//! Cross-process advisory locking on cache files
//!
//! Locks are `flock(2)` locks bound to an open file description. They are
//! released when the last descriptor referring to it is closed, which
//! happens when the [`LockedFile`] (and any clones of its handle) drop.
//! Contention is reported as `Ok(None)`, never as an error.

use crate::error::{MkimageError, MkimageResult};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::trace;

/// Lock mode held by a [`LockedFile`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many readers
    Shared,
    /// One writer
    Exclusive,
}

/// An open file holding an advisory lock
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl LockedFile {
    /// Consume protocol: open an existing entry and probe for a shared lock
    ///
    /// `Ok(None)` means a writer holds the entry, or the entry vanished
    /// between the caller's existence check and the open. Either way the
    /// caller should retry from scratch.
    pub fn probe_shared(path: &Path) -> io::Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        if !try_flock(&file, libc::LOCK_SH | libc::LOCK_NB)? {
            trace!("{} is locked by a writer", path.display());
            return Ok(None);
        }

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
            mode: LockMode::Shared,
        }))
    }

    /// Produce protocol: create or open `path` and try to take it exclusively
    ///
    /// On success the caller is the only holder among processes honouring
    /// the protocol, and `path` is verified to still name the locked inode.
    /// The file is rewritten with our pid, so its ctime marks the start of
    /// this claim.
    pub fn try_exclusive(path: &Path) -> io::Result<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let Some(mut locked) = Self::lock_exclusive(file, path)? else {
            return Ok(None);
        };
        locked.stamp()?;
        Ok(Some(locked))
    }

    /// Take an existing file exclusively without creating it
    ///
    /// Used to delete leftover lock files: `Ok(None)` means the file is
    /// gone or someone still holds it.
    pub fn try_reclaim(path: &Path) -> io::Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        Self::lock_exclusive(file, path)
    }

    fn lock_exclusive(file: File, path: &Path) -> io::Result<Option<Self>> {
        if !try_flock(&file, libc::LOCK_EX | libc::LOCK_NB)? {
            trace!("{} is held by someone else", path.display());
            return Ok(None);
        }

        // A previous holder may have unlinked the lock file between our open
        // and our flock, leaving us holding an orphaned inode.
        if !still_names(path, &file)? {
            trace!("{} was replaced while we locked it", path.display());
            return Ok(None);
        }

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
            mode: LockMode::Exclusive,
        }))
    }

    fn stamp(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{}", std::process::id())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Remove the locked path, then release the lock by closing
    ///
    /// Unlinking first means a peer that opened the old inode will fail the
    /// inode check in [`LockedFile::try_exclusive`] and retry.
    pub fn unlink_and_release(self) -> io::Result<()> {
        let result = match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        };
        drop(self);
        result
    }
}

/// Whether `path` still refers to the inode open in `file`
fn still_names(path: &Path, file: &File) -> io::Result<bool> {
    let ours = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(current.dev() == ours.dev() && current.ino() == ours.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Non-blocking flock; `Ok(false)` on contention
fn try_flock(file: &File, operation: libc::c_int) -> io::Result<bool> {
    // SAFETY: the descriptor is owned by `file` and valid for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Bound on how long a caller keeps retrying a contended entry
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total time allowed across all attempts
    pub timeout: Duration,
    /// Pause between attempts, after yielding to the scheduler
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, delay: Duration) -> Self {
        Self { timeout, delay }
    }

    /// Start tracking attempts against this policy
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            started: Instant::now(),
            attempts: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_millis(10))
    }
}

/// Per-operation retry state
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    started: Instant,
    attempts: u32,
}

impl Backoff {
    /// Wait before the next attempt, or fail once the deadline has passed
    pub async fn wait(&mut self, path: &Path) -> MkimageResult<()> {
        self.attempts += 1;
        if self.started.elapsed() >= self.policy.timeout {
            return Err(MkimageError::LockTimeout {
                path: path.to_path_buf(),
                attempts: self.attempts,
            });
        }

        tokio::task::yield_now().await;
        if !self.policy.delay.is_zero() {
            tokio::time::sleep(self.policy.delay).await;
        }
        Ok(())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn shared_probe_on_missing_file_is_contention() {
        let dir = TempDir::new().unwrap();
        let probe = LockedFile::probe_shared(&dir.path().join("missing")).unwrap();
        assert!(probe.is_none());
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry");
        std::fs::write(&path, b"done").unwrap();

        let a = LockedFile::probe_shared(&path).unwrap();
        let b = LockedFile::probe_shared(&path).unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
        assert_eq!(a.unwrap().mode(), LockMode::Shared);
    }

    #[test]
    fn exclusive_blocks_shared_and_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");

        let held = LockedFile::try_exclusive(&path).unwrap().unwrap();
        assert_eq!(held.mode(), LockMode::Exclusive);

        assert!(LockedFile::try_exclusive(&path).unwrap().is_none());
        assert!(LockedFile::probe_shared(&path).unwrap().is_none());

        drop(held);
        assert!(LockedFile::try_exclusive(&path).unwrap().is_some());
    }

    #[test]
    fn shared_holder_blocks_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry");
        std::fs::write(&path, b"done").unwrap();

        let reader = LockedFile::probe_shared(&path).unwrap().unwrap();
        assert!(LockedFile::try_exclusive(&path).unwrap().is_none());
        drop(reader);
        assert!(LockedFile::try_exclusive(&path).unwrap().is_some());
    }

    #[test]
    fn unlink_and_release_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");

        let held = LockedFile::try_exclusive(&path).unwrap().unwrap();
        held.unlink_and_release().unwrap();

        assert!(!path.exists());
        assert!(LockedFile::try_exclusive(&path).unwrap().is_some());
    }

    #[test]
    fn exclusive_claim_restamps_leftover_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        std::fs::write(&path, b"left behind by a crashed producer").unwrap();
        let before = std::fs::metadata(&path).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let held = LockedFile::try_exclusive(&path).unwrap().unwrap();
        let after = std::fs::metadata(&path).unwrap();

        assert!(
            (after.ctime(), after.ctime_nsec()) > (before.ctime(), before.ctime_nsec()),
            "ctime was not refreshed"
        );
        let contents = std::fs::read_to_string(held.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn reclaim_respects_holder_and_never_creates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");

        assert!(LockedFile::try_reclaim(&path).unwrap().is_none());
        assert!(!path.exists());

        let held = LockedFile::try_exclusive(&path).unwrap().unwrap();
        assert!(LockedFile::try_reclaim(&path).unwrap().is_none());

        drop(held);
        let reclaimed = LockedFile::try_reclaim(&path).unwrap().unwrap();
        assert_eq!(reclaimed.mode(), LockMode::Exclusive);
    }

    #[test]
    fn replaced_path_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");

        // A peer that opened the old inode before the holder unlinked it.
        let held = LockedFile::try_exclusive(&path).unwrap().unwrap();
        let stale = File::open(&path).unwrap();
        assert!(still_names(&path, &stale).unwrap());

        held.unlink_and_release().unwrap();
        assert!(!still_names(&path, &stale).unwrap());

        std::fs::write(&path, b"").unwrap();
        assert!(!still_names(&path, &stale).unwrap());
    }

    #[tokio::test]
    async fn backoff_times_out() {
        let policy = RetryPolicy::new(Duration::from_millis(20), Duration::from_millis(5));
        let mut backoff = policy.start();
        let path = PathBuf::from("/tmp/contended");

        let err = loop {
            if let Err(e) = backoff.wait(&path).await {
                break e;
            }
        };

        match err {
            MkimageError::LockTimeout { path: p, attempts } => {
                assert_eq!(p, path);
                assert!(attempts >= 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn backoff_allows_retries_within_deadline() {
        let policy = RetryPolicy::new(Duration::from_secs(5), Duration::ZERO);
        let mut backoff = policy.start();
        for _ in 0..3 {
            backoff.wait(Path::new("/tmp/x")).await.unwrap();
        }
        assert_eq!(backoff.attempts(), 3);
    }
}
