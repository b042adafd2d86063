//! Download tier: each remote URL is fetched at most once per key
//!
//! Racing workers (in this process or others sharing the cache volume)
//! converge on one producer through [`claim::acquire`]; everyone else waits
//! for the completed file to appear.

use crate::cache::claim::{self, Lookup};
use crate::cache::key::download_key;
use crate::cache::lock::RetryPolicy;
use crate::cache::shard::CacheLayout;
use crate::config::schema::FetchConfig;
use crate::error::{MkimageError, MkimageResult};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Streams a remote resource into a file
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Write the body of `url` into `dest`, returning the byte count
    ///
    /// Non-2xx responses and transport failures must be classified into
    /// `RemoteNotFound`, `RemoteTimeout`, `RemoteStatus` or `Remote`.
    async fn fetch(&self, url: &str, dest: File) -> MkimageResult<u64>;
}

/// HTTP(S) fetcher backed by a blocking `ureq` agent
///
/// Each download runs on tokio's blocking pool so slow peers never stall
/// the async workers.
#[derive(Clone)]
pub struct UreqFetcher {
    agent: ureq::Agent,
    user_agent: String,
}

impl UreqFetcher {
    pub fn new(timeout: Duration, user_agent: impl Into<String>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            user_agent: user_agent.into(),
        }
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(config.timeout(), config.user_agent.clone())
    }

    fn fetch_blocking(&self, url: &str, dest: File) -> MkimageResult<u64> {
        let mut response = self
            .agent
            .get(url)
            .header("User-Agent", &self.user_agent)
            .call()
            .map_err(|e| classify(url, e))?;

        let status = response.status().as_u16();
        info!("Response for {}: status {}", url, status);
        if !response.status().is_success() {
            return Err(status_error(url, status));
        }

        let mut reader = response.body_mut().as_reader();
        let mut writer = io::BufWriter::new(dest);
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(classify_read(url, e)),
            };
            writer
                .write_all(&buf[..n])
                .map_err(|e| MkimageError::io(format!("writing download of {}", url), e))?;
            total += n as u64;
        }

        let file = writer
            .into_inner()
            .map_err(|e| MkimageError::io(format!("flushing download of {}", url), e.into_error()))?;
        file.sync_all()
            .map_err(|e| MkimageError::io(format!("syncing download of {}", url), e))?;

        Ok(total)
    }
}

#[async_trait]
impl Fetcher for UreqFetcher {
    async fn fetch(&self, url: &str, dest: File) -> MkimageResult<u64> {
        let this = self.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || this.fetch_blocking(&url, dest))
            .await
            .map_err(|e| MkimageError::Internal(format!("download task failed: {}", e)))?
    }
}

pub(crate) fn status_error(url: &str, status: u16) -> MkimageError {
    match status {
        404 | 410 => MkimageError::RemoteNotFound {
            url: url.to_string(),
            reason: format!("http status {}", status),
        },
        _ => MkimageError::RemoteStatus {
            url: url.to_string(),
            status,
        },
    }
}

fn classify(url: &str, err: ureq::Error) -> MkimageError {
    match err {
        ureq::Error::StatusCode(status) => status_error(url, status),
        ureq::Error::HostNotFound => MkimageError::RemoteNotFound {
            url: url.to_string(),
            reason: "host not found".to_string(),
        },
        ureq::Error::Timeout(_) => MkimageError::RemoteTimeout {
            url: url.to_string(),
        },
        ureq::Error::Io(e) => classify_read(url, e),
        other => MkimageError::Remote {
            url: url.to_string(),
            reason: other.to_string(),
        },
    }
}

fn classify_read(url: &str, err: io::Error) -> MkimageError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => MkimageError::RemoteTimeout {
            url: url.to_string(),
        },
        _ => MkimageError::Remote {
            url: url.to_string(),
            reason: err.to_string(),
        },
    }
}

/// Content-addressed store of downloaded originals
pub struct DownloadCache {
    layout: CacheLayout,
    retry: RetryPolicy,
    fetcher: Arc<dyn Fetcher>,
}

impl DownloadCache {
    pub fn new(layout: CacheLayout, retry: RetryPolicy, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            layout,
            retry,
            fetcher,
        }
    }

    /// Where `url` is (or would be) cached
    pub fn cached_path(&self, url: &str) -> PathBuf {
        self.layout.cached_path(&download_key(url))
    }

    /// Return the cached copy of `url`, downloading it first if needed
    ///
    /// The flag is true when the file was already cached. A failed download
    /// leaves nothing at the cached path.
    pub async fn fetch(&self, url: &str, force: bool) -> MkimageResult<(PathBuf, bool)> {
        let key = download_key(url);

        let claim = match claim::acquire(&self.layout, &key, None, force, &self.retry).await? {
            Lookup::Hit(path) => {
                debug!(
                    "The file {} is already downloaded, skipping...",
                    path.display()
                );
                return Ok((path, true));
            }
            Lookup::Produce(claim) => claim,
        };

        debug!("Locked {}, starting download of {}", key, url);
        let dest = match OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(claim.working_path())
        {
            Ok(file) => file,
            Err(e) => {
                let context = format!("opening {}", claim.working_path().display());
                claim.abandon().await;
                return Err(MkimageError::io(context, e));
            }
        };

        match self.fetcher.fetch(url, dest).await {
            Ok(bytes) => {
                let path = claim.commit().await?;
                info!(
                    "Downloaded {} bytes from {}, saved to {}",
                    bytes,
                    url,
                    path.display()
                );
                Ok((path, false))
            }
            Err(e) => {
                debug!("Download of {} failed: {}", url, e);
                claim.abandon().await;
                Err(e)
            }
        }
    }

    /// Delete the cached copy of `url` under its production lock
    ///
    /// Waits for any in-flight producer of the key, so a download promoted
    /// meanwhile is never mistaken for the one being purged.
    pub async fn purge(&self, url: &str) -> MkimageResult<()> {
        let key = download_key(url);
        // Forced lookups always produce
        let Lookup::Produce(claim) =
            claim::acquire(&self.layout, &key, None, true, &self.retry).await?
        else {
            return Ok(());
        };

        let result = match tokio::fs::remove_file(claim.target_path()).await {
            Ok(()) => {
                debug!("Purged {}", claim.target_path().display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MkimageError::io(
                format!("removing {}", claim.target_path().display()),
                e,
            )),
        };
        claim.abandon().await;
        result
    }
}
