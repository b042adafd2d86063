//! Configuration schema for mkimage
//!
//! Configuration is stored at `~/.config/mkimage/config.toml`

use crate::cache::{CacheLayout, RetryPolicy};
use crate::error::MkimageResult;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Disk cache settings
    pub cache: CacheConfig,

    /// Remote fetch settings
    pub fetch: FetchConfig,

    /// External transform settings
    pub transform: TransformConfig,

    /// Introspection result cache
    pub metadata: MetadataConfig,

    /// Working-file sweeper
    pub sweep: SweepConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

/// Disk cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root of the completed-entry tree
    pub cache_dir: PathBuf,

    /// Root of the in-progress tree (must not overlap `cache_dir`)
    pub work_dir: PathBuf,

    /// Treat every request as forced, bypassing cache hits
    pub disable_cache: bool,

    /// Give up on a contended entry after this many seconds
    pub lock_timeout_secs: u64,

    /// Pause between lock attempts in milliseconds
    pub lock_retry_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let base = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("mkimage");
        Self {
            cache_dir: base.join("cache"),
            work_dir: base.join("work"),
            disable_cache: false,
            lock_timeout_secs: 60,
            lock_retry_delay_ms: 10,
        }
    }
}

impl CacheConfig {
    /// Build the on-disk layout for the two namespaces
    pub fn layout(&self) -> MkimageResult<CacheLayout> {
        CacheLayout::new(self.cache_dir.clone(), self.work_dir.clone())
    }

    /// Retry policy applied to lock contention
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.lock_timeout_secs),
            Duration::from_millis(self.lock_retry_delay_ms),
        )
    }
}

/// Remote fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Overall timeout for a single download, in seconds
    pub timeout_secs: u64,

    /// User-Agent header sent upstream
    pub user_agent: String,

    /// Glob patterns of hostnames images may be fetched from
    pub allowed_hosts: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: format!("mkimage/{}", env!("CARGO_PKG_VERSION")),
            allowed_hosts: vec![],
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// External transform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Quality used when a request doesn't specify one
    pub default_quality: u8,

    /// ImageMagick convert binary
    pub magick_bin: String,

    /// ImageMagick composite binary (overlays)
    pub composite_bin: String,

    /// ImageMagick identify binary (introspection)
    pub identify_bin: String,

    /// Image composited on top for the `play` overlay
    pub play_button: PathBuf,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            default_quality: 69,
            magick_bin: "magick".to_string(),
            composite_bin: "composite".to_string(),
            identify_bin: "identify".to_string(),
            play_button: PathBuf::from("public/play-button.svg"),
        }
    }
}

/// Introspection cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Maximum number of cached introspection results
    pub capacity: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self { capacity: 10240 }
    }
}

/// Sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Working files older than this are considered abandoned
    pub ttl_secs: u64,

    /// Lower bound of the randomized sweep interval
    pub interval_min_secs: u64,

    /// Upper bound of the randomized sweep interval
    pub interval_max_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            interval_min_secs: 300,
            interval_max_secs: 600,
        }
    }
}

impl SweepConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Interval bounds, swapped into order if configured backwards
    pub fn interval_bounds(&self) -> (Duration, Duration) {
        let (lo, hi) = if self.interval_min_secs <= self.interval_max_secs {
            (self.interval_min_secs, self.interval_max_secs)
        } else {
            (self.interval_max_secs, self.interval_min_secs)
        };
        (Duration::from_secs(lo), Duration::from_secs(hi))
    }
}
