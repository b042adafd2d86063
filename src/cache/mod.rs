//! Two-tier on-disk image cache
//!
//! Downloads and transformed variants share one layout: completed entries
//! under the cache root, in-progress files and lock files under a separate
//! working root. Both trees are sharded four levels deep by key.
//!
//! # Entry Lifecycle
//!
//! | State | Location | Visible to readers |
//! |-------|----------|--------------------|
//! | Producing | `<work>/k0/k1/k2/k3/<key>.part` | no |
//! | Complete | `<cache>/k0/k1/k2/k3/<key>` | yes |
//! | Abandoned | working tree, until swept | no |
//!
//! Promotion from producing to complete is a single rename, so readers
//! never observe a partially written entry.

pub mod claim;
pub mod download;
pub mod key;
pub mod lock;
pub mod shard;
pub mod sweeper;
pub mod transform;

pub use claim::{Claim, Lookup};
pub use download::{DownloadCache, Fetcher, UreqFetcher};
pub use key::{download_key, transform_key};
pub use lock::{LockMode, LockedFile, RetryPolicy};
pub use shard::{shard, CacheLayout};
pub use sweeper::{SweepReport, Sweeper};
pub use transform::{TransformCache, Variant};
