//! Image metadata cache
//!
//! Introspection spawns a process per call, so results are memoized in a
//! bounded LRU keyed by the exact invocation string.

use crate::engine::Introspector;
use crate::error::{MkimageError, MkimageResult};
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Basic facts about an image file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    /// Image type as reported by the engine, e.g. `JPEG`
    pub format: String,
    /// Bits per channel
    pub depth: u32,
    pub width: u32,
    pub height: u32,
    /// File size in bytes
    pub size: u64,
    /// File name as reported by the engine
    pub name: String,
}

impl ImageInfo {
    /// Parse the six-line record produced by an [`Introspector`]
    pub fn parse(output: &str) -> Result<Self, String> {
        if output.trim().is_empty() {
            return Err("empty output".to_string());
        }

        let mut lines = output.lines();
        let mut field = |name: &str| {
            lines
                .next()
                .map(str::trim)
                .ok_or_else(|| format!("missing {} field", name))
        };

        let format = field("format")?.to_string();
        let depth = leading_number(field("depth")?, "depth")?;
        let width = leading_number(field("width")?, "width")?;
        let height = leading_number(field("height")?, "height")?;
        let size = parse_size(field("size")?)?;
        let name = field("name")?.to_string();

        if format.is_empty() {
            return Err("empty format field".to_string());
        }

        Ok(Self {
            format,
            depth,
            width,
            height,
            size,
            name,
        })
    }
}

/// Digits at the start of `value`; anything after them is ignored
fn leading_number<T: FromStr>(value: &str, name: &str) -> Result<T, String> {
    let end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    value[..end]
        .parse()
        .map_err(|_| format!("invalid {} field: {:?}", name, value))
}

/// Byte count from ImageMagick's `%b`, e.g. `812B`, `12.345KB` or `1.5MiB`
///
/// Decimal prefixes scale by 1000 and binary (`Ki`, `Mi`, ...) by 1024.
fn parse_size(value: &str) -> Result<u64, String> {
    let invalid = || format!("invalid size field: {:?}", value);

    let end = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(end);
    let number: f64 = number.parse().map_err(|_| invalid())?;

    let unit = unit.trim();
    let unit = unit.strip_suffix('B').unwrap_or(unit);
    let (prefix, base) = match unit.strip_suffix('i') {
        Some(prefix) => (prefix, 1024f64),
        None => (unit, 1000f64),
    };
    let power = match prefix {
        "" => 0,
        "K" | "k" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        "E" => 6,
        _ => return Err(invalid()),
    };

    Ok((number * base.powi(power)).round() as u64)
}

/// LRU-backed front for an [`Introspector`]
pub struct MetadataCache {
    introspector: Arc<dyn Introspector>,
    entries: Mutex<LruCache<String, ImageInfo>>,
}

impl MetadataCache {
    /// `capacity` is clamped to at least one entry
    pub fn new(introspector: Arc<dyn Introspector>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            introspector,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Describe `path`, serving from the cache unless `force` is set
    ///
    /// A forced lookup still stores its fresh result. Failures are never
    /// cached.
    pub async fn describe(&self, path: &Path, force: bool) -> MkimageResult<ImageInfo> {
        let invocation = self.introspector.invocation(path);

        if !force {
            if let Some(info) = self.lookup(&invocation) {
                trace!("Metadata cache hit for {}", path.display());
                return Ok(info);
            }
        }

        let output = self.introspector.introspect(path).await?;
        let info = ImageInfo::parse(&output).map_err(|reason| MkimageError::MalformedOutput {
            command: invocation.clone(),
            reason,
        })?;

        debug!(
            "Identified {}: {} {}x{}",
            path.display(),
            info.format,
            info.width,
            info.height
        );
        self.store(invocation, info.clone());
        Ok(info)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().map(|e| e.cap().get()).unwrap_or(0)
    }

    fn lookup(&self, invocation: &str) -> Option<ImageInfo> {
        let mut entries = self.entries.lock().ok()?;
        entries.get(invocation).cloned()
    }

    fn store(&self, invocation: String, info: ImageInfo) {
        // A poisoned map only loses memoization
        if let Ok(mut entries) = self.entries.lock() {
            if let Some((evicted, _)) = entries.push(invocation.clone(), info) {
                if evicted != invocation {
                    trace!("Evicted metadata for {}", evicted);
                }
            }
        }
    }
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
