//! Transform tier: one file per (source, operation, parameters) variant

use crate::cache::claim::{self, Lookup};
use crate::cache::key::transform_key;
use crate::cache::lock::RetryPolicy;
use crate::cache::shard::CacheLayout;
use crate::engine::{Normalized, Operation, TransformJob, Transformer};
use crate::error::MkimageResult;
use crate::metadata::{ImageInfo, MetadataCache};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Result of resolving one variant
#[derive(Debug, Clone)]
pub struct Variant {
    pub path: PathBuf,
    pub info: ImageInfo,
    /// True when the variant already existed
    pub hit: bool,
}

pub struct TransformCache {
    layout: CacheLayout,
    retry: RetryPolicy,
    transformer: Arc<dyn Transformer>,
    metadata: Arc<MetadataCache>,
}

impl TransformCache {
    pub fn new(
        layout: CacheLayout,
        retry: RetryPolicy,
        transformer: Arc<dyn Transformer>,
        metadata: Arc<MetadataCache>,
    ) -> Self {
        Self {
            layout,
            retry,
            transformer,
            metadata,
        }
    }

    /// Where the variant of `source` is (or would be) cached
    pub fn cached_path(&self, source: &Path, operation: Operation, params: &Normalized) -> PathBuf {
        self.layout
            .cached_path(&transform_key(source, operation, params))
    }

    /// Return the variant of `source`, producing it first if needed
    ///
    /// Concurrent callers asking for the same variant run the transformer
    /// once between them. On failure nothing is left at the cached path.
    pub async fn resolve(
        &self,
        source: &Path,
        operation: Operation,
        params: &Normalized,
        force: bool,
    ) -> MkimageResult<Variant> {
        let key = transform_key(source, operation, params);
        let ext = params.format.map(|f| f.extension());

        let claim = match claim::acquire(&self.layout, &key, ext, force, &self.retry).await? {
            Lookup::Hit(path) => {
                debug!("Variant {} already exists", path.display());
                let info = self.metadata.describe(&path, false).await?;
                return Ok(Variant {
                    path,
                    info,
                    hit: true,
                });
            }
            Lookup::Produce(claim) => claim,
        };

        let job = TransformJob {
            src: source,
            dst: claim.working_path(),
            operation,
            params,
        };

        let start = Instant::now();
        if let Err(e) = self.transformer.transform(&job).await {
            debug!("Transform {} failed: {}", key, e);
            claim.abandon().await;
            return Err(e);
        }

        let path = claim.commit().await?;
        info!(
            "Created {} from {} in {} ms",
            path.display(),
            source.display(),
            start.elapsed().as_millis()
        );

        // The file at this path is new; any memoized description is stale
        let info = self.metadata.describe(&path, true).await?;
        Ok(Variant {
            path,
            info,
            hit: false,
        })
    }
}

impl std::fmt::Debug for TransformCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformCache")
            .field("layout", &self.layout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
