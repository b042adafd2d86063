//! Request pipeline
//!
//! host check -> download tier -> transform tier -> metadata, with the
//! `cache` operation stopping after the download and validating it.

use crate::cache::{DownloadCache, Fetcher, TransformCache, UreqFetcher};
use crate::config::Config;
use crate::engine::{Introspector, Magick, Operation, TransformParams, Transformer};
use crate::error::{MkimageError, MkimageResult};
use crate::hosts::HostPolicy;
use crate::metadata::{ImageInfo, MetadataCache};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use url::{ParseError, Url};

/// One image request as received from the outer layer
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub url: String,
    pub operation: Operation,
    pub params: TransformParams,
    pub force: bool,
}

impl ImageRequest {
    pub fn new(url: impl Into<String>, operation: Operation) -> Self {
        Self {
            url: url.into(),
            operation,
            params: TransformParams::default(),
            force: false,
        }
    }

    pub fn with_params(mut self, params: TransformParams) -> Self {
        self.params = params;
        self
    }

    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// File to serve for a request, with what the caches did to produce it
#[derive(Debug, Clone, Serialize)]
pub struct Resolved {
    pub path: PathBuf,
    pub info: ImageInfo,
    pub download_hit: bool,
    /// Always false for the `cache` operation
    pub transform_hit: bool,
}

/// Resolves image requests against the two cache tiers
pub struct Resizer {
    downloads: DownloadCache,
    transforms: TransformCache,
    metadata: Arc<MetadataCache>,
    hosts: HostPolicy,
    default_quality: u8,
    disable_cache: bool,
}

impl Resizer {
    /// Build a resizer around the given collaborators
    pub fn new(
        config: &Config,
        fetcher: Arc<dyn Fetcher>,
        transformer: Arc<dyn Transformer>,
        introspector: Arc<dyn Introspector>,
    ) -> MkimageResult<Self> {
        let layout = config.cache.layout()?;
        let retry = config.cache.retry_policy();
        let metadata = Arc::new(MetadataCache::new(introspector, config.metadata.capacity));
        let hosts = HostPolicy::new(&config.fetch.allowed_hosts);
        if hosts.is_empty() {
            warn!("fetch.allowed_hosts is empty, every request will be rejected");
        }

        Ok(Self {
            downloads: DownloadCache::new(layout.clone(), retry, fetcher),
            transforms: TransformCache::new(layout, retry, transformer, metadata.clone()),
            metadata,
            hosts,
            default_quality: config.transform.default_quality,
            disable_cache: config.cache.disable_cache,
        })
    }

    /// Build a resizer backed by HTTP and ImageMagick
    pub fn from_config(config: &Config) -> MkimageResult<Self> {
        let magick = Arc::new(Magick::new(&config.transform));
        Self::new(
            config,
            Arc::new(UreqFetcher::from_config(&config.fetch)),
            magick.clone(),
            magick,
        )
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    pub async fn process(&self, request: &ImageRequest) -> MkimageResult<Resolved> {
        self.resolve(
            &request.url,
            request.operation,
            &request.params,
            request.force,
        )
        .await
    }

    /// Produce (or find) the file answering a request
    pub async fn resolve(
        &self,
        url: &str,
        operation: Operation,
        params: &TransformParams,
        force: bool,
    ) -> MkimageResult<Resolved> {
        let url = self.check_url(url)?;
        let params = params.normalize(operation, self.default_quality)?;

        let force = force || self.disable_cache;
        if force {
            trace!("Forced request, ignoring cached copies of {}", url);
        }

        let (source, download_hit) = self.downloads.fetch(&url, force).await?;

        if !operation.transforms() {
            let info = self.validate_download(&url, &source, force).await?;
            return Ok(Resolved {
                path: source,
                info,
                download_hit,
                transform_hit: false,
            });
        }

        let variant = self
            .transforms
            .resolve(&source, operation, &params, force)
            .await?;
        debug!(
            "Resolved {} ({}) to {}, download {}, transform {}",
            url,
            operation,
            variant.path.display(),
            hit_or_miss(download_hit),
            hit_or_miss(variant.hit)
        );

        Ok(Resolved {
            path: variant.path,
            info: variant.info,
            download_hit,
            transform_hit: variant.hit,
        })
    }

    /// Normalize `url` and make sure its host is allow-listed
    pub fn check_url(&self, url: &str) -> MkimageResult<String> {
        let url = url.trim();
        if url.is_empty() {
            return Err(MkimageError::validation("missing a \"url\" parameter"));
        }

        let (url, parsed) = match Url::parse(url) {
            Ok(parsed) => (url.to_string(), parsed),
            Err(ParseError::RelativeUrlWithoutBase) => {
                let url = format!("http://{}", url);
                let parsed = Url::parse(&url).map_err(|e| invalid_url(&url, e))?;
                (url, parsed)
            }
            Err(e) => return Err(invalid_url(url, e)),
        };
        let hostname = parsed.host_str().unwrap_or_default();

        if !self.hosts.allowed(hostname) {
            return Err(MkimageError::HostNotAllowed(hostname.to_string()));
        }
        Ok(url)
    }

    /// Describe a downloaded file, purging it from the cache if it is not an image
    async fn validate_download(
        &self,
        url: &str,
        path: &Path,
        force: bool,
    ) -> MkimageResult<ImageInfo> {
        match self.metadata.describe(path, force).await {
            Ok(info) => Ok(info),
            Err(e) => {
                warn!("Removing invalid download {}: {}", path.display(), e);
                if let Err(rm) = self.downloads.purge(url).await {
                    warn!("Failed to remove {}: {}", path.display(), rm);
                }
                Err(MkimageError::InvalidImage {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

impl std::fmt::Debug for Resizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resizer")
            .field("hosts", &self.hosts)
            .field("default_quality", &self.default_quality)
            .field("disable_cache", &self.disable_cache)
            .finish_non_exhaustive()
    }
}

fn invalid_url(url: &str, err: ParseError) -> MkimageError {
    MkimageError::validation(format!("invalid url {}: {}", url, err))
}

fn hit_or_miss(hit: bool) -> &'static str {
    if hit {
        "hit"
    } else {
        "miss"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::download::status_error;
    use crate::config::schema::CacheConfig;
    use crate::engine::TransformJob;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FakeFetcher {
        calls: AtomicUsize,
        body: &'static [u8],
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, url: &str, mut dest: std::fs::File) -> MkimageResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if url.ends_with("/missing.jpg") {
                return Err(status_error(url, 404));
            }
            dest.write_all(self.body).unwrap();
            Ok(self.body.len() as u64)
        }
    }

    #[derive(Default)]
    struct FakeTransformer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transformer for FakeTransformer {
        async fn transform(&self, job: &TransformJob<'_>) -> MkimageResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::copy(job.src, job.dst).unwrap();
            Ok(())
        }
    }

    /// Accepts files whose content starts with "IMG"
    struct FakeIntrospector;

    #[async_trait]
    impl Introspector for FakeIntrospector {
        fn invocation(&self, path: &Path) -> String {
            format!("identify {}", path.display())
        }

        async fn introspect(&self, path: &Path) -> MkimageResult<String> {
            let body = std::fs::read(path).unwrap_or_default();
            if !body.starts_with(b"IMG") {
                return Err(MkimageError::command_exec(
                    self.invocation(path),
                    "identify: no decode delegate for this image format",
                ));
            }
            Ok(format!("JPEG\n8\n4\n3\n{}B\nimg", body.len()))
        }
    }

    struct Fixture {
        _dir: TempDir,
        fetcher: Arc<FakeFetcher>,
        transformer: Arc<FakeTransformer>,
        resizer: Resizer,
    }

    fn fixture(body: &'static [u8], configure: impl FnOnce(&mut Config)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config {
            cache: CacheConfig {
                cache_dir: dir.path().join("cache"),
                work_dir: dir.path().join("work"),
                ..Default::default()
            },
            ..Default::default()
        };
        config.fetch.allowed_hosts = vec!["*.example.com".to_string(), "example.com".to_string()];
        configure(&mut config);

        let fetcher = Arc::new(FakeFetcher {
            calls: AtomicUsize::new(0),
            body,
        });
        let transformer = Arc::new(FakeTransformer::default());
        let resizer = Resizer::new(
            &config,
            fetcher.clone(),
            transformer.clone(),
            Arc::new(FakeIntrospector),
        )
        .unwrap();

        Fixture {
            _dir: dir,
            fetcher,
            transformer,
            resizer,
        }
    }

    fn width(w: u32) -> TransformParams {
        TransformParams {
            width: Some(w),
            quality: Some(80),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resize_scenario() {
        let fx = fixture(b"IMG pixels", |_| {});
        let url = "http://example.com/a.jpg";

        let first = fx
            .resizer
            .resolve(url, Operation::Resize, &width(100), false)
            .await
            .unwrap();
        assert!(!first.download_hit);
        assert!(!first.transform_hit);
        let name = first.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("_a.jpg_resize_q80_100x0_0ox0oy"), "{}", name);

        let second = fx
            .resizer
            .resolve(url, Operation::Resize, &width(100), false)
            .await
            .unwrap();
        assert!(second.download_hit);
        assert!(second.transform_hit);
        assert_eq!(second.path, first.path);

        let third = fx
            .resizer
            .resolve(url, Operation::Resize, &width(200), false)
            .await
            .unwrap();
        assert!(third.download_hit);
        assert!(!third.transform_hit);
        assert_ne!(third.path, first.path);

        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.transformer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_scheme_defaults_to_http() {
        let fx = fixture(b"IMG", |_| {});
        assert_eq!(
            fx.resizer.check_url("example.com/a.jpg").unwrap(),
            "http://example.com/a.jpg"
        );
        assert_eq!(
            fx.resizer.check_url("https://cdn.example.com/a.jpg").unwrap(),
            "https://cdn.example.com/a.jpg"
        );
    }

    #[tokio::test]
    async fn scheme_is_detected_by_parsing() {
        let fx = fixture(b"IMG", |_| {});
        assert_eq!(
            fx.resizer
                .check_url("example.com/img.jpg?src=http://cdn")
                .unwrap(),
            "http://example.com/img.jpg?src=http://cdn"
        );
        assert!(matches!(
            fx.resizer.check_url("http://evil.net/a.jpg?next=example.com"),
            Err(MkimageError::HostNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn disallowed_host_is_rejected_before_download() {
        let fx = fixture(b"IMG", |_| {});
        let err = fx
            .resizer
            .resolve("http://evil.net/a.jpg", Operation::Resize, &width(10), false)
            .await
            .unwrap_err();

        assert!(matches!(err, MkimageError::HostNotAllowed(ref h) if h == "evil.net"));
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_url_is_a_validation_error() {
        let fx = fixture(b"IMG", |_| {});
        let err = fx
            .resizer
            .resolve("  ", Operation::Resize, &width(10), false)
            .await
            .unwrap_err();
        assert!(matches!(err, MkimageError::Validation(_)));
    }

    #[tokio::test]
    async fn invalid_parameters_fail_before_download() {
        let fx = fixture(b"IMG", |_| {});
        let err = fx
            .resizer
            .resolve(
                "http://example.com/a.jpg",
                Operation::Stretch,
                &width(10),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MkimageError::Validation(_)));
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remote_not_found_propagates() {
        let fx = fixture(b"IMG", |_| {});
        let err = fx
            .resizer
            .resolve(
                "http://example.com/missing.jpg",
                Operation::Resize,
                &width(10),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MkimageError::RemoteNotFound { .. }));
    }

    #[tokio::test]
    async fn cache_operation_returns_download() {
        let fx = fixture(b"IMG pixels", |_| {});
        let request = ImageRequest::new("example.com/a.jpg", Operation::Cache);

        let resolved = fx.resizer.process(&request).await.unwrap();

        assert!(!resolved.download_hit);
        assert!(!resolved.transform_hit);
        assert_eq!(resolved.info.format, "JPEG");
        assert_eq!(std::fs::read(&resolved.path).unwrap(), b"IMG pixels");
        assert_eq!(fx.transformer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cache_operation_purges_invalid_download() {
        let fx = fixture(b"<html>not an image</html>", |_| {});
        let request = ImageRequest::new("http://example.com/a.jpg", Operation::Cache);

        let err = fx.resizer.process(&request).await.unwrap_err();

        match err {
            MkimageError::InvalidImage { path, .. } => assert!(!path.exists()),
            other => panic!("unexpected error: {:?}", other),
        }

        // Nothing cached, so the next attempt downloads again
        fx.resizer.process(&request).await.unwrap_err();
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disable_cache_forces_every_request() {
        let fx = fixture(b"IMG", |config| config.cache.disable_cache = true);
        let request =
            ImageRequest::new("http://example.com/a.jpg", Operation::Resize).with_params(width(10));

        fx.resizer.process(&request).await.unwrap();
        let again = fx.resizer.process(&request).await.unwrap();

        assert!(!again.download_hit);
        assert!(!again.transform_hit);
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fx.transformer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn forced_request_refetches() {
        let fx = fixture(b"IMG", |_| {});
        let request = ImageRequest::new("http://example.com/a.jpg", Operation::Resize)
            .with_params(width(10));

        fx.resizer.process(&request).await.unwrap();
        let forced = fx.resizer.process(&request.clone().forced(true)).await.unwrap();

        assert!(!forced.download_hit);
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
