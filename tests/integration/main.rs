//! Integration tests for mkimage

use std::path::Path;
use tempfile::TempDir;

/// Write a config that keeps every path inside `dir`
fn write_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    let content = format!(
        r#"
[cache]
cache_dir = "{cache}"
work_dir = "{work}"
lock_timeout_secs = 5

[fetch]
allowed_hosts = ["127.0.0.1", "*.example.com"]
"#,
        cache = dir.path().join("cache").display(),
        work = dir.path().join("work").display(),
    );
    std::fs::write(&path, content).unwrap();
    path
}

fn files_under(dir: &Path) -> Vec<std::path::PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| !entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect()
}

mod cli_tests {
    use super::*;
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;

    fn mkimage() -> Command {
        let mut cmd = cargo_bin_cmd!("mkimage");
        cmd.env_remove("MKIMAGE_CONFIG").env_remove("RUST_LOG");
        cmd
    }

    #[test]
    fn help_displays() {
        mkimage()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("image resizing proxy core"));
    }

    #[test]
    fn version_displays() {
        mkimage()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("mkimage"));
    }

    #[test]
    fn config_path_honors_flag() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir);

        mkimage()
            .arg("-c")
            .arg(&config)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir);

        mkimage()
            .arg("-c")
            .arg(&config)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"))
            .stdout(predicate::str::contains("*.example.com"));
    }

    #[test]
    fn config_init_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("nested/config.toml");

        mkimage()
            .arg("-c")
            .arg(&config)
            .args(["config", "init"])
            .assert()
            .success();

        let written = std::fs::read_to_string(&config).unwrap();
        assert!(written.contains("default_quality = 69"));
        assert!(written.contains("[sweep]"));
    }

    #[test]
    fn overlapping_cache_roots_are_rejected() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.toml");
        std::fs::write(
            &config,
            format!(
                "[cache]\ncache_dir = \"{0}\"\nwork_dir = \"{0}/work\"\n",
                dir.path().join("cache").display()
            ),
        )
        .unwrap();

        mkimage()
            .arg("-c")
            .arg(&config)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn sweep_reports_json() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir);

        mkimage()
            .arg("-c")
            .arg(&config)
            .args(["sweep", "--output", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"removed\": 0"));

        // Missing work directory is recreated by the pass
        assert!(dir.path().join("work").is_dir());
    }

    #[test]
    fn resolve_rejects_disallowed_host() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir);

        mkimage()
            .arg("-c")
            .arg(&config)
            .args(["resolve", "evil.net/a.jpg", "-w", "100"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("evil.net is not allowed"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn resolve_rejects_unknown_operation() {
        mkimage()
            .args(["resolve", "example.com/a.jpg", "--op", "rotate"])
            .assert()
            .failure();
    }

    #[test]
    fn resolve_validates_parameters() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir);

        mkimage()
            .arg("-c")
            .arg(&config)
            .args(["resolve", "img.example.com/a.jpg", "--op", "stretch", "-w", "10"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn describe_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir);

        mkimage()
            .arg("-c")
            .arg(&config)
            .args(["describe", "/nonexistent/image.jpg"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("is not a file"));
    }
}

mod pipeline_tests {
    use super::*;
    use async_trait::async_trait;
    use mkimage::cache::Fetcher;
    use mkimage::config::{Config, ConfigManager};
    use mkimage::engine::{Introspector, Operation, TransformJob, TransformParams, Transformer};
    use mkimage::{MkimageError, MkimageResult, Resizer};
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct SlowFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for SlowFetcher {
        async fn fetch(&self, _url: &str, mut dest: std::fs::File) -> MkimageResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            dest.write_all(b"IMG body").unwrap();
            Ok(8)
        }
    }

    struct SlowTransformer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transformer for SlowTransformer {
        async fn transform(&self, job: &TransformJob<'_>) -> MkimageResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::copy(job.src, job.dst).unwrap();
            Ok(())
        }
    }

    struct StubIntrospector;

    #[async_trait]
    impl Introspector for StubIntrospector {
        fn invocation(&self, path: &Path) -> String {
            format!("identify {}", path.display())
        }

        async fn introspect(&self, path: &Path) -> MkimageResult<String> {
            let size = std::fs::metadata(path)
                .map_err(|e| MkimageError::io("stat", e))?
                .len();
            Ok(format!("JPEG\n8\n10\n10\n{}B\nx.jpg", size))
        }
    }

    async fn load_config(dir: &TempDir) -> Config {
        let path = write_config(dir);
        let config = ConfigManager::with_path(path).load().await.unwrap();
        ConfigManager::ensure_cache_dirs(&config).await.unwrap();
        config
    }

    /// Two independent resizers over one cache volume behave like two
    /// worker processes: each has its own lock descriptors.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn workers_sharing_a_cache_produce_once() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir).await;

        let fetcher = Arc::new(SlowFetcher {
            calls: AtomicUsize::new(0),
        });
        let transformer = Arc::new(SlowTransformer {
            calls: AtomicUsize::new(0),
        });

        let workers: Vec<Arc<Resizer>> = (0..2)
            .map(|_| {
                Arc::new(
                    Resizer::new(
                        &config,
                        fetcher.clone(),
                        transformer.clone(),
                        Arc::new(StubIntrospector),
                    )
                    .unwrap(),
                )
            })
            .collect();

        let params = TransformParams {
            width: Some(100),
            ..Default::default()
        };

        let mut handles = Vec::new();
        for i in 0..8 {
            let worker = workers[i % 2].clone();
            let params = params.clone();
            handles.push(tokio::spawn(async move {
                worker
                    .resolve("http://img.example.com/a.jpg", Operation::Resize, &params, false)
                    .await
            }));
        }

        let results = futures_util::future::join_all(handles).await;
        let mut paths: Vec<_> = results
            .into_iter()
            .map(|r| r.unwrap().unwrap().path)
            .collect();
        paths.dedup();

        assert_eq!(paths.len(), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(transformer.calls.load(Ordering::SeqCst), 1);

        // Only completed entries remain: one download and one variant
        assert_eq!(files_under(&dir.path().join("cache")).len(), 2);
        assert!(files_under(&dir.path().join("work")).is_empty());
    }
}

mod transport_tests {
    use super::*;
    use mkimage::cache::{CacheLayout, DownloadCache, RetryPolicy, UreqFetcher};
    use mkimage::MkimageError;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::time::Duration;

    /// Serve one canned HTTP response and return the base URL
    fn serve_once(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            let head = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(body).unwrap();
        });

        format!("http://{}", addr)
    }

    /// Accept one connection and never answer it
    fn serve_silence() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_secs(3));
            drop(stream);
        });

        format!("http://{}", addr)
    }

    fn cache(dir: &TempDir) -> DownloadCache {
        cache_with_timeout(dir, Duration::from_secs(5))
    }

    fn cache_with_timeout(dir: &TempDir, timeout: Duration) -> DownloadCache {
        let layout = CacheLayout::new(dir.path().join("cache"), dir.path().join("work")).unwrap();
        let fetcher = UreqFetcher::new(timeout, "mkimage-test");
        DownloadCache::new(
            layout,
            RetryPolicy::new(Duration::from_secs(5), Duration::from_millis(5)),
            Arc::new(fetcher),
        )
    }

    #[tokio::test]
    async fn successful_download_is_cached() {
        let dir = TempDir::new().unwrap();
        let base = serve_once("200 OK", b"image bytes");
        let url = format!("{}/a.jpg", base);

        let (path, hit) = cache(&dir).fetch(&url, false).await.unwrap();

        assert!(!hit);
        assert_eq!(std::fs::read(&path).unwrap(), b"image bytes");
        assert!(files_under(&dir.path().join("work")).is_empty());
    }

    #[tokio::test]
    async fn not_found_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let base = serve_once("404 Not Found", b"missing");
        let url = format!("{}/gone.jpg", base);
        let downloads = cache(&dir);

        let err = downloads.fetch(&url, false).await.unwrap_err();

        assert!(matches!(err, MkimageError::RemoteNotFound { .. }));
        assert!(!downloads.cached_path(&url).exists());
        assert!(files_under(&dir.path().join("cache")).is_empty());
        assert!(files_under(&dir.path().join("work")).is_empty());
    }

    #[tokio::test]
    async fn server_error_is_remote_status() {
        let dir = TempDir::new().unwrap();
        let base = serve_once("503 Service Unavailable", b"");
        let url = format!("{}/busy.jpg", base);

        let err = cache(&dir).fetch(&url, false).await.unwrap_err();

        assert!(matches!(err, MkimageError::RemoteStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let dir = TempDir::new().unwrap();
        let base = serve_silence();
        let url = format!("{}/slow.jpg", base);
        let downloads = cache_with_timeout(&dir, Duration::from_millis(200));

        let err = downloads.fetch(&url, false).await.unwrap_err();

        assert!(matches!(err, MkimageError::RemoteTimeout { .. }), "{:?}", err);
        assert!(!downloads.cached_path(&url).exists());
        assert!(files_under(&dir.path().join("work")).is_empty());
    }
}
