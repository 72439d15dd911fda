// src/fetch/mod.rs

//! HTTP fetch layer with mirror expansion, ETag revalidation, and
//! parallelism gating
//!
//! All upstream traffic funnels through [`HttpFetcher`]. `mirror://` URLs
//! expand through the configured mirror table and fall back across
//! mirrors in order. Downloads stream to a per-URL cache file under the
//! build directory and are revalidated with ETags inside a configurable
//! expiry window.
//!
//! Only requests marked `fast` may run concurrently (bounded by the
//! configured pool size); everything else serializes per host so small
//! origin servers see at most one connection at a time.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::hash::hash_bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use indicatif::ProgressBar;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connect timeout for every request (30 seconds)
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Abort a request when no data arrives for this long (60 seconds)
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Streaming buffer size (8 KiB)
const STREAM_BUFFER_SIZE: usize = 8192;

/// Options for a single fetch
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Fail with `SizeMismatch` when the body length differs
    pub expected_size: Option<u64>,
    /// Value for the `Accept` header
    pub accept: Option<String>,
    /// Revalidate a cached copy with `If-None-Match`
    pub use_etag: bool,
    /// Admit this request to the parallel pool instead of the per-host queue
    pub fast: bool,
    /// Serve the cached copy without revalidation inside this window
    pub expire_time: Option<Duration>,
    /// Extra query parameters
    pub params: Vec<(String, String)>,
    /// Courtesy delay before issuing the request
    pub wait_time: Option<Duration>,
}

/// A completed fetch: a seekable reader over the cached body plus a
/// canonical filename for the artifact layer
#[derive(Debug)]
pub struct FetchedFile {
    pub file: File,
    pub path: PathBuf,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EtagRecord {
    etag: String,
    validated_at: DateTime<Utc>,
}

/// Counting semaphore bounding the fast-request pool
struct FetchGate {
    state: Mutex<usize>,
    available: Condvar,
    capacity: usize,
}

impl FetchGate {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(0),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn acquire(&self) {
        let mut in_flight = self.state.lock().expect("fetch gate lock poisoned");
        while *in_flight >= self.capacity {
            in_flight = self
                .available
                .wait(in_flight)
                .expect("fetch gate lock poisoned");
        }
        *in_flight += 1;
    }

    fn release(&self) {
        let mut in_flight = self.state.lock().expect("fetch gate lock poisoned");
        *in_flight -= 1;
        self.available.notify_one();
    }
}

/// HTTP client shared by the engine and the repository fetchers
pub struct HttpFetcher {
    client: Client,
    mirrors: Mutex<HashMap<String, Vec<String>>>,
    etags: Mutex<HashMap<String, EtagRecord>>,
    host_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    gate: FetchGate,
    cache_dir: PathBuf,
    etag_path: PathBuf,
}

impl HttpFetcher {
    /// Create a fetcher caching downloads under `cache_dir`
    pub fn new(cache_dir: impl Into<PathBuf>, parallel: usize) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| Error::Network {
                url: String::new(),
                reason: format!("failed to create HTTP client: {e}"),
            })?;

        let etag_path = cache_dir.join("etags.json");
        let etags = load_etags(&etag_path);

        Ok(Self {
            client,
            mirrors: Mutex::new(HashMap::new()),
            etags: Mutex::new(etags),
            host_locks: Mutex::new(HashMap::new()),
            gate: FetchGate::new(parallel),
            cache_dir,
            etag_path,
        })
    }

    /// Register a mirror name with its candidate base URLs
    pub fn add_mirror(&self, name: impl Into<String>, urls: Vec<String>) {
        self.mirrors
            .lock()
            .expect("mirror table lock poisoned")
            .insert(name.into(), urls);
    }

    /// Expand a URL through the mirror table
    ///
    /// `mirror://name/suffix` becomes one candidate per registered base
    /// URL, tried in order. Plain `http(s)` URLs pass through unchanged.
    pub fn urls_for(&self, url: &str) -> Result<Vec<String>> {
        let Some(rest) = url.strip_prefix("mirror://") else {
            return Ok(vec![url.to_string()]);
        };

        let (name, suffix) = rest.split_once('/').unwrap_or((rest, ""));

        let mirrors = self.mirrors.lock().expect("mirror table lock poisoned");
        let bases = mirrors
            .get(name)
            .ok_or_else(|| Error::UnknownMirror(name.to_string()))?;

        Ok(bases
            .iter()
            .map(|base| {
                if suffix.is_empty() {
                    base.clone()
                } else {
                    format!("{}/{}", base.trim_end_matches('/'), suffix)
                }
            })
            .collect())
    }

    /// Fetch a URL, returning `Ok(None)` on HTTP 404
    ///
    /// `mirror://` URLs fall back across candidates: a transport error or
    /// 404 moves to the next mirror; the last failure is returned when
    /// every candidate is exhausted.
    pub fn fetch(
        &self,
        url: &str,
        opts: &FetchOptions,
        cancel: &CancelToken,
    ) -> Result<Option<FetchedFile>> {
        self.fetch_with_progress(url, opts, cancel, None)
    }

    /// Like [`HttpFetcher::fetch`] with an optional progress bar
    pub fn fetch_with_progress(
        &self,
        url: &str,
        opts: &FetchOptions,
        cancel: &CancelToken,
        progress: Option<&ProgressBar>,
    ) -> Result<Option<FetchedFile>> {
        cancel.check()?;

        if let Some(wait) = opts.wait_time {
            std::thread::sleep(wait);
        }

        let candidates = self.urls_for(url)?;
        let mut last_err: Option<Error> = None;
        let mut saw_not_found = false;

        for candidate in &candidates {
            cancel.check()?;

            match self.fetch_one(candidate, opts, cancel, progress) {
                Ok(Some(fetched)) => return Ok(Some(fetched)),
                Ok(None) => {
                    saw_not_found = true;
                    debug!(url = %candidate, "mirror returned 404, trying next");
                }
                Err(Error::Interrupted) => return Err(Error::Interrupted),
                Err(e) => {
                    warn!(url = %candidate, error = %e, "fetch failed, trying next mirror");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            // A 404 from any mirror is authoritative for absence.
            Some(e) if !saw_not_found => Err(e),
            _ => Ok(None),
        }
    }

    fn fetch_one(
        &self,
        url: &str,
        opts: &FetchOptions,
        cancel: &CancelToken,
        progress: Option<&ProgressBar>,
    ) -> Result<Option<FetchedFile>> {
        let cache_path = self.cache_path_for(url);

        // Inside the expiry window a cached copy is authoritative.
        if opts.use_etag && cache_path.exists() {
            if let Some(expire) = opts.expire_time {
                if let Some(record) = self.etag_record(url) {
                    let window = ChronoDuration::from_std(expire).unwrap_or(ChronoDuration::zero());
                    if Utc::now() - record.validated_at < window {
                        debug!(url, "serving cached copy inside expiry window");
                        return self.open_cached(url, &cache_path).map(Some);
                    }
                }
            }
        }

        if opts.fast {
            self.gate.acquire();
            let result = self.request(url, opts, cancel, &cache_path, progress);
            self.gate.release();
            result
        } else {
            let lock = self.host_lock(url);
            let _guard = lock.lock().expect("host lock poisoned");
            self.request(url, opts, cancel, &cache_path, progress)
        }
    }

    fn request(
        &self,
        url: &str,
        opts: &FetchOptions,
        cancel: &CancelToken,
        cache_path: &Path,
        progress: Option<&ProgressBar>,
    ) -> Result<Option<FetchedFile>> {
        let mut request = self.client.get(url);

        if !opts.params.is_empty() {
            request = request.query(&opts.params);
        }
        if let Some(accept) = &opts.accept {
            request = request.header(reqwest::header::ACCEPT, accept.as_str());
        }
        if opts.use_etag && cache_path.exists() {
            if let Some(record) = self.etag_record(url) {
                request = request.header(reqwest::header::IF_NONE_MATCH, record.etag.as_str());
            }
        }

        info!(url, "fetching");
        let response = request.send().map_err(|e| Error::Network {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();

        if status == reqwest::StatusCode::NOT_MODIFIED {
            debug!(url, "not modified, serving cached copy");
            self.touch_etag(url);
            return self.open_cached(url, cache_path).map(Some);
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !status.is_success() {
            return Err(Error::BadStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let total_size = response.content_length().unwrap_or(0);

        let written = self.stream_to_cache(url, response, cancel, cache_path, total_size, progress)?;

        if let Some(expected) = opts.expected_size {
            if written != expected {
                let _ = fs::remove_file(cache_path);
                return Err(Error::SizeMismatch {
                    url: url.to_string(),
                    expected,
                    actual: written,
                });
            }
        }

        if let Some(etag) = etag {
            self.record_etag(url, etag);
        }

        self.open_cached(url, cache_path).map(Some)
    }

    fn stream_to_cache(
        &self,
        url: &str,
        mut response: reqwest::blocking::Response,
        cancel: &CancelToken,
        cache_path: &Path,
        total_size: u64,
        progress: Option<&ProgressBar>,
    ) -> Result<u64> {
        if let Some(pb) = progress {
            if total_size > 0 {
                pb.set_length(total_size);
            }
            pb.set_message(url.to_string());
        }

        let tmp_path = cache_path.with_extension("part");
        let mut file = File::create(&tmp_path)?;

        let mut downloaded: u64 = 0;
        let mut buffer = [0u8; STREAM_BUFFER_SIZE];

        loop {
            if cancel.is_cancelled() {
                drop(file);
                let _ = fs::remove_file(&tmp_path);
                return Err(Error::Interrupted);
            }

            let n = response.read(&mut buffer).map_err(|e| {
                let _ = fs::remove_file(&tmp_path);
                Error::Network {
                    url: url.to_string(),
                    reason: format!("read failed: {e}"),
                }
            })?;
            if n == 0 {
                break;
            }

            if let Err(e) = file.write_all(&buffer[..n]) {
                drop(file);
                let _ = fs::remove_file(&tmp_path);
                return Err(Error::Io(e));
            }

            downloaded += n as u64;
            if let Some(pb) = progress {
                pb.set_position(downloaded);
            }
        }

        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, cache_path)?;

        debug!(url, bytes = downloaded, "downloaded");
        Ok(downloaded)
    }

    fn open_cached(&self, url: &str, cache_path: &Path) -> Result<FetchedFile> {
        let file = File::open(cache_path)?;
        Ok(FetchedFile {
            file,
            path: cache_path.to_path_buf(),
            filename: canonical_filename(url),
        })
    }

    /// The on-disk cache location for a URL
    pub fn cache_path_for(&self, url: &str) -> PathBuf {
        let digest = hash_bytes(url.as_bytes());
        let name = format!("{}-{}", &digest.to_hex()[..16], canonical_filename(url));
        self.cache_dir.join(name)
    }

    /// True when the cached copy of `url` was validated inside `window`
    pub fn is_fresh(&self, url: &str, window: Duration) -> bool {
        let Some(record) = self.etag_record(url) else {
            return false;
        };
        let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::zero());
        Utc::now() - record.validated_at < window
    }

    fn etag_record(&self, url: &str) -> Option<EtagRecord> {
        self.etags
            .lock()
            .expect("etag lock poisoned")
            .get(url)
            .cloned()
    }

    fn record_etag(&self, url: &str, etag: String) {
        let mut etags = self.etags.lock().expect("etag lock poisoned");
        etags.insert(
            url.to_string(),
            EtagRecord {
                etag,
                validated_at: Utc::now(),
            },
        );
        save_etags(&self.etag_path, &etags);
    }

    fn touch_etag(&self, url: &str) {
        let mut etags = self.etags.lock().expect("etag lock poisoned");
        if let Some(record) = etags.get_mut(url) {
            record.validated_at = Utc::now();
        }
        save_etags(&self.etag_path, &etags);
    }

    fn host_lock(&self, url: &str) -> Arc<Mutex<()>> {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| url.to_string());

        self.host_locks
            .lock()
            .expect("host lock table poisoned")
            .entry(host)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Derive a cache filename from the last URL path segment
fn canonical_filename(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let segment = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("");

    if segment.is_empty() || segment.contains(':') {
        "index".to_string()
    } else {
        segment.to_string()
    }
}

fn load_etags(path: &Path) -> HashMap<String, EtagRecord> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

fn save_etags(path: &Path, etags: &HashMap<String, EtagRecord>) {
    if let Ok(bytes) = serde_json::to_vec_pretty(etags) {
        let _ = fs::write(path, bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_fetcher() -> (tempfile::TempDir, HttpFetcher) {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new(dir.path().join("fetch"), 10).unwrap();
        (dir, fetcher)
    }

    #[test]
    fn test_plain_url_passes_through() {
        let (_dir, fetcher) = test_fetcher();
        assert_eq!(
            fetcher.urls_for("http://example/x").unwrap(),
            vec!["http://example/x".to_string()]
        );
    }

    #[test]
    fn test_mirror_expansion() {
        let (_dir, fetcher) = test_fetcher();
        fetcher.add_mirror(
            "alpine",
            vec![
                "https://mirror-a.example/alpine".into(),
                "https://mirror-b.example/alpine/".into(),
            ],
        );

        let urls = fetcher
            .urls_for("mirror://alpine/v3.20/main/x86_64/APKINDEX.tar.gz")
            .unwrap();
        assert_eq!(
            urls,
            vec![
                "https://mirror-a.example/alpine/v3.20/main/x86_64/APKINDEX.tar.gz".to_string(),
                "https://mirror-b.example/alpine/v3.20/main/x86_64/APKINDEX.tar.gz".to_string(),
            ]
        );
    }

    #[test]
    fn test_unknown_mirror_is_an_error() {
        let (_dir, fetcher) = test_fetcher();
        assert!(matches!(
            fetcher.urls_for("mirror://nope/x"),
            Err(Error::UnknownMirror(_))
        ));
    }

    #[test]
    fn test_canonical_filename() {
        assert_eq!(
            canonical_filename("http://example/path/APKINDEX.tar.gz"),
            "APKINDEX.tar.gz"
        );
        assert_eq!(
            canonical_filename("http://example/file?query=1"),
            "file"
        );
        assert_eq!(canonical_filename("http://example/"), "index");
    }

    #[test]
    fn test_cache_path_is_stable_and_distinct() {
        let (_dir, fetcher) = test_fetcher();
        let a1 = fetcher.cache_path_for("http://example/a");
        let a2 = fetcher.cache_path_for("http://example/a");
        let b = fetcher.cache_path_for("http://example/b");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn test_gate_bounds_concurrency() {
        let gate = FetchGate::new(2);
        gate.acquire();
        gate.acquire();
        assert_eq!(*gate.state.lock().unwrap(), 2);
        gate.release();
        gate.acquire();
        assert_eq!(*gate.state.lock().unwrap(), 2);
        gate.release();
        gate.release();
        assert_eq!(*gate.state.lock().unwrap(), 0);
    }

    #[test]
    fn test_etag_records_persist() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("fetch");

        {
            let fetcher = HttpFetcher::new(&cache, 10).unwrap();
            fetcher.record_etag("http://example/x", "\"abc\"".into());
        }

        let fetcher = HttpFetcher::new(&cache, 10).unwrap();
        let record = fetcher.etag_record("http://example/x").unwrap();
        assert_eq!(record.etag, "\"abc\"");
        assert!(fetcher.is_fresh("http://example/x", Duration::from_secs(3600)));
    }

    #[test]
    fn test_cancelled_fetch_aborts_before_request() {
        let (_dir, fetcher) = test_fetcher();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = fetcher
            .fetch("http://example/x", &FetchOptions::default(), &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }
}
