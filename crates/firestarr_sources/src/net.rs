//! Caching HTTP download layer.
//!
//! Downloads land at a caller-chosen path and are reused on later calls:
//! within a process via a memo set, across processes via a sidecar file
//! lock, and across runs by comparing the server's Last-Modified with the
//! local file's mtime. Upstream agency servers routinely present broken
//! certificate chains, so verification is disabled and a browser user agent
//! is sent.

use crate::{Result, SourceError};
use filetime::FileTime;
use fs2::FileExt;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/106.0.0.0 Safari/537.36";
const RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Query parameters safe to show in logs; everything else is masked.
const SAFE_PARAMS: &[&str] = &[
    "model", "lat", "lon", "format", "tz", "ens_val", "output", "f", "where",
    "outFields", "service", "version", "request", "typename", "outputFormat",
];

/// Body check run before a download is accepted. A rejected body fails
/// that attempt; agency servers like to serve error pages with a 200.
pub type Validate<'a> = &'a (dyn Fn(&[u8]) -> std::result::Result<(), String> + Send + Sync);

/// Reject markup bodies served where CSV or JSON data is expected.
pub fn not_markup(body: &[u8]) -> std::result::Result<(), String> {
    match body.iter().copied().find(|b| !b.is_ascii_whitespace()) {
        Some(b'<') => Err("markup response where data expected".to_string()),
        _ => Ok(()),
    }
}

pub struct HttpCache {
    client: reqwest::Client,
    fetched: Mutex<HashSet<PathBuf>>,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl HttpCache {
    pub fn new() -> Result<HttpCache> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| SourceError::Http {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(HttpCache {
            client,
            fetched: Mutex::new(HashSet::new()),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Download `url` to `path`, reusing the local copy when it is current.
    ///
    /// With `keep_existing` any non-empty file at `path` is used as-is,
    /// with no network traffic at all; otherwise a conditional GET decides.
    /// Returns the path of the usable file. Transient failures retry; a 403
    /// or 404 fails immediately since retrying cannot help.
    pub async fn save_http(
        &self,
        url: &str,
        path: &Path,
        keep_existing: bool,
        validate: Option<Validate<'_>>,
    ) -> Result<PathBuf> {
        if keep_existing {
            if let Ok(meta) = fs::metadata(path) {
                if meta.len() > 0 {
                    debug!(path = %path.display(), "keeping existing file");
                    return Ok(path.to_path_buf());
                }
            }
        }
        {
            let fetched = self.fetched.lock().await;
            if fetched.contains(path) {
                debug!(path = %path.display(), "already fetched this run");
                return Ok(path.to_path_buf());
            }
        }

        let path_lock = self.lock_for(path).await;
        let _guard = path_lock.lock().await;
        // another task may have finished the download while we waited
        {
            let fetched = self.fetched.lock().await;
            if fetched.contains(path) {
                return Ok(path.to_path_buf());
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _file_lock = SidecarLock::acquire(path)?;

        let mut last_err = None;
        for attempt in 1..=RETRIES {
            match self.fetch_once(url, path, validate).await {
                Ok(()) => {
                    self.fetched.lock().await.insert(path.to_path_buf());
                    return Ok(path.to_path_buf());
                }
                Err(e @ SourceError::Rejected { status, .. })
                    if status == 403 || status == 404 =>
                {
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        url = %mask_url(url),
                        attempt,
                        error = %e,
                        "download failed"
                    );
                    last_err = Some(e);
                    if attempt < RETRIES {
                        tokio::time::sleep(RETRY_DELAY * attempt).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(SourceError::Exhausted("download")))
    }

    /// Download and return the body as text, still going through the cache.
    pub async fn get_text(
        &self,
        url: &str,
        path: &Path,
        keep_existing: bool,
        validate: Option<Validate<'_>>,
    ) -> Result<String> {
        let path = self.save_http(url, path, keep_existing, validate).await?;
        Ok(fs::read_to_string(path)?)
    }

    async fn fetch_once(&self, url: &str, path: &Path, validate: Option<Validate<'_>>) -> Result<()> {
        let mut request = self.client.get(url);
        if let Ok(meta) = fs::metadata(path) {
            if let Ok(mtime) = meta.modified() {
                request = request.header(
                    reqwest::header::IF_MODIFIED_SINCE,
                    httpdate(mtime),
                );
            }
        }
        let response = request.send().await.map_err(|e| SourceError::Http {
            url: mask_url(url),
            message: e.to_string(),
        })?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            debug!(url = %mask_url(url), "not modified, keeping local copy");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(SourceError::Rejected {
                url: mask_url(url),
                status: response.status().as_u16(),
            });
        }

        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_httpdate);
        // server copy may still be older than what we have
        if let (Some(remote), Ok(meta)) = (last_modified, fs::metadata(path)) {
            if let Ok(local) = meta.modified() {
                if local >= remote {
                    debug!(url = %mask_url(url), "local copy is current");
                    return Ok(());
                }
            }
        }

        let body = response.bytes().await.map_err(|e| SourceError::Http {
            url: mask_url(url),
            message: e.to_string(),
        })?;
        if let Some(validate) = validate {
            if let Err(message) = validate(&body) {
                return Err(SourceError::Malformed {
                    url: mask_url(url),
                    message,
                });
            }
        }
        let tmp = path.with_extension("part");
        fs::write(&tmp, &body)?;
        fs::rename(&tmp, path)?;
        if let Some(remote) = last_modified {
            filetime::set_file_mtime(path, FileTime::from_system_time(remote))?;
        }
        info!(url = %mask_url(url), path = %path.display(), bytes = body.len(), "downloaded");
        Ok(())
    }

    async fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Cross-process exclusive lock on `<path>.lock`, released on drop.
struct SidecarLock {
    file: File,
}

impl SidecarLock {
    fn acquire(path: &Path) -> Result<SidecarLock> {
        let lock_path = sidecar_path(path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(SidecarLock { file })
    }
}

impl Drop for SidecarLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    name.push_str(".lock");
    path.with_file_name(name)
}

/// Mask credential-bearing query parameter values for logging.
pub fn mask_url(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let masked: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if !SAFE_PARAMS.contains(&key) => format!("{key}=***"),
            _ => pair.to_string(),
        })
        .collect();
    format!("{base}?{}", masked.join("&"))
}

fn httpdate(t: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(t)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn parse_httpdate(s: &str) -> Option<SystemTime> {
    chrono::DateTime::parse_from_rfc2822(s)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_url_hides_secrets() {
        let url = "https://api.example.com/v1/csv?key=abc123&model=geps&lat=52.01&lon=-89.02";
        let masked = mask_url(url);
        assert!(!masked.contains("abc123"));
        assert!(masked.contains("key=***"));
        assert!(masked.contains("model=geps"));
        assert!(masked.contains("lat=52.01"));
    }

    #[test]
    fn test_mask_url_without_query() {
        assert_eq!(mask_url("https://example.com/file.tif"), "https://example.com/file.tif");
    }

    #[test]
    fn test_httpdate_roundtrip() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let parsed = parse_httpdate(&httpdate(t)).unwrap();
        assert_eq!(parsed, t);
    }

    #[test]
    fn test_not_markup() {
        assert!(not_markup(b"  <html><body>down for maintenance</body>").is_err());
        assert!(not_markup(b"<?xml version=\"1.0\"?><ExceptionReport/>").is_err());
        assert!(not_markup(b"DATE,LAT,LONG\n").is_ok());
        assert!(not_markup(b"{\"type\":\"FeatureCollection\"}").is_ok());
        assert!(not_markup(b"").is_ok());
    }

    #[tokio::test]
    async fn test_keep_existing_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static.csv");
        fs::write(&path, "a,b\n1,2\n").unwrap();
        let cache = HttpCache::new().unwrap();
        // unroutable URL: any network attempt would fail the call
        let out = cache
            .save_http("http://127.0.0.1:9/static.csv", &path, true, None)
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(out).unwrap(), "a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_invalid_body_fails_attempt_then_recovers() {
        use std::io::{Read, Write};
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let bodies = ["<html>down for maintenance</html>", "DATE,LAT\n2024-06-14,52.1\n"];
            for body in bodies {
                let (mut sock, _) = listener.accept().unwrap();
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf);
                let _ = write!(
                    sock,
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
            }
        });
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        let cache = HttpCache::new().unwrap();
        let url = format!("http://{addr}/report.csv");
        let out = cache
            .save_http(&url, &path, false, Some(&not_markup))
            .await
            .unwrap();
        // the rejected body never reached the cache path
        assert_eq!(fs::read_to_string(out).unwrap(), "DATE,LAT\n2024-06-14,52.1\n");
    }

    #[test]
    fn test_sidecar_lock_is_exclusive_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.csv");
        {
            let _lock = SidecarLock::acquire(&target).unwrap();
            let probe = OpenOptions::new()
                .create(true)
                .write(true)
                .open(sidecar_path(&target))
                .unwrap();
            assert!(probe.try_lock_exclusive().is_err());
        }
        let probe = OpenOptions::new()
            .create(true)
            .write(true)
            .open(sidecar_path(&target))
            .unwrap();
        assert!(probe.try_lock_exclusive().is_ok());
    }
}
