//! Content-addressed download cache for remote images

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use artcache_cache::CacheConfig;
use sha2::{Digest, Sha256};

use crate::collab::WebFileCache;
use crate::error::{ResourceError, ResourceResult};

/// Whether `source` is an http(s) URL.
pub fn is_http_url(source: &str) -> bool {
    let lower = source.get(..8).unwrap_or(source).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Stores each URL's body under `sha256(url)` plus the URL's extension.
pub struct HttpFileCache {
    dir: PathBuf,
    agent: ureq::Agent,
}

impl HttpFileCache {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            dir: dir.into(),
            agent,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.web_cache_dir.clone(), config.fetch_timeout)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where `url` is (or would be) stored.
    pub fn cache_path(&self, url: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(url.as_bytes()));
        let name = match url_extension(url) {
            Some(ext) => format!("{digest}.{ext}"),
            None => digest,
        };
        self.dir.join(name)
    }

    fn download(&self, url: &str, dest: &Path) -> ResourceResult<bool> {
        let fetch_failed = |reason: String| ResourceError::FetchFailed {
            url: url.to_string(),
            reason,
        };

        let request = self.agent.get(url).set("User-Agent", "artcache");
        let resp = match request.call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, _)) => {
                tracing::warn!(url, status = code, "web file not available");
                return Ok(false);
            }
            Err(err) => return Err(fetch_failed(err.to_string())),
        };

        fs::create_dir_all(&self.dir)?;
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        io::copy(&mut resp.into_reader(), &mut temp)
            .map_err(|err| fetch_failed(err.to_string()))?;
        temp.persist(dest).map_err(|err| err.error)?;

        tracing::debug!(url, path = %dest.display(), "downloaded web file");
        Ok(true)
    }
}

impl WebFileCache for HttpFileCache {
    fn get_or_fetch(&self, url: &str) -> ResourceResult<Option<PathBuf>> {
        let path = self.cache_path(url);
        if path.is_file() {
            return Ok(Some(path));
        }

        if self.download(url, &path)? {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }
}

impl std::fmt::Debug for HttpFileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFileCache")
            .field("dir", &self.dir)
            .finish()
    }
}

/// Lowercased file extension of the URL path, if it looks like one.
fn url_extension(url: &str) -> Option<String> {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = without_scheme.split(['?', '#']).next()?;
    let (_, last) = path.rsplit_once('/')?;
    let (_, ext) = last.rsplit_once('.')?;

    let valid =
        (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve exactly one HTTP response on a local port.
    fn serve_once(status: &'static str, body: &'static [u8]) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                if line == "\r\n" {
                    break;
                }
                line.clear();
            }
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .unwrap();
            stream.write_all(body).unwrap();
        });

        (format!("http://{addr}"), handle)
    }

    #[test]
    fn test_is_http_url() {
        assert!(is_http_url("http://example.com/a.png"));
        assert!(is_http_url("HTTPS://example.com/a.png"));
        assert!(!is_http_url("ftp://example.com/a.png"));
        assert!(!is_http_url("/srv/http/a.png"));
        assert!(!is_http_url("http"));
    }

    #[test]
    fn test_url_extension() {
        assert_eq!(
            url_extension("https://cdn.test/covers/a.PNG?size=2"),
            Some("png".to_string())
        );
        assert_eq!(
            url_extension("https://cdn.test/covers/a.jpeg#frag"),
            Some("jpeg".to_string())
        );
        assert_eq!(url_extension("https://cdn.test/covers/a"), None);
        assert_eq!(url_extension("https://cdn.test"), None);
        assert_eq!(url_extension("https://cdn.test/x.not-an-ext"), None);
    }

    #[test]
    fn test_cache_path_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HttpFileCache::new(dir.path(), Duration::from_secs(5));

        let a = cache.cache_path("https://cdn.test/a.png");
        assert_eq!(a, cache.cache_path("https://cdn.test/a.png"));
        assert_ne!(a, cache.cache_path("https://cdn.test/b.png"));
        assert_eq!(a.extension().unwrap(), "png");
        assert_eq!(a.file_stem().unwrap().len(), 64);
    }

    #[test]
    fn test_existing_file_is_returned_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HttpFileCache::new(dir.path(), Duration::from_secs(5));
        // Unroutable host: any network access would fail the test.
        let url = "http://invalid.invalid/cover.png";
        fs::write(cache.cache_path(url), b"cached").unwrap();

        assert_eq!(
            cache.get_or_fetch(url).unwrap(),
            Some(cache.cache_path(url))
        );
    }

    #[test]
    fn test_fetch_stores_body() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HttpFileCache::new(dir.path().join("web"), Duration::from_secs(5));
        let (base, server) = serve_once("200 OK", b"image-bytes");
        let url = format!("{base}/cover.jpg");

        let path = cache
            .get_or_fetch(&url)
            .unwrap()
            .expect("file should be fetched");
        server.join().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"image-bytes");
        assert_eq!(path, cache.cache_path(&url));
    }

    #[test]
    fn test_not_found_status_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HttpFileCache::new(dir.path(), Duration::from_secs(5));
        let (base, server) = serve_once("404 Not Found", b"");
        let url = format!("{base}/missing.png");

        assert_eq!(cache.get_or_fetch(&url).unwrap(), None);
        server.join().unwrap();
        assert!(!cache.cache_path(&url).exists());
    }

    #[test]
    fn test_connection_failure_is_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HttpFileCache::new(dir.path(), Duration::from_secs(2));

        // Bind then drop to get a port nothing listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = cache
            .get_or_fetch(&format!("http://127.0.0.1:{port}/x.png"))
            .unwrap_err();
        assert!(matches!(err, ResourceError::FetchFailed { .. }));
    }
}
