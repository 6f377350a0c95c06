// Player script fetcher backed by the disk cache
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::metrics::GatewayMetrics;
use crate::storage::{DiskCache, MemoryCache};

/// Path prefix every player script lives under
pub const PLAYER_PATH_PREFIX: &str = "/s/player/";

/// Fetch errors
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Fetching {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("Source not allowed: {0}")]
    InvalidSource(String),
    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Where script bodies come from. The production source is plain HTTP;
/// tests substitute an in-memory one.
#[async_trait]
pub trait ScriptSource: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<String, FetchError>;
}

/// reqwest-based source
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ScriptSource for HttpSource {
    async fn fetch(&self, url: &Url) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })
    }
}

/// Fetcher configuration
#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub allowed_hosts: Vec<String>,
    /// Origin relative player paths are resolved against
    pub base_url: String,
    pub content_cache_size: usize,
    pub content_cache_ttl: Duration,
}

/// A player script that has a local, key-addressed copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScript {
    pub key: String,
    pub url: Url,
    pub path: PathBuf,
}

/// Resolves player script URLs to local files, hitting the network only on
/// first access or after expiry. Concurrent resolves of one URL share a
/// single fetch.
pub struct ContentFetcher {
    source: Arc<dyn ScriptSource>,
    scripts: DiskCache,
    contents: MemoryCache<Arc<String>>,
    keys: MemoryCache<String>,
    allowed_hosts: Vec<String>,
    base_url: Url,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    metrics: Arc<GatewayMetrics>,
}

impl ContentFetcher {
    pub fn new(
        source: Arc<dyn ScriptSource>,
        scripts: DiskCache,
        settings: FetcherSettings,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self, FetchError> {
        let base_url = Url::parse(&settings.base_url)
            .map_err(|e| FetchError::InvalidSource(format!("{}: {}", settings.base_url, e)))?;

        Ok(Self {
            source,
            scripts,
            contents: MemoryCache::new(settings.content_cache_size, settings.content_cache_ttl),
            keys: MemoryCache::new(settings.content_cache_size, settings.content_cache_ttl),
            allowed_hosts: settings.allowed_hosts,
            base_url,
            in_flight: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    /// Checks a player URL against the allow-list. Relative `/s/player/`
    /// paths are resolved against the base origin.
    pub fn validate(&self, source_url: &str) -> Result<Url, FetchError> {
        if source_url.starts_with('/') {
            if !source_url.starts_with(PLAYER_PATH_PREFIX) {
                return Err(FetchError::InvalidSource(source_url.to_string()));
            }
            return self
                .base_url
                .join(source_url)
                .map_err(|_| FetchError::InvalidSource(source_url.to_string()));
        }

        let url = Url::parse(source_url)
            .map_err(|_| FetchError::InvalidSource(source_url.to_string()))?;

        let host_allowed = url
            .host_str()
            .map(|host| self.allowed_hosts.iter().any(|allowed| allowed == host))
            .unwrap_or(false);

        if !matches!(url.scheme(), "https" | "http") || !host_allowed {
            return Err(FetchError::InvalidSource(source_url.to_string()));
        }
        Ok(url)
    }

    /// Stable cache key for a player URL, memoized
    pub fn content_key(&self, url: &Url) -> String {
        if let Some(key) = self.keys.get(url.as_str()) {
            return key;
        }
        let key = derive_content_key(url);
        self.keys.set(url.as_str(), key.clone());
        key
    }

    pub async fn resolve(&self, source_url: &str) -> Result<ResolvedScript, FetchError> {
        let url = self.validate(source_url)?;
        let key = self.content_key(&url);

        if let Some(path) = self.scripts.fresh_path(&key).await {
            self.metrics.record_disk_hit();
            return Ok(ResolvedScript { key, url, path });
        }

        let gate = self.gate_for(&key);
        let result = {
            let _guard = gate.lock().await;

            // Another caller may have finished the fetch while we waited
            match self.scripts.fresh_path(&key).await {
                Some(path) => {
                    self.metrics.record_disk_hit();
                    Ok(path)
                }
                None => {
                    self.metrics.record_disk_miss();
                    self.fetch_and_store(&url, &key).await.map(|(path, _)| path)
                }
            }
        };
        self.release_gate(&key, gate);

        result.map(|path| ResolvedScript { key, url, path })
    }

    /// Script body for a resolved script: memory, then disk, then network
    pub async fn content(&self, script: &ResolvedScript) -> Result<Arc<String>, FetchError> {
        if let Some(content) = self.contents.get(&script.key) {
            self.metrics.record_memory_hit();
            return Ok(content);
        }
        self.metrics.record_memory_miss();

        if let Some(content) = self.scripts.get(&script.key).await {
            let content = Arc::new(content);
            self.contents.set(script.key.clone(), content.clone());
            return Ok(content);
        }

        debug!("Script {} vanished from disk cache, fetching again", script.key);
        let gate = self.gate_for(&script.key);
        let result = {
            let _guard = gate.lock().await;
            match self.contents.get(&script.key) {
                Some(content) => Ok(content),
                None => self
                    .fetch_and_store(&script.url, &script.key)
                    .await
                    .map(|(_, content)| content),
            }
        };
        self.release_gate(&script.key, gate);
        result
    }

    async fn fetch_and_store(
        &self,
        url: &Url,
        key: &str,
    ) -> Result<(PathBuf, Arc<String>), FetchError> {
        info!("Fetching player script {}", url);
        self.metrics.record_network_fetch();

        let body = self.source.fetch(url).await?;

        let path = match self.scripts.set(key, &body, Some(url.as_str())).await {
            Ok(path) => path,
            Err(e) => {
                // The in-memory copy still serves this script
                warn!("Failed to cache player script {}: {}", key, e);
                self.scripts.payload_path(key, false)
            }
        };

        let content = Arc::new(body);
        self.contents.set(key, content.clone());
        Ok((path, content))
    }

    fn gate_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_gate(&self, key: &str, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        drop(gate);
        // Clones are only made and dropped under this lock, so a count of one
        // means nobody else is waiting on the key
        let idle = in_flight
            .get(key)
            .map(|gate| Arc::strong_count(gate) == 1)
            .unwrap_or(false);
        if idle {
            in_flight.remove(key);
        }
    }
}

/// Derives the cache key for a script URL. Player paths carry their own id
/// (`/s/player/<id>/...`), which is kept readable and suffixed with a short
/// digest of the full path to tell variants apart. Anything else is keyed by
/// the digest of the whole URL.
pub fn derive_content_key(url: &Url) -> String {
    let path = url.path();

    if let Some(rest) = path.strip_prefix(PLAYER_PATH_PREFIX) {
        if let Some((id, _)) = rest.split_once('/') {
            let is_identifier = !id.is_empty()
                && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if is_identifier {
                let digest = Sha256::digest(path.as_bytes());
                return format!("{}-{}", id, &hex::encode(digest)[..8]);
            }
        }
    }

    hex::encode(Sha256::digest(url.as_str().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskCacheConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingSource {
        calls: AtomicUsize,
        status: Option<u16>,
    }

    #[async_trait]
    impl ScriptSource for CountingSource {
        async fn fetch(&self, url: &Url) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            match self.status {
                Some(status) => Err(FetchError::Status {
                    url: url.to_string(),
                    status,
                }),
                None => Ok(format!("// player for {}\nvar sts=19834;", url)),
            }
        }
    }

    fn fetcher(dir: &TempDir, source: Arc<CountingSource>) -> ContentFetcher {
        let scripts = DiskCache::new(DiskCacheConfig {
            dir: dir.path().to_path_buf(),
            flush_delay: None,
            ..DiskCacheConfig::default()
        })
        .unwrap();

        ContentFetcher::new(
            source,
            scripts,
            FetcherSettings {
                allowed_hosts: vec!["www.youtube.com".to_string()],
                base_url: "https://www.youtube.com".to_string(),
                content_cache_size: 10,
                content_cache_ttl: Duration::from_secs(60),
            },
            Arc::new(GatewayMetrics::new()),
        )
        .unwrap()
    }

    fn counting_source(status: Option<u16>) -> Arc<CountingSource> {
        Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            status,
        })
    }

    #[tokio::test]
    async fn test_second_resolve_uses_cache() {
        let dir = TempDir::new().unwrap();
        let source = counting_source(None);
        let fetcher = fetcher(&dir, source.clone());
        let url = "https://www.youtube.com/s/player/abc123/base.js";

        let first = fetcher.resolve(url).await.unwrap();
        let second = fetcher.resolve(url).await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.path, second.path);
        assert!(first.path.exists());
        assert!(first.key.starts_with("abc123-"));
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_fetch() {
        let dir = TempDir::new().unwrap();
        let source = counting_source(None);
        let fetcher = Arc::new(fetcher(&dir, source.clone()));
        let url = "https://www.youtube.com/s/player/abc123/base.js";

        let mut handles = Vec::new();
        for _ in 0..8 {
            let fetcher = fetcher.clone();
            handles.push(tokio::spawn(async move { fetcher.resolve(url).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(fetcher.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher(&dir, counting_source(Some(404)));

        let err = fetcher
            .resolve("https://www.youtube.com/s/player/missing/base.js")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_rejects_unlisted_sources() {
        let dir = TempDir::new().unwrap();
        let source = counting_source(None);
        let fetcher = fetcher(&dir, source.clone());

        for url in [
            "https://evil.example/s/player/abc/base.js",
            "/not/a/player.js",
            "ftp://www.youtube.com/s/player/abc/base.js",
            "not a url",
        ] {
            assert!(matches!(
                fetcher.resolve(url).await,
                Err(FetchError::InvalidSource(_))
            ));
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_relative_player_path_is_resolved() {
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher(&dir, counting_source(None));

        let script = fetcher.resolve("/s/player/abc123/base.js").await.unwrap();
        assert_eq!(script.url.as_str(), "https://www.youtube.com/s/player/abc123/base.js");
    }

    #[tokio::test]
    async fn test_content_refetches_when_disk_copy_is_gone() {
        let dir = TempDir::new().unwrap();
        let source = counting_source(None);
        let fetcher = fetcher(&dir, source.clone());

        let script = fetcher
            .resolve("https://www.youtube.com/s/player/abc123/base.js")
            .await
            .unwrap();
        fetcher.contents.clear();
        fetcher.scripts.remove(&script.key).await;

        let content = fetcher.content(&script).await.unwrap();
        assert!(content.contains("sts=19834"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_content_key_is_stable() {
        let a = Url::parse("https://www.youtube.com/s/player/abc123/base.js").unwrap();
        let b = Url::parse("https://www.youtube.com/s/player/abc123/player_ias.vflset/en_US/base.js").unwrap();
        let other = Url::parse("https://www.youtube.com/iframe_api").unwrap();

        assert_eq!(derive_content_key(&a), derive_content_key(&a));
        assert_ne!(derive_content_key(&a), derive_content_key(&b));
        assert!(derive_content_key(&b).starts_with("abc123-"));
        assert_eq!(derive_content_key(&other).len(), 64);
    }
}
