// Disk-backed payload store with TTL expiry, LRU eviction and gzip compression.
// Compressed payloads are gzip files named `<key><extension>.gz` (not zstd).
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{now_millis, StorageError};

const COMPRESSED_SUFFIX: &str = ".gz";

/// Disk cache configuration
#[derive(Debug, Clone)]
pub struct DiskCacheConfig {
    pub dir: PathBuf,
    /// Payload file extension, e.g. ".js"
    pub extension: String,
    /// Appended to the key before the extension, e.g. "_processed"
    pub file_suffix: String,
    pub metadata_file: String,
    pub ttl: Duration,
    pub max_entries: usize,
    /// Payloads longer than this many bytes are stored gzip-compressed
    pub compression_threshold: usize,
    /// `None` writes metadata on every mutation, otherwise writes are
    /// coalesced behind this delay
    pub flush_delay: Option<Duration>,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./player_cache"),
            extension: ".js".to_string(),
            file_suffix: String::new(),
            metadata_file: "metadata.json".to_string(),
            ttl: Duration::from_secs(7 * 24 * 3600),
            max_entries: 100,
            compression_threshold: 100 * 1024,
            flush_delay: Some(Duration::from_secs(1)),
        }
    }
}

/// Persisted per-entry bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub created_at: i64,
    pub last_accessed: i64,
    #[serde(default)]
    pub compressed: bool,
}

#[derive(Default)]
struct MetadataState {
    entries: HashMap<String, EntryMetadata>,
    dirty: bool,
    flush_scheduled: bool,
}

struct DiskCacheInner {
    config: DiskCacheConfig,
    // Loaded at most once per process, on first use
    state: OnceCell<Mutex<MetadataState>>,
}

/// Persistent key to text payload store.
///
/// Every metadata entry has exactly one payload file next to it; the two are
/// created and removed together. Cheap to clone, clones share state.
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<DiskCacheInner>,
}

impl DiskCache {
    pub fn new(config: DiskCacheConfig) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.dir)?;

        Ok(Self {
            inner: Arc::new(DiskCacheInner {
                config,
                state: OnceCell::new(),
            }),
        })
    }

    pub fn config(&self) -> &DiskCacheConfig {
        &self.inner.config
    }

    /// Path of the backing file for `key`
    pub fn payload_path(&self, key: &str, compressed: bool) -> PathBuf {
        let config = &self.inner.config;
        let mut name = format!("{}{}{}", key, config.file_suffix, config.extension);
        if compressed {
            name.push_str(COMPRESSED_SUFFIX);
        }
        config.dir.join(name)
    }

    fn metadata_path(&self) -> PathBuf {
        self.inner.config.dir.join(&self.inner.config.metadata_file)
    }

    async fn state(&self) -> &Mutex<MetadataState> {
        self.inner
            .state
            .get_or_init(|| async {
                let entries = load_metadata(&self.metadata_path()).await;
                debug!(
                    "Loaded {} disk cache entries from {:?}",
                    entries.len(),
                    self.inner.config.dir
                );
                Mutex::new(MetadataState {
                    entries,
                    ..MetadataState::default()
                })
            })
            .await
    }

    fn is_expired(&self, entry: &EntryMetadata, now: i64) -> bool {
        let ttl = i64::try_from(self.inner.config.ttl.as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(entry.created_at) > ttl
    }

    /// Reads a payload, returning `None` for missing, expired or unreadable
    /// entries. Stale metadata without a backing file is dropped.
    pub async fn get(&self, key: &str) -> Option<String> {
        let mut state = self.state().await.lock().await;
        let now = now_millis();

        let entry = state.entries.get(key)?.clone();
        if self.is_expired(&entry, now) {
            debug!("Disk cache entry {} expired", key);
            self.remove_entry(&mut state, key).await;
            self.persist(&mut state).await;
            return None;
        }

        let path = self.payload_path(key, entry.compressed);
        match read_payload(&path, entry.compressed).await {
            Ok(payload) => {
                if let Some(entry) = state.entries.get_mut(key) {
                    entry.last_accessed = now;
                }
                self.persist(&mut state).await;
                Some(payload)
            }
            Err(StorageError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                warn!("Backing file {:?} missing, dropping metadata for {}", path, key);
                state.entries.remove(key);
                self.persist(&mut state).await;
                None
            }
            Err(e) => {
                warn!("Failed to read disk cache entry {}: {}", key, e);
                self.remove_entry(&mut state, key).await;
                self.persist(&mut state).await;
                None
            }
        }
    }

    /// Returns the backing file of a fresh entry without reading it, touching
    /// its access time. Used to skip network fetches.
    pub async fn fresh_path(&self, key: &str) -> Option<PathBuf> {
        let mut state = self.state().await.lock().await;
        let now = now_millis();

        let entry = state.entries.get(key)?.clone();
        if self.is_expired(&entry, now) {
            self.remove_entry(&mut state, key).await;
            self.persist(&mut state).await;
            return None;
        }

        let path = self.payload_path(key, entry.compressed);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            warn!("Backing file {:?} missing, dropping metadata for {}", path, key);
            state.entries.remove(key);
            self.persist(&mut state).await;
            return None;
        }

        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_accessed = now;
        }
        self.persist(&mut state).await;
        Some(path)
    }

    /// Stores a payload and returns the path of its backing file.
    ///
    /// The payload is written before the metadata, so a crash in between
    /// loses at most this write.
    pub async fn set(
        &self,
        key: &str,
        payload: &str,
        source_url: Option<&str>,
    ) -> Result<PathBuf, StorageError> {
        let mut state = self.state().await.lock().await;

        if !state.entries.contains_key(key) && state.entries.len() >= self.inner.config.max_entries {
            self.evict_lru(&mut state).await;
        }

        let compressed = payload.len() > self.inner.config.compression_threshold;
        let path = self.payload_path(key, compressed);
        write_payload(&path, payload, compressed).await?;

        if let Some(previous) = state.entries.get(key) {
            if previous.compressed != compressed {
                remove_file_quietly(&self.payload_path(key, previous.compressed)).await;
            }
        }

        let now = now_millis();
        state.entries.insert(
            key.to_string(),
            EntryMetadata {
                source_url: source_url.map(str::to_string),
                created_at: now,
                last_accessed: now,
                compressed,
            },
        );
        self.persist(&mut state).await;

        debug!("Stored {} ({} bytes, compressed: {})", key, payload.len(), compressed);
        Ok(path)
    }

    pub async fn metadata(&self, key: &str) -> Option<EntryMetadata> {
        self.state().await.lock().await.entries.get(key).cloned()
    }

    pub async fn remove(&self, key: &str) {
        let mut state = self.state().await.lock().await;
        if state.entries.contains_key(key) {
            self.remove_entry(&mut state, key).await;
            self.persist(&mut state).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.state().await.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Removes every expired entry with a single metadata write. Returns the
    /// number of entries removed.
    pub async fn sweep(&self) -> usize {
        let mut state = self.state().await.lock().await;
        let now = now_millis();

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.remove_entry(&mut state, key).await;
        }

        if !expired.is_empty() {
            self.write_now(&mut state).await;
            info!("Swept {} expired entries from {:?}", expired.len(), self.inner.config.dir);
        }
        expired.len()
    }

    /// Runs `sweep` every `period` until the handle is aborted
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.sweep().await;
            }
        })
    }

    /// Writes pending metadata changes now
    pub async fn flush(&self) {
        let mut state = self.state().await.lock().await;
        state.flush_scheduled = false;
        if state.dirty {
            self.write_now(&mut state).await;
        }
    }

    async fn evict_lru(&self, state: &mut MetadataState) {
        let oldest = state
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            debug!("Evicting least recently used entry {}", key);
            self.remove_entry(state, &key).await;
        }
    }

    async fn remove_entry(&self, state: &mut MetadataState, key: &str) {
        if let Some(entry) = state.entries.remove(key) {
            remove_file_quietly(&self.payload_path(key, entry.compressed)).await;
        }
    }

    async fn persist(&self, state: &mut MetadataState) {
        match self.inner.config.flush_delay {
            None => self.write_now(state).await,
            Some(delay) => {
                state.dirty = true;
                if !state.flush_scheduled {
                    state.flush_scheduled = true;
                    let cache = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        cache.flush().await;
                    });
                }
            }
        }
    }

    async fn write_now(&self, state: &mut MetadataState) {
        match write_metadata(&self.metadata_path(), &state.entries).await {
            Ok(()) => state.dirty = false,
            Err(e) => {
                error!("Failed to write disk cache metadata: {}", e);
                state.dirty = true;
            }
        }
    }
}

async fn load_metadata(path: &Path) -> HashMap<String, EntryMetadata> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!("Failed to read cache metadata {:?}: {}", path, e);
            return HashMap::new();
        }
    };

    serde_json::from_str(&content).unwrap_or_else(|e| {
        warn!("Discarding unreadable cache metadata {:?}: {}", path, e);
        HashMap::new()
    })
}

async fn write_metadata(
    path: &Path,
    entries: &HashMap<String, EntryMetadata>,
) -> Result<(), StorageError> {
    let content = serde_json::to_vec_pretty(entries)?;
    write_atomically(path, &content).await
}

async fn write_atomically(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn write_payload(path: &Path, payload: &str, compressed: bool) -> Result<(), StorageError> {
    if compressed {
        let bytes = payload.as_bytes().to_vec();
        let encoded = tokio::task::spawn_blocking(move || compress(&bytes))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))??;
        write_atomically(path, &encoded).await
    } else {
        write_atomically(path, payload.as_bytes()).await
    }
}

async fn read_payload(path: &Path, compressed: bool) -> Result<String, StorageError> {
    if compressed {
        let bytes = fs::read(path).await?;
        let decoded = tokio::task::spawn_blocking(move || decompress(&bytes))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))??;
        Ok(decoded)
    } else {
        Ok(fs::read_to_string(path).await?)
    }
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!("Failed to remove cache file {:?}: {}", path, e);
        }
    }
}

fn compress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn decompress(bytes: &[u8]) -> std::io::Result<String> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}
