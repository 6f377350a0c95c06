// Storage layer: in-memory LRU+TTL cache and the disk-backed payload store
use std::time::{Duration, Instant};

pub mod memory;
pub mod disk;

pub use memory::MemoryCache;
pub use disk::{DiskCache, DiskCacheConfig, EntryMetadata};

/// A cached value together with its bookkeeping timestamps
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: Instant,
    pub last_accessed: Instant,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            last_accessed: now,
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Storage errors. Apart from creating a store, these never leave the cache
/// layer: callers log them and fall back to a miss.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Background task failed: {0}")]
    Task(String),
}

/// Milliseconds since the Unix epoch, the unit used by persisted metadata
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
