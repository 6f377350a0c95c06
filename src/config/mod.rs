// Gateway configuration
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use serde::{Serialize, Deserialize};

use crate::fetcher::FetcherSettings;
use crate::storage::DiskCacheConfig;
use crate::worker::WorkerPoolConfig;

pub mod manager;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub worker: WorkerConfig,
    pub fetcher: FetcherConfig,
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    /// When set, requests must send this value in the Authorization header
    pub api_token: Option<String>,
    pub requests_per_second: u32,
    pub requests_per_second_per_ip: u32,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8001)),
            api_token: None,
            requests_per_second: 1000,
            requests_per_second_per_ip: 100,
            max_body_bytes: 64 * 1024,
        }
    }
}

/// Disk and memory cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub script_ttl: Duration,
    pub processed_ttl: Duration,
    pub max_scripts: usize,
    pub max_processed: usize,
    pub compression_threshold: usize,
    /// Zero writes metadata on every change
    pub metadata_flush_delay: Duration,
    pub sweep_interval: Duration,
    pub memory_cache_size: usize,
    pub content_ttl: Duration,
    pub signature_ttl: Duration,
    pub timestamp_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./player_cache"),
            script_ttl: Duration::from_secs(7 * 24 * 3600),
            processed_ttl: Duration::from_secs(7 * 24 * 3600),
            max_scripts: 100,
            max_processed: 100,
            compression_threshold: 100 * 1024,
            metadata_flush_delay: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(3600),
            memory_cache_size: 1000,
            content_ttl: Duration::from_secs(3600),
            signature_ttl: Duration::from_secs(3600),
            timestamp_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

impl CacheConfig {
    fn flush_delay(&self) -> Option<Duration> {
        if self.metadata_flush_delay.is_zero() {
            None
        } else {
            Some(self.metadata_flush_delay)
        }
    }

    /// Store for raw player scripts, at the cache root
    pub fn scripts_store(&self) -> DiskCacheConfig {
        DiskCacheConfig {
            dir: self.cache_dir.clone(),
            extension: ".js".to_string(),
            file_suffix: String::new(),
            metadata_file: "metadata.json".to_string(),
            ttl: self.script_ttl,
            max_entries: self.max_scripts,
            compression_threshold: self.compression_threshold,
            flush_delay: self.flush_delay(),
        }
    }

    /// Store for preprocessed derivatives, under `processed/`
    pub fn processed_store(&self) -> DiskCacheConfig {
        DiskCacheConfig {
            dir: self.cache_dir.join("processed"),
            extension: ".js".to_string(),
            file_suffix: "_processed".to_string(),
            metadata_file: "metadata.json".to_string(),
            ttl: self.processed_ttl,
            max_entries: self.max_processed,
            compression_threshold: self.compression_threshold,
            flush_delay: self.flush_delay(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub max_queue_size: usize,
    pub task_timeout: Duration,
    pub respawn_delay: Duration,
    /// Solver program and its arguments
    pub engine_command: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let pool = WorkerPoolConfig::default();
        Self {
            pool_size: pool.pool_size,
            max_queue_size: pool.max_queue_size,
            task_timeout: pool.task_timeout,
            respawn_delay: pool.respawn_delay,
            engine_command: vec!["node".to_string(), "solver/main.js".to_string()],
        }
    }
}

impl WorkerConfig {
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            pool_size: self.pool_size.max(1),
            max_queue_size: self.max_queue_size,
            task_timeout: self.task_timeout,
            respawn_delay: self.respawn_delay,
        }
    }
}

/// Upstream fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub allowed_hosts: Vec<String>,
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: vec![
                "www.youtube.com".to_string(),
                "youtube.com".to_string(),
                "m.youtube.com".to_string(),
            ],
            base_url: "https://www.youtube.com".to_string(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl FetcherConfig {
    pub fn settings(&self, cache: &CacheConfig) -> FetcherSettings {
        FetcherSettings {
            allowed_hosts: self.allowed_hosts.clone(),
            base_url: self.base_url.clone(),
            content_cache_size: cache.memory_cache_size,
            content_cache_ttl: cache.content_ttl,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Compact,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub enable_colors: bool,
    pub enable_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            enable_colors: true,
            enable_line_numbers: false,
        }
    }
}
