// Request handling context shared by every endpoint
use std::sync::{Arc, Mutex, PoisonError};

use hyper::StatusCode;
use regex::Regex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::AppConfig;
use crate::fetcher::{ContentFetcher, FetchError, HttpSource, ScriptSource};
use crate::metrics::GatewayMetrics;
use crate::storage::{DiskCache, MemoryCache, StorageError};
use crate::worker::{PoolError, SolvingEngine, WorkerPool};

pub mod handlers;
pub mod server;
pub mod types;

pub use server::{handle, serve};
pub use types::*;

/// Matches `signatureTimestamp:19834` as well as the shorter `sts:19834`
const TIMESTAMP_PATTERN: &str = r"(?:signatureTimestamp|sts)\s*:\s*(\d+)";

/// Handler-level errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("Solving engine error: {0}")]
    Engine(String),
    #[error("Timestamp not found in player script")]
    TimestampNotFound,
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MissingField(_) | GatewayError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            GatewayError::Fetch(FetchError::InvalidSource(_)) => StatusCode::BAD_REQUEST,
            GatewayError::Fetch(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Pool(PoolError::QueueFull) | GatewayError::Pool(PoolError::Shutdown) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Pool(PoolError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Everything a handler needs. Built once at startup and shared behind an
/// `Arc`; nothing here is global.
pub struct AppContext {
    pub config: AppConfig,
    pub fetcher: ContentFetcher,
    pub scripts: DiskCache,
    pub preprocessed: DiskCache,
    pub preprocessed_memory: MemoryCache<Arc<String>>,
    pub signatures: MemoryCache<DecryptSignatureResponse>,
    pub timestamps: MemoryCache<String>,
    pub pool: WorkerPool,
    pub metrics: Arc<GatewayMetrics>,
    timestamp_pattern: Regex,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
}

impl AppContext {
    /// Production context fetching scripts over HTTP. Must be called within
    /// a tokio runtime.
    pub fn bootstrap(
        config: AppConfig,
        engine: Arc<dyn SolvingEngine>,
    ) -> Result<Self, GatewayError> {
        let source = HttpSource::new(config.fetcher.request_timeout)?;
        Self::with_source(config, engine, Arc::new(source))
    }

    pub fn with_source(
        config: AppConfig,
        engine: Arc<dyn SolvingEngine>,
        source: Arc<dyn ScriptSource>,
    ) -> Result<Self, GatewayError> {
        let metrics = Arc::new(GatewayMetrics::new());
        let cache = &config.cache;

        let scripts = DiskCache::new(cache.scripts_store())?;
        let preprocessed = DiskCache::new(cache.processed_store())?;
        let fetcher = ContentFetcher::new(
            source,
            scripts.clone(),
            config.fetcher.settings(cache),
            metrics.clone(),
        )?;
        let pool = WorkerPool::new(config.worker.pool_config(), engine, metrics.clone());
        let timestamp_pattern =
            Regex::new(TIMESTAMP_PATTERN).map_err(|e| GatewayError::Internal(e.to_string()))?;

        info!(
            "Gateway context ready: cache dir {:?}, {} workers, queue {}",
            cache.cache_dir,
            pool.config().pool_size,
            pool.config().max_queue_size
        );

        Ok(Self {
            preprocessed_memory: MemoryCache::new(cache.memory_cache_size, cache.processed_ttl),
            signatures: MemoryCache::new(cache.memory_cache_size, cache.signature_ttl),
            timestamps: MemoryCache::new(cache.memory_cache_size, cache.timestamp_ttl),
            config,
            fetcher,
            scripts,
            preprocessed,
            pool,
            metrics,
            timestamp_pattern,
            maintenance: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn timestamp_pattern(&self) -> &Regex {
        &self.timestamp_pattern
    }

    /// Starts the periodic expiry sweep of both disk stores
    pub fn start_maintenance(&self) {
        let period = self.config.cache.sweep_interval;
        let mut tasks = self.maintenance.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.scripts.spawn_sweeper(period));
        tasks.push(self.preprocessed.spawn_sweeper(period));
        info!("Cache sweep scheduled every {:?}", period);
    }

    /// Stops background work, rejects outstanding solver tasks and writes
    /// pending cache metadata
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        self.pool.shutdown().await;
        self.scripts.flush().await;
        self.preprocessed.flush().await;
        info!("Gateway shut down");
    }
}
