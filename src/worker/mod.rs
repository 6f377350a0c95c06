// Bounded worker pool for the solving engine
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

pub mod engine;
mod pool;

pub use engine::{
    CancelToken, ChallengeKind, ChallengeRequest, ChallengeResponse, CommandEngine, InputKind, SolveResult,
    SolverInput, SolverOutput, SolvingEngine,
};

use crate::metrics::GatewayMetrics;
use pool::{PoolEvent, PoolLoop, PoolShared};

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub pool_size: usize,
    pub max_queue_size: usize,
    pub task_timeout: Duration,
    /// Delay before a crashed worker is replaced
    pub respawn_delay: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get(),
            max_queue_size: 100,
            task_timeout: Duration::from_secs(10),
            respawn_delay: Duration::from_millis(250),
        }
    }
}

/// Worker pool errors, always surfaced to the caller of `exec`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Task queue is full")]
    QueueFull,
    #[error("Task timed out after {0:?}")]
    Timeout(Duration),
    #[error("Worker crashed: {0}")]
    WorkerFault(String),
    #[error("Worker pool is shut down")]
    Shutdown,
    #[error("Solving engine error: {0}")]
    Engine(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
}

/// Handle to the pool's event loop.
///
/// All worker and queue state lives inside the loop task; this handle only
/// sends it events. Each `exec` gets its own single-use reply channel.
///
/// Worker threads stay counted against `pool_size` until they exit, across
/// timeouts and restarts of the loop.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    engine: Arc<dyn SolvingEngine>,
    metrics: Arc<GatewayMetrics>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Creates the pool and starts its event loop. Must be called within a
    /// tokio runtime.
    pub fn new(
        config: WorkerPoolConfig,
        engine: Arc<dyn SolvingEngine>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let pool = Self {
            config,
            engine,
            metrics,
            shared: Arc::new(PoolShared::default()),
        };
        pool.init_workers();
        pool
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Starts the event loop if it is not running. Workers themselves are
    /// created on demand.
    pub fn init_workers(&self) {
        let mut events = self.lock_events();
        if events.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false) {
            return;
        }

        let (pool, tx) = PoolLoop::new(
            self.config.clone(),
            self.engine.clone(),
            self.metrics.clone(),
            self.shared.clone(),
        );
        tokio::spawn(pool.run());
        *events = Some(tx);
    }

    pub fn is_running(&self) -> bool {
        self.lock_events().as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }

    /// Submits one task and waits for its outcome. Fails fast with
    /// `QueueFull` when the queue is at capacity.
    pub async fn exec(&self, input: SolverInput) -> Result<SolveResult, PoolError> {
        let (reply, outcome) = oneshot::channel();
        self.send(PoolEvent::Exec { input, reply })?;
        outcome.await.map_err(|_| PoolError::Shutdown)?
    }

    pub async fn stats(&self) -> PoolStats {
        let (reply, stats) = oneshot::channel();
        if self.send(PoolEvent::Stats { reply }).is_err() {
            return PoolStats::default();
        }
        stats.await.unwrap_or_default()
    }

    /// Rejects every queued and in-flight task with `Shutdown` and retires
    /// all workers. A no-op when already shut down.
    pub async fn shutdown(&self) {
        let Some(events) = self.lock_events().take() else {
            return;
        };

        let (done, finished) = oneshot::channel();
        if events.send(PoolEvent::Shutdown { done }).is_ok() {
            let _ = finished.await;
        }
        debug!("Worker pool shutdown complete");
    }

    fn send(&self, event: PoolEvent) -> Result<(), PoolError> {
        let events = self.lock_events();
        let tx = events.as_ref().ok_or(PoolError::Shutdown)?;
        tx.send(event).map_err(|_| PoolError::Shutdown)
    }

    fn lock_events(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<PoolEvent>>> {
        self.shared.lock_events()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(events) = self.lock_events().take() {
            let (done, _) = oneshot::channel();
            let _ = events.send(PoolEvent::Shutdown { done });
        }
    }
}
