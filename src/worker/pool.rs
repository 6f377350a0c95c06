// Worker pool event loop: owns workers, the task queue and all timers
use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::engine::{CancelToken, SolveResult, SolverInput, SolverOutput, SolvingEngine};
use super::{PoolError, PoolStats, WorkerPoolConfig};
use crate::metrics::GatewayMetrics;

pub(crate) type Reply = oneshot::Sender<Result<SolveResult, PoolError>>;

/// Everything the loop reacts to: handle requests, worker reports, timers
pub(crate) enum PoolEvent {
    Exec { input: SolverInput, reply: Reply },
    Completed { worker_id: u64, task_id: u64, outcome: WorkerOutcome },
    TimedOut { worker_id: u64, task_id: u64 },
    Respawn,
    /// A worker thread ended and no longer counts against the pool size
    WorkerExited,
    Stats { reply: oneshot::Sender<PoolStats> },
    Shutdown { done: oneshot::Sender<()> },
}

pub(crate) enum WorkerOutcome {
    Finished(SolverOutput),
    /// The engine panicked; the worker thread is gone
    Crashed(String),
}

/// State shared by the pool handle, every loop it starts and all worker
/// threads, including threads retired by an earlier loop
#[derive(Default)]
pub(crate) struct PoolShared {
    live_threads: AtomicUsize,
    events: Mutex<Option<mpsc::UnboundedSender<PoolEvent>>>,
}

impl PoolShared {
    pub(crate) fn live_threads(&self) -> usize {
        self.live_threads.load(Ordering::SeqCst)
    }

    pub(crate) fn lock_events(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<PoolEvent>>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends to whichever loop is current, if any
    fn notify(&self, event: PoolEvent) {
        if let Some(tx) = self.lock_events().as_ref() {
            let _ = tx.send(event);
        }
    }
}

/// Held by a worker thread for its whole life
struct LiveThread(Arc<PoolShared>);

impl Drop for LiveThread {
    fn drop(&mut self) {
        self.0.live_threads.fetch_sub(1, Ordering::SeqCst);
        self.0.notify(PoolEvent::WorkerExited);
    }
}

struct Job {
    task_id: u64,
    input: SolverInput,
    cancel: CancelToken,
}

struct QueuedTask {
    id: u64,
    input: SolverInput,
    reply: Reply,
}

struct ActiveTask {
    id: u64,
    reply: Reply,
    timer: JoinHandle<()>,
    cancel: CancelToken,
}

struct Worker {
    jobs: std_mpsc::Sender<Job>,
    active: Option<ActiveTask>,
}

pub(crate) struct PoolLoop {
    config: WorkerPoolConfig,
    engine: Arc<dyn SolvingEngine>,
    metrics: Arc<GatewayMetrics>,
    shared: Arc<PoolShared>,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    events_rx: mpsc::UnboundedReceiver<PoolEvent>,
    workers: BTreeMap<u64, Worker>,
    queue: VecDeque<QueuedTask>,
    next_task_id: u64,
    next_worker_id: u64,
    // Slots held back for crashed workers until their delayed replacement
    pending_respawns: usize,
}

impl PoolLoop {
    pub(crate) fn new(
        config: WorkerPoolConfig,
        engine: Arc<dyn SolvingEngine>,
        metrics: Arc<GatewayMetrics>,
        shared: Arc<PoolShared>,
    ) -> (Self, mpsc::UnboundedSender<PoolEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pool = Self {
            config,
            engine,
            metrics,
            shared,
            events_tx: events_tx.clone(),
            events_rx,
            workers: BTreeMap::new(),
            queue: VecDeque::new(),
            next_task_id: 0,
            next_worker_id: 0,
            pending_respawns: 0,
        };
        (pool, events_tx)
    }

    pub(crate) async fn run(mut self) {
        info!(
            "Worker pool started (size: {}, queue: {}, timeout: {:?})",
            self.config.pool_size, self.config.max_queue_size, self.config.task_timeout
        );

        while let Some(event) = self.events_rx.recv().await {
            match event {
                PoolEvent::Exec { input, reply } => self.on_exec(input, reply),
                PoolEvent::Completed { worker_id, task_id, outcome } => {
                    self.on_completed(worker_id, task_id, outcome)
                }
                PoolEvent::TimedOut { worker_id, task_id } => self.on_timeout(worker_id, task_id),
                PoolEvent::Respawn => self.on_respawn(),
                PoolEvent::WorkerExited => self.dispatch(),
                PoolEvent::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                PoolEvent::Shutdown { done } => {
                    self.shutdown();
                    let _ = done.send(());
                    break;
                }
            }
        }

        info!("Worker pool stopped");
    }

    fn on_exec(&mut self, input: SolverInput, reply: Reply) {
        if self.queue.len() >= self.config.max_queue_size {
            let _ = reply.send(Err(PoolError::QueueFull));
            return;
        }

        self.next_task_id += 1;
        self.queue.push_back(QueuedTask {
            id: self.next_task_id,
            input,
            reply,
        });
        self.dispatch();
    }

    /// Binds queued tasks to idle workers, oldest task first, creating
    /// workers lazily up to the pool size
    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let worker_id = match self.idle_worker().or_else(|| self.spawn_worker()) {
                Some(id) => id,
                None => break,
            };
            let Some(task) = self.queue.pop_front() else {
                break;
            };

            let cancel = CancelToken::new();
            let job = Job {
                task_id: task.id,
                input: task.input,
                cancel: cancel.clone(),
            };
            let sent = match self.workers.get(&worker_id) {
                Some(worker) => worker.jobs.send(job),
                None => Err(std_mpsc::SendError(job)),
            };
            if let Err(std_mpsc::SendError(job)) = sent {
                // Worker thread already gone: drop it and requeue the task
                warn!("Worker {} is unreachable, discarding it", worker_id);
                self.workers.remove(&worker_id);
                self.queue.push_front(QueuedTask {
                    id: job.task_id,
                    input: job.input,
                    reply: task.reply,
                });
                continue;
            }

            let timer = self.start_timer(worker_id, task.id);
            if let Some(worker) = self.workers.get_mut(&worker_id) {
                worker.active = Some(ActiveTask {
                    id: task.id,
                    reply: task.reply,
                    timer,
                    cancel,
                });
            }
            self.metrics.record_engine_invocation();
            debug!("Task {} bound to worker {}", task.id, worker_id);
        }
    }

    fn idle_worker(&self) -> Option<u64> {
        self.workers
            .iter()
            .find(|(_, worker)| worker.active.is_none())
            .map(|(id, _)| *id)
    }

    /// Retired threads that are still running count against the pool size
    fn spawn_worker(&mut self) -> Option<u64> {
        let occupied = self.shared.live_threads() + self.pending_respawns;
        if occupied >= self.config.pool_size {
            return None;
        }

        self.next_worker_id += 1;
        let worker_id = self.next_worker_id;
        let (jobs_tx, jobs_rx) = std_mpsc::channel::<Job>();
        let engine = self.engine.clone();
        let events = self.events_tx.clone();
        let shared = self.shared.clone();

        self.shared.live_threads.fetch_add(1, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name(format!("solver-worker-{}", worker_id))
            .spawn(move || {
                let _live = LiveThread(shared);
                worker_main(worker_id, engine, jobs_rx, events)
            });

        match spawned {
            Ok(_) => {
                debug!("Spawned worker {}", worker_id);
                self.workers.insert(
                    worker_id,
                    Worker {
                        jobs: jobs_tx,
                        active: None,
                    },
                );
                Some(worker_id)
            }
            Err(e) => {
                self.shared.live_threads.fetch_sub(1, Ordering::SeqCst);
                error!("Failed to spawn worker thread: {}", e);
                self.schedule_respawn();
                None
            }
        }
    }

    fn start_timer(&self, worker_id: u64, task_id: u64) -> JoinHandle<()> {
        let events = self.events_tx.clone();
        let timeout = self.config.task_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(PoolEvent::TimedOut { worker_id, task_id });
        })
    }

    fn on_completed(&mut self, worker_id: u64, task_id: u64, outcome: WorkerOutcome) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            debug!("Ignoring result from retired worker {}", worker_id);
            return;
        };
        if worker.active.as_ref().map(|task| task.id) != Some(task_id) {
            debug!("Ignoring stale result for task {} on worker {}", task_id, worker_id);
            return;
        }
        let Some(task) = worker.active.take() else {
            return;
        };
        task.timer.abort();

        match outcome {
            WorkerOutcome::Finished(SolverOutput::Result(result)) => {
                let _ = task.reply.send(Ok(result));
            }
            WorkerOutcome::Finished(SolverOutput::Error { message }) => {
                let _ = task.reply.send(Err(PoolError::Engine(message)));
            }
            WorkerOutcome::Crashed(message) => {
                warn!("Worker {} crashed on task {}: {}", worker_id, task_id, message);
                let _ = task.reply.send(Err(PoolError::WorkerFault(message)));
                self.workers.remove(&worker_id);
                self.schedule_respawn();
            }
        }

        self.dispatch();
    }

    fn on_timeout(&mut self, worker_id: u64, task_id: u64) {
        let bound = self
            .workers
            .get(&worker_id)
            .and_then(|worker| worker.active.as_ref())
            .map(|task| task.id);
        if bound != Some(task_id) {
            return;
        }

        warn!(
            "Task {} on worker {} exceeded {:?}, retiring worker",
            task_id, worker_id, self.config.task_timeout
        );
        self.metrics.record_engine_timeout();

        // Dropping the worker closes its job channel. The thread keeps its
        // pool slot until the cancelled call returns; a late result is ignored
        if let Some(mut worker) = self.workers.remove(&worker_id) {
            if let Some(task) = worker.active.take() {
                task.cancel.cancel();
                let _ = task.reply.send(Err(PoolError::Timeout(self.config.task_timeout)));
            }
        }

        self.dispatch();
    }

    fn schedule_respawn(&mut self) {
        self.pending_respawns += 1;
        let events = self.events_tx.clone();
        let delay = self.config.respawn_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(PoolEvent::Respawn);
        });
    }

    fn on_respawn(&mut self) {
        self.pending_respawns = self.pending_respawns.saturating_sub(1);
        if self.spawn_worker().is_some() {
            self.dispatch();
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers.len(),
            busy: self.workers.values().filter(|w| w.active.is_some()).count(),
            queued: self.queue.len(),
        }
    }

    fn shutdown(&mut self) {
        let in_flight = self.workers.values().filter(|w| w.active.is_some()).count();
        info!(
            "Shutting down worker pool ({} workers, {} in flight, {} queued)",
            self.workers.len(),
            in_flight,
            self.queue.len()
        );

        for (_, mut worker) in std::mem::take(&mut self.workers) {
            if let Some(task) = worker.active.take() {
                task.timer.abort();
                task.cancel.cancel();
                let _ = task.reply.send(Err(PoolError::Shutdown));
            }
        }
        for task in self.queue.drain(..) {
            let _ = task.reply.send(Err(PoolError::Shutdown));
        }
        self.pending_respawns = 0;
    }
}

fn worker_main(
    worker_id: u64,
    engine: Arc<dyn SolvingEngine>,
    jobs: std_mpsc::Receiver<Job>,
    events: mpsc::UnboundedSender<PoolEvent>,
) {
    while let Ok(job) = jobs.recv() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| engine.solve(&job.input, &job.cancel)));

        let (outcome, crashed) = match result {
            Ok(output) => (WorkerOutcome::Finished(output), false),
            Err(payload) => (WorkerOutcome::Crashed(panic_message(payload.as_ref())), true),
        };

        let sent = events.send(PoolEvent::Completed {
            worker_id,
            task_id: job.task_id,
            outcome,
        });
        if sent.is_err() || crashed {
            break;
        }
    }
    debug!("Worker {} thread exiting", worker_id);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
