//! Worker pool scheduler.
//!
//! The pool owns the fleet of worker processes and multiplexes requests
//! over them. Idle workers park in a bounded FIFO channel; dispatch draws
//! one, runs the turn on its own task so the caller can race a deadline,
//! and either re-enqueues the worker or schedules a replacement.

use crate::config::{PhpConfig, PoolConfig};
use crate::error::{MembraneError, Result};
use crate::pool::worker::{TurnOutcome, TurnReply, Worker, WorkerState};
use crate::protocol::message::{self, RequestHeaders, ResponseHeaders};
use crate::protocol::wire::{Frame, TYPE_RESPONSE, TYPE_STREAM_DATA};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinError;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Watchdog period for health checks and auto-scaling.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Poll interval while waiting for an old worker to drain during reload.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Busy-ratio thresholds for auto-scaling, in percent.
const SCALE_UP_PCT: f64 = 80.0;
const SCALE_DOWN_PCT: f64 = 20.0;

/// A scale decision for one watchdog tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScaleAction {
    Up,
    Down,
    Hold,
}

fn scale_decision(busy: usize, total: usize, min: usize, max: usize) -> ScaleAction {
    if total == 0 {
        return ScaleAction::Hold;
    }
    let busy_pct = busy as f64 / total as f64 * 100.0;
    if busy_pct >= SCALE_UP_PCT && total < max {
        ScaleAction::Up
    } else if busy_pct <= SCALE_DOWN_PCT && total > min {
        ScaleAction::Down
    } else {
        ScaleAction::Hold
    }
}

/// Point-in-time pool metrics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_workers: usize,
    pub active_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    pub total_requests: u64,
    pub queue_depth: usize,
}

/// Pool of PHP worker processes.
pub struct Pool {
    cfg: PoolConfig,
    php: PhpConfig,

    workers: RwLock<Vec<Arc<Worker>>>,
    available_tx: mpsc::Sender<Arc<Worker>>,
    available_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Worker>>>,
    next_id: AtomicU32,

    cancel: CancellationToken,
    stopping: AtomicBool,

    total_requests: AtomicU64,
    active_workers: AtomicU32,
    busy_workers: AtomicU32,
}

/// Decrements the busy counter on every exit path of a dispatch.
struct BusyGuard<'a>(&'a AtomicU32);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Pool {
    /// Create a new worker pool with the given configuration.
    pub fn new(cfg: PoolConfig, php: PhpConfig) -> Arc<Self> {
        // Headroom above max_workers: during a reload the fleet briefly
        // holds both the old workers and the fresh minimum.
        let capacity = (cfg.max_workers + cfg.min_workers).max(1);
        let (available_tx, available_rx) = mpsc::channel(capacity);

        Arc::new(Self {
            cfg,
            php,
            workers: RwLock::new(Vec::new()),
            available_tx,
            available_rx: tokio::sync::Mutex::new(available_rx),
            next_id: AtomicU32::new(0),
            cancel: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            total_requests: AtomicU64::new(0),
            active_workers: AtomicU32::new(0),
            busy_workers: AtomicU32::new(0),
        })
    }

    /// Spawn the minimum number of workers and start the watchdog.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(
            min_workers = self.cfg.min_workers,
            max_workers = self.cfg.max_workers,
            max_jobs = self.cfg.max_jobs,
            max_memory = %self.cfg.max_memory,
            "starting worker pool"
        );

        for _ in 0..self.cfg.min_workers {
            let worker = self.spawn_worker().await?;
            self.enqueue(worker);
        }

        self.start_watchdog();
        Ok(())
    }

    /// Dispatch a request to an available worker and return the decoded
    /// response.
    pub async fn exec(
        self: &Arc<Self>,
        headers: RequestHeaders,
        body: Vec<u8>,
    ) -> Result<(ResponseHeaders, Vec<u8>)> {
        let frame = message::encode_request(&headers, body)?;
        let reply = self.dispatch(frame, TYPE_RESPONSE).await?;
        let (response, response_body) = message::decode_response(reply)?;
        Ok((response, response_body))
    }

    /// Forward a stream frame to a worker and return its reply frame.
    ///
    /// Used by the WebSocket registry; the reply must be STREAM_DATA.
    pub async fn forward(self: &Arc<Self>, frame: Frame) -> Result<Frame> {
        self.dispatch(frame, TYPE_STREAM_DATA).await
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame, expected: u8) -> Result<Frame> {
        let worker = self.acquire().await?;
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.busy_workers.fetch_add(1, Ordering::Relaxed);
        let _busy = BusyGuard(&self.busy_workers);

        // The turn runs on its own task so a hung worker cannot pin the
        // caller past the deadline.
        let mut turn = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.exec(frame, expected).await })
        };

        let request_timeout = self.cfg.request_timeout.get();
        let outcome: Result<TurnOutcome> = if !self.cfg.request_timeout.is_zero() {
            tokio::select! {
                res = &mut turn => flatten_join(res),
                _ = tokio::time::sleep(request_timeout) => {
                    warn!(
                        worker_id = worker.id(),
                        timeout = ?request_timeout,
                        "worker request timeout"
                    );
                    worker.kill_process();
                    self.schedule_replace(worker);
                    return Err(MembraneError::RequestTimeout {
                        elapsed: request_timeout,
                    });
                }
                _ = self.cancel.cancelled() => {
                    return Err(MembraneError::Shutdown);
                }
            }
        } else {
            flatten_join(turn.await)
        };

        match outcome {
            Ok(TurnOutcome { reply, ready }) => {
                let recycle = (self.cfg.max_jobs > 0 && worker.jobs() >= self.cfg.max_jobs)
                    || !ready;
                if recycle {
                    debug!(
                        worker_id = worker.id(),
                        jobs = worker.jobs(),
                        ready,
                        "recycling worker after turn"
                    );
                    self.schedule_replace(worker);
                } else {
                    self.enqueue(worker);
                }
                match reply {
                    TurnReply::Response(frame) => Ok(frame),
                    TurnReply::Reported(msg) => Err(MembraneError::WorkerReported(msg)),
                }
            }
            Err(e) => {
                error!(worker_id = worker.id(), error = %e, "worker turn failed");
                self.schedule_replace(worker);
                Err(e)
            }
        }
    }

    /// Draw an idle worker from the availability queue within the allocate
    /// deadline.
    async fn acquire(&self) -> Result<Arc<Worker>> {
        let allocate = self.cfg.allocate_timeout.get();
        let drawn = timeout(allocate, async {
            loop {
                let worker = tokio::select! {
                    w = async { self.available_rx.lock().await.recv().await } => w,
                    _ = self.cancel.cancelled() => return Err(MembraneError::Shutdown),
                };
                match worker {
                    Some(w) if w.state() != WorkerState::Stopped => return Ok(w),
                    Some(w) => {
                        // A reload or replacement stopped it while parked.
                        trace!(worker_id = w.id(), "discarding stopped worker from queue");
                    }
                    None => return Err(MembraneError::Shutdown),
                }
            }
        })
        .await;

        match drawn {
            Ok(result) => result,
            Err(_elapsed) => Err(MembraneError::PoolExhausted { waited: allocate }),
        }
    }

    fn enqueue(&self, worker: Arc<Worker>) {
        match self.available_tx.try_send(worker) {
            Ok(()) => {}
            Err(TrySendError::Closed(w)) => {
                trace!(worker_id = w.id(), "pool closed, dropping worker");
            }
            Err(TrySendError::Full(w)) => {
                // The queue is sized past max_workers, so this indicates a
                // bookkeeping bug rather than load.
                error!(worker_id = w.id(), "availability queue full, recycling worker");
                w.kill_process();
            }
        }
    }

    async fn spawn_worker(self: &Arc<Self>) -> Result<Arc<Worker>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let env = self.build_env();
        let worker = Worker::spawn(id, &self.php.binary, &self.php.worker, &env).await?;
        self.workers
            .write()
            .expect("worker set lock poisoned")
            .push(Arc::clone(&worker));
        self.active_workers.fetch_add(1, Ordering::Relaxed);
        debug!(worker_id = id, "worker spawned");
        Ok(worker)
    }

    /// Environment handed to every worker process on top of the parent
    /// environment.
    fn build_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if self.cfg.max_jobs > 0 {
            env.push(("MAX_REQUESTS".to_string(), self.cfg.max_jobs.to_string()));
        }
        for (key, value) in &self.php.ini {
            env.push((format!("PHP_INI_{}", key), value.clone()));
        }
        env
    }

    fn schedule_replace(self: &Arc<Self>, old: Arc<Worker>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.replace_worker(old).await;
        });
    }

    async fn replace_worker(self: &Arc<Self>, old: Arc<Worker>) {
        // A worker can be nominated by both the dispatcher and the
        // watchdog; only the removal winner spawns a replacement.
        if !self.remove_worker(&old) {
            return;
        }
        debug!(worker_id = old.id(), jobs = old.jobs(), "replacing worker");

        if let Err(e) = old.stop().await {
            warn!(worker_id = old.id(), error = %e, "error stopping outgoing worker");
        }

        if self.cancel.is_cancelled() {
            return;
        }
        match self.spawn_worker().await {
            Ok(worker) => self.enqueue(worker),
            Err(e) => error!(error = %e, "failed to spawn replacement worker"),
        }
    }

    /// Remove a worker from the live set. Returns false when it was already
    /// gone.
    fn remove_worker(&self, target: &Arc<Worker>) -> bool {
        let mut workers = self.workers.write().expect("worker set lock poisoned");
        match workers.iter().position(|w| w.id() == target.id()) {
            Some(pos) => {
                workers.remove(pos);
                self.active_workers.fetch_sub(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn start_watchdog(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(WATCHDOG_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.check_health().await;
                        pool.auto_scale().await;
                    }
                    _ = pool.cancel.cancelled() => return,
                }
            }
        });
    }

    /// Replace workers whose process has died while parked idle.
    async fn check_health(self: &Arc<Self>) {
        let workers: Vec<Arc<Worker>> = self
            .workers
            .read()
            .expect("worker set lock poisoned")
            .clone();

        for worker in workers {
            if worker.state() != WorkerState::Idle {
                continue;
            }
            if !worker.is_alive().await {
                warn!(worker_id = worker.id(), "dead worker detected");
                self.schedule_replace(worker);
            }
        }
    }

    /// One scale event per watchdog tick, based on the busy ratio.
    async fn auto_scale(self: &Arc<Self>) {
        let stats = self.stats();
        match scale_decision(
            stats.busy_workers,
            stats.total_workers,
            self.cfg.min_workers,
            self.cfg.max_workers,
        ) {
            ScaleAction::Up => {
                info!(
                    busy = stats.busy_workers,
                    total = stats.total_workers,
                    "scaling up worker pool"
                );
                match self.spawn_worker().await {
                    Ok(worker) => self.enqueue(worker),
                    Err(e) => error!(error = %e, "scale-up failed"),
                }
            }
            ScaleAction::Down => {
                // Only retire a worker that is idle right now.
                let idle = match self.available_rx.try_lock() {
                    Ok(mut rx) => rx.try_recv().ok(),
                    Err(_) => None,
                };
                if let Some(worker) = idle {
                    if worker.state() == WorkerState::Stopped {
                        return;
                    }
                    info!(
                        busy = stats.busy_workers,
                        total = stats.total_workers,
                        worker_id = worker.id(),
                        "scaling down worker pool"
                    );
                    let pool = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = worker.stop().await {
                            warn!(worker_id = worker.id(), error = %e, "error stopping worker");
                        }
                        pool.remove_worker(&worker);
                    });
                }
            }
            ScaleAction::Hold => {}
        }
    }

    /// Gracefully replace all workers (zero-downtime restart).
    ///
    /// Fresh workers are spawned and enqueued before any old worker is
    /// touched; old workers drain on a detached task once idle.
    pub async fn reload(self: &Arc<Self>) -> Result<()> {
        info!("graceful reload starting");

        let old: Vec<Arc<Worker>> = self
            .workers
            .read()
            .expect("worker set lock poisoned")
            .clone();

        let mut fresh: Vec<Arc<Worker>> = Vec::with_capacity(self.cfg.min_workers);
        for _ in 0..self.cfg.min_workers {
            match self.spawn_worker().await {
                Ok(worker) => {
                    fresh.push(Arc::clone(&worker));
                    self.enqueue(worker);
                }
                Err(e) => {
                    error!(error = %e, "reload: failed to spawn new worker, rolling back");
                    for worker in fresh {
                        let _ = worker.stop().await;
                        self.remove_worker(&worker);
                    }
                    return Err(e);
                }
            }
        }
        info!(count = fresh.len(), "reload: new workers ready");

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            for worker in &old {
                while worker.state() == WorkerState::Busy {
                    tokio::time::sleep(DRAIN_POLL).await;
                }
                if let Err(e) = worker.stop().await {
                    warn!(worker_id = worker.id(), error = %e, "reload: error stopping old worker");
                }
                pool.remove_worker(worker);
            }
            info!(stopped = old.len(), "graceful reload complete");
        });

        Ok(())
    }

    /// Shut down all workers and close the availability queue. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("stopping worker pool");
        self.cancel.cancel();

        let workers: Vec<Arc<Worker>> = {
            let mut guard = self.workers.write().expect("worker set lock poisoned");
            std::mem::take(&mut *guard)
        };

        let results =
            futures_util::future::join_all(workers.iter().map(|w| w.stop())).await;
        for (worker, result) in workers.iter().zip(results) {
            if let Err(e) = result {
                warn!(worker_id = worker.id(), error = %e, "error stopping worker");
            }
        }
        self.active_workers.store(0, Ordering::Relaxed);

        let mut rx = self.available_rx.lock().await;
        rx.close();
        while rx.try_recv().is_ok() {}

        info!("worker pool stopped");
        Ok(())
    }

    /// Snapshot of the pool counters. Non-blocking.
    pub fn stats(&self) -> PoolStats {
        let total = self.workers.read().expect("worker set lock poisoned").len();
        let busy = self.busy_workers.load(Ordering::Relaxed) as usize;
        PoolStats {
            total_workers: total,
            active_workers: self.active_workers.load(Ordering::Relaxed) as usize,
            busy_workers: busy,
            idle_workers: total.saturating_sub(busy),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            queue_depth: self.available_tx.max_capacity() - self.available_tx.capacity(),
        }
    }
}

fn flatten_join(res: std::result::Result<Result<TurnOutcome>, JoinError>) -> Result<TurnOutcome> {
    match res {
        Ok(outcome) => outcome,
        Err(e) => Err(MembraneError::Io(std::io::Error::other(e))),
    }
}
