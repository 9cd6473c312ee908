//! Fixed-size worker pool running the line-ending normalizer.
//!
//! Tasks travel over a bounded crossbeam queue, results come back over a
//! second queue tagged with the task's correlation id. A collector thread
//! routes each result to the handle that is waiting for it, so completion
//! order does not matter.

use super::normalizer::{normalize_file, WriteMode};
use super::FileOutcome;
use crate::error::PoolError;
use crate::utils::config::default_sync_workers;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long shutdown waits for workers before leaving them detached.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Queue slots per worker before `submit` applies backpressure.
const QUEUE_DEPTH_PER_WORKER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    fn generate() -> Self {
        TaskId(crate::utils::random_u64())
    }
}

#[derive(Debug, Clone)]
pub struct ConversionTask {
    pub id: TaskId,
    pub src: PathBuf,
    pub dst: PathBuf,
    pub mode: WriteMode,
}

#[derive(Debug)]
enum WorkItem {
    Task(ConversionTask),
    Shutdown,
}

#[derive(Debug)]
struct TaskResult {
    task_id: TaskId,
    worker_id: usize,
    outcome: FileOutcome,
}

type PendingMap = Arc<Mutex<HashMap<TaskId, Sender<FileOutcome>>>>;

struct WorkerHandle {
    id: usize,
    handle: JoinHandle<()>,
}

/// Caller-held handle for one submitted conversion.
#[derive(Debug)]
pub struct ConversionHandle {
    id: TaskId,
    src: PathBuf,
    dst: PathBuf,
    receiver: Receiver<FileOutcome>,
}

impl ConversionHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn src(&self) -> &Path {
        &self.src
    }

    pub fn dst(&self) -> &Path {
        &self.dst
    }

    /// Block until the worker reports. `Cancelled` if the task was dropped first.
    pub fn wait(&self) -> Result<FileOutcome, PoolError> {
        self.receiver.recv().map_err(|_| PoolError::Cancelled)
    }

    /// Like `wait`, but gives up after `timeout` with `Ok(None)`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<FileOutcome>, PoolError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PoolError::Cancelled),
        }
    }
}

pub struct ConversionPool {
    num_workers: usize,
    work_sender: Sender<WorkItem>,
    pending: PendingMap,
    workers: Mutex<Vec<WorkerHandle>>,
    exited_receiver: Receiver<usize>,
    shutting_down: AtomicBool,
}

impl ConversionPool {
    /// Start a pool with `num_workers` threads (0 = auto). The size never changes afterwards.
    pub fn new(num_workers: usize) -> Result<Self, PoolError> {
        let num_workers = if num_workers == 0 {
            default_sync_workers()
        } else {
            num_workers
        };

        // Bounded channels for backpressure control
        let (work_sender, work_receiver) = bounded::<WorkItem>(num_workers * QUEUE_DEPTH_PER_WORKER);
        let (result_sender, result_receiver) = bounded::<TaskResult>(num_workers * 4);
        let (exited_sender, exited_receiver) = bounded::<usize>(num_workers);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        debug!("Starting conversion pool with {} workers", num_workers);

        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let work_receiver = work_receiver.clone();
            let result_sender = result_sender.clone();
            let exited_sender = exited_sender.clone();
            let pending = pending.clone();

            let handle = std::thread::Builder::new()
                .name(format!("sync-worker-{}", worker_id))
                .spawn(move || {
                    worker_loop(worker_id, work_receiver, result_sender, pending);
                    let _ = exited_sender.send(worker_id);
                })?;

            workers.push(WorkerHandle { id: worker_id, handle });
        }

        // Collector exits once every worker has dropped its result sender
        drop(result_sender);
        let collector_pending = pending.clone();
        std::thread::Builder::new()
            .name("sync-collector".to_string())
            .spawn(move || process_results(result_receiver, collector_pending))?;

        Ok(Self {
            num_workers,
            work_sender,
            pending,
            workers: Mutex::new(workers),
            exited_receiver,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Number of submitted tasks whose result has not been delivered yet.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queue a conversion. Returns immediately unless the queue is full.
    pub fn submit(&self, src: PathBuf, dst: PathBuf, mode: WriteMode) -> Result<ConversionHandle, PoolError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }

        let id = TaskId::generate();
        let (sender, receiver) = bounded(1);
        self.pending.lock().insert(id, sender);

        let task = ConversionTask {
            id,
            src: src.clone(),
            dst: dst.clone(),
            mode,
        };
        if self.work_sender.send(WorkItem::Task(task)).is_err() {
            self.pending.lock().remove(&id);
            return Err(PoolError::Disconnected);
        }

        Ok(ConversionHandle { id, src, dst, receiver })
    }

    /// Convenience wrapper: submit and block for the outcome.
    pub fn convert(&self, src: PathBuf, dst: PathBuf, mode: WriteMode) -> Result<FileOutcome, PoolError> {
        self.submit(src, dst, mode)?.wait()
    }

    /// Drop the given tasks if still unresolved, leaving other callers' work alone.
    /// Returns how many were actually cancelled.
    pub fn cancel(&self, ids: &[TaskId]) -> usize {
        let mut pending = self.pending.lock();
        let cancelled = ids.iter().filter(|id| pending.remove(id).is_some()).count();
        if cancelled > 0 {
            debug!("Cancelled {} pending conversions", cancelled);
        }
        cancelled
    }

    /// Drop every unresolved task. Queued tasks are skipped by the workers and
    /// their handles resolve to `PoolError::Cancelled`.
    pub fn cancel_pending(&self) -> usize {
        let mut pending = self.pending.lock();
        let cancelled = pending.len();
        pending.clear();
        if cancelled > 0 {
            debug!("Cancelled {} pending conversions", cancelled);
        }
        cancelled
    }

    /// Stop accepting work, signal every worker, and wait a bounded time for them.
    ///
    /// Workers that do not exit in time are left detached. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down conversion pool");

        // Send shutdown signal to all workers
        for _ in 0..self.num_workers {
            let _ = self.work_sender.send_timeout(WorkItem::Shutdown, SHUTDOWN_JOIN_TIMEOUT);
        }

        let deadline = Instant::now() + SHUTDOWN_JOIN_TIMEOUT;
        let mut exited = Vec::with_capacity(self.num_workers);
        while exited.len() < self.num_workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.exited_receiver.recv_timeout(remaining) {
                Ok(worker_id) => exited.push(worker_id),
                Err(_) => break,
            }
        }

        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            if exited.contains(&worker.id) {
                let _ = worker.handle.join();
            } else {
                warn!("Conversion worker {} did not stop in time; detaching", worker.id);
            }
        }
        drop(workers);

        self.cancel_pending();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

impl Drop for ConversionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker loop - runs on its own OS thread
fn worker_loop(
    worker_id: usize,
    work_receiver: Receiver<WorkItem>,
    result_sender: Sender<TaskResult>,
    pending: PendingMap,
) {
    debug!("Conversion worker {} started", worker_id);

    loop {
        match work_receiver.recv() {
            Ok(WorkItem::Task(task)) => {
                // Cancelled before we got to it
                if !pending.lock().contains_key(&task.id) {
                    continue;
                }

                let outcome = normalize_file(&task.src, &task.dst, task.mode);
                if result_sender
                    .send(TaskResult {
                        task_id: task.id,
                        worker_id,
                        outcome,
                    })
                    .is_err()
                {
                    warn!("Conversion worker {}: result channel closed", worker_id);
                    break;
                }
            }
            Ok(WorkItem::Shutdown) => {
                debug!("Conversion worker {} shutting down", worker_id);
                break;
            }
            Err(_) => {
                debug!("Conversion worker {} channel closed", worker_id);
                break;
            }
        }
    }
}

/// Route results from workers to their handles
fn process_results(result_receiver: Receiver<TaskResult>, pending: PendingMap) {
    while let Ok(result) = result_receiver.recv() {
        let sender = pending.lock().remove(&result.task_id);
        match sender {
            Some(sender) => {
                // The caller may have dropped its handle; that is fine
                let _ = sender.send(result.outcome);
            }
            None => debug!(
                "Dropping result of cancelled task {:?} from worker {}",
                result.task_id, result.worker_id
            ),
        }
    }
}
