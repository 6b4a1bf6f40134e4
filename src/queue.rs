//! 串行执行队列
//! Serial Execution Queue
//!
//! 每个队列拥有一个专用工作线程，按FIFO顺序逐个执行工作项，保证同一时刻最多只有
//! 一个工作项在执行。停止后再次入队会隐式重启一个新的工作线程。
//!
//! Every queue owns one dedicated worker thread that executes work items one at
//! a time in FIFO order, so at most one item is ever executing. Enqueuing after
//! a stop implicitly restarts a fresh worker thread.

use crate::error::{Error, Result};
use futures::{
    FutureExt,
    future::BoxFuture,
};
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

/// A unit of work executed by the queue's worker thread.
/// 由队列工作线程执行的工作单元。
pub type Job = BoxFuture<'static, ()>;

/// 单工作线程的FIFO队列
/// Single-worker FIFO queue
#[derive(Debug)]
pub struct SerialExecutionQueue {
    name: String,
    worker: Mutex<Option<Worker>>,
}

#[derive(Debug)]
struct Worker {
    job_tx: mpsc::UnboundedSender<Job>,
    shutdown_tx: oneshot::Sender<()>,
    pending: Arc<AtomicUsize>,
}

impl SerialExecutionQueue {
    /// Creates a stopped queue; the worker thread is spawned lazily.
    ///
    /// 创建一个处于停止状态的队列；工作线程会被延迟创建。
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// (Re)creates the worker thread. Does nothing if one is already running.
    ///
    /// （重新）创建工作线程。如果已在运行则不做任何事。
    pub fn start(&self) -> Result<()> {
        let mut worker = self.lock_worker();
        if worker.as_ref().is_some_and(|w| !w.job_tx.is_closed()) {
            return Ok(());
        }
        *worker = Some(self.spawn_worker()?);
        Ok(())
    }

    /// Discards pending work and tears the worker thread down.
    ///
    /// The item currently executing, if any, is not waited for and may finish
    /// after this call returns.
    ///
    /// 丢弃待执行的工作并关闭工作线程。不会等待正在执行的工作项，它可能在本调用返回后才完成。
    pub fn stop(&self) {
        if let Some(worker) = self.lock_worker().take() {
            debug!(
                queue = %self.name,
                discarded = worker.pending.load(Ordering::Acquire),
                "Stopping execution queue"
            );
            let _ = worker.shutdown_tx.send(());
        }
    }

    /// Appends `work` to the queue, restarting the worker if the queue was stopped.
    ///
    /// 将 `work` 追加到队列中；如果队列已停止，则重启工作线程。
    pub fn enqueue<F>(&self, work: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut job: Job = work.boxed();
        let mut worker = self.lock_worker();

        // A worker whose thread died is replaced once.
        for _ in 0..2 {
            if worker.as_ref().is_none_or(|w| w.job_tx.is_closed()) {
                debug!(queue = %self.name, "Starting execution queue worker");
                *worker = Some(self.spawn_worker()?);
            }
            if let Some(active) = worker.as_ref() {
                active.pending.fetch_add(1, Ordering::AcqRel);
                match active.job_tx.send(job) {
                    Ok(()) => return Ok(()),
                    Err(mpsc::error::SendError(returned)) => {
                        active.pending.fetch_sub(1, Ordering::AcqRel);
                        job = returned;
                        *worker = None;
                    }
                }
            }
        }

        Err(Error::QueueClosed(self.name.clone()))
    }

    /// Whether a worker thread is currently alive.
    pub fn is_running(&self) -> bool {
        self.lock_worker()
            .as_ref()
            .is_some_and(|w| !w.job_tx.is_closed())
    }

    /// Number of items waiting behind the one currently executing.
    ///
    /// 排在当前执行项之后等待的工作项数量。
    pub fn pending(&self) -> usize {
        self.lock_worker()
            .as_ref()
            .map_or(0, |w| w.pending.load(Ordering::Acquire))
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(&self) -> Result<Worker> {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let pending = Arc::new(AtomicUsize::new(0));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let name = self.name.clone();
        let worker_pending = pending.clone();
        std::thread::Builder::new()
            .name(format!("{name}-queue"))
            .spawn(move || {
                let job_name = name.clone();
                runtime.block_on(async move {
                    loop {
                        tokio::select! {
                            biased;
                            // Fires on an explicit stop and when the queue itself is dropped.
                            _ = &mut shutdown_rx => break,
                            job = job_rx.recv() => {
                                let Some(job) = job else { break };
                                worker_pending.fetch_sub(1, Ordering::AcqRel);
                                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                                    error!(queue = %job_name, "Work item panicked; worker continues");
                                }
                            }
                        }
                    }
                });
                trace!(queue = %name, "Execution queue worker exited");
            })?;

        Ok(Worker {
            job_tx,
            shutdown_tx,
            pending,
        })
    }
}
