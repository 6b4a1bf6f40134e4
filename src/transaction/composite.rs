//! 组合事务：在私有队列上按顺序驱动一组子事务
//! Composite transaction: drives a list of children in order on a private queue

use super::{GattOperation, Transaction, TransactionContext};
use crate::{
    queue::SerialExecutionQueue,
    result::{TransactionResult, TransactionStatus},
    state::GattState,
};
use async_trait::async_trait;
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// Runs child transactions strictly in order under one outward result.
///
/// The children are committed on a private [`SerialExecutionQueue`] so that
/// they never wait behind the connection queue that is running the composite
/// itself. The first non-successful child aborts the rest, and the overall
/// result carries every child result collected so far. An empty composite
/// fails immediately.
///
/// Children never outlive the composite: their deadline is capped at the
/// composite's, and a timed-out composite returns only once the running
/// child has finished its own timeout handling.
///
/// 在同一个对外结果下严格按顺序运行子事务。子事务在私有队列上提交，因此不会排在正在运行
/// 组合事务本身的连接队列之后。第一个未成功的子事务会中止其余子事务，总结果携带迄今为止
/// 收集的所有子结果。空的组合事务立即失败。子事务的期限不会超过组合事务的期限，
/// 超时的组合事务要等正在运行的子事务完成其超时处理后才返回。
pub struct CompositeOperation {
    children: Vec<Arc<Transaction>>,
    run: Mutex<Option<Arc<ChildRun>>>,
}

impl std::fmt::Debug for CompositeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeOperation")
            .field("children", &self.children)
            .finish()
    }
}

impl CompositeOperation {
    pub fn new(children: Vec<Transaction>) -> Self {
        Self {
            children: children.into_iter().map(Arc::new).collect(),
            run: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[async_trait]
impl GattOperation for CompositeOperation {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn target_state(&self) -> GattState {
        GattState::Idle
    }

    /// The whole chain must finish within the base timeout times the child count.
    fn timeout_scale(&self) -> u32 {
        u32::try_from(self.children.len()).unwrap_or(u32::MAX)
    }

    fn requires_connection(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &TransactionContext) {
        if self.children.is_empty() {
            warn!(tx = ctx.transaction_id(), "Composite transaction has no children");
            ctx.complete(TransactionResult::new(TransactionStatus::Failure, ctx.gatt_state()));
            return;
        }

        let run = Arc::new(ChildRun {
            children: self.children.clone(),
            results: Mutex::new(Vec::with_capacity(self.children.len())),
            queue: SerialExecutionQueue::new(format!("composite-{}", ctx.transaction_id())),
            ctx: ctx.clone(),
            finished: AtomicBool::new(false),
            running: AsyncMutex::new(()),
        });
        *self.run.lock().unwrap_or_else(PoisonError::into_inner) = Some(run.clone());
        ChildRun::schedule(&run, 0);
    }

    async fn on_timeout(&self, ctx: &TransactionContext) {
        let run = self.run.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(run) = run {
            debug!(tx = ctx.transaction_id(), "Abandoning composite children after timeout");
            run.abandon().await;
        }
    }
}

/// Progress of one composite execution.
struct ChildRun {
    children: Vec<Arc<Transaction>>,
    results: Mutex<Vec<TransactionResult>>,
    queue: SerialExecutionQueue,
    ctx: TransactionContext,
    finished: AtomicBool,
    /// Held by a child job for as long as it runs on the private queue.
    running: AsyncMutex<()>,
}

impl ChildRun {
    fn schedule(run: &Arc<Self>, index: usize) {
        let Some(child) = run.children.get(index).cloned() else {
            return;
        };
        let this = run.clone();
        let enqueued = run.queue.enqueue(async move {
            let _running = this.running.lock().await;
            if this.finished.load(Ordering::Acquire) {
                return;
            }
            let on_result = this.clone();
            let committed = child
                .commit_within(Some(this.ctx.deadline()), move |result| {
                    on_result.on_child_result(index, result)
                })
                .await;
            if let Err(err) = committed {
                warn!(tx = this.ctx.transaction_id(), child = index, %err, "Composite child could not be committed");
                this.finish(TransactionStatus::Failure);
            }
        });
        if let Err(err) = enqueued {
            warn!(tx = run.ctx.transaction_id(), %err, "Composite queue refused child");
            run.finish(TransactionStatus::Failure);
        }
    }

    fn on_child_result(self: &Arc<Self>, index: usize, result: TransactionResult) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let success = result.is_success();
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result);

        if !success {
            self.finish(TransactionStatus::Failure);
        } else if index + 1 < self.children.len() {
            Self::schedule(self, index + 1);
        } else {
            self.finish(TransactionStatus::Success);
        }
    }

    /// Delivers the overall result once and stops the private queue.
    fn finish(&self, status: TransactionStatus) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.stop();
        let sub_results = std::mem::take(&mut *self.results.lock().unwrap_or_else(PoisonError::into_inner));
        self.ctx.complete(
            TransactionResult::builder(status, self.ctx.gatt_state())
                .sub_results(sub_results)
                .build(),
        );
    }

    /// Discards the remaining children and waits for the running one to end.
    ///
    /// Its deadline is the composite's, so it is already timing out.
    async fn abandon(&self) {
        self.finished.store(true, Ordering::Release);
        self.queue.stop();
        drop(self.running.lock().await);
    }
}
