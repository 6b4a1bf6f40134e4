//! 客户端与服务端连接共享的部分
//! The part shared by client and server connections

use crate::{
    config::Config,
    error::{Error, Result},
    event::{GattEvent, GattEventListener, ListenerId, ListenerSet},
    guard::StateGuard,
    queue::SerialExecutionQueue,
    result::TransactionResult,
    state::GattState,
    transaction::Transaction,
};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, trace};

/// State, queue and listeners of one connection.
///
/// `set_state` is the only place a connection's [`GattState`] is mutated.
///
/// 单个连接的状态、队列和监听器。`set_state` 是修改连接 [`GattState`] 的唯一途径。
#[derive(Debug)]
pub struct ConnectionCore {
    label: String,
    state: Mutex<GattState>,
    queue: SerialExecutionQueue,
    guard: StateGuard,
    config: Arc<Config>,
    /// Listeners of the transactions currently waiting for a radio callback.
    /// 当前正在等待无线电回调的事务的监听器。
    in_flight: ListenerSet<dyn GattEventListener>,
    /// Application listeners for events outside any transaction.
    /// 应用层监听器，接收任何事务之外的事件。
    listeners: ListenerSet<dyn GattEventListener>,
    last_activity: Mutex<Instant>,
}

impl ConnectionCore {
    pub(crate) fn new(label: impl Into<String>, initial: GattState, config: Arc<Config>) -> Self {
        let label = label.into();
        Self {
            queue: SerialExecutionQueue::new(label.clone()),
            label,
            state: Mutex::new(initial),
            guard: StateGuard::new(&config.guard),
            config,
            in_flight: ListenerSet::new(),
            listeners: ListenerSet::new(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// A human readable name used in logs and as the worker thread name.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn gatt_state(&self) -> GattState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 设置连接状态
    /// Sets the connection state
    pub fn set_state(&self, state: GattState) {
        let previous = {
            let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, state)
        };
        if previous != state {
            debug!(connection = %self.label, from = %previous, to = %state, "State changed");
        }
    }

    pub fn queue(&self) -> &SerialExecutionQueue {
        &self.queue
    }

    pub fn guard(&self) -> &StateGuard {
        &self.guard
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn register_listener(&self, listener: Arc<dyn GattEventListener>) -> ListenerId {
        self.listeners.register(listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    pub(crate) fn register_in_flight(&self, listener: Arc<dyn GattEventListener>) -> ListenerId {
        self.in_flight.register(listener)
    }

    pub(crate) fn unregister_in_flight(&self, id: ListenerId) {
        self.in_flight.unregister(id);
    }

    #[cfg(test)]
    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// In-flight transactions see an event before application listeners do.
    pub(crate) fn dispatch(&self, event: &GattEvent) {
        trace!(connection = %self.label, ?event, "Dispatching radio event");
        self.in_flight.dispatch(event);
        self.listeners.dispatch(event);
    }

    /// Resets the time-to-live counter of the connection.
    ///
    /// 重置连接的存活时间计数。
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time elapsed since the last submitted transaction.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// 将事务提交到该连接的队列
    /// Submits a transaction to this connection's queue
    ///
    /// Usage errors are detected here, for every item of the chain, and the
    /// chain is latched as started before it is queued. Ordering is preserved
    /// even with an intra-transaction delay: the delay is spent inside the
    /// queued work item, before the commit.
    ///
    /// 使用错误在此处针对链中每一项检测，入队前整个链即被标记为已开始。即使配置了事务间延迟
    /// 也能保持顺序：延迟在排队的工作项内部、提交之前消耗。
    pub(crate) fn run_tx<F>(&self, tx: Arc<Transaction>, callback: F) -> Result<()>
    where
        F: FnOnce(TransactionResult) + Send + 'static,
    {
        tx.accept_submission(self)?;

        self.touch();
        let delay = self.config.transaction.intra_transaction_delay;
        debug!(connection = %self.label, tx = tx.id(), name = tx.name(), "Queueing transaction");

        self.queue.enqueue(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            tx.run_accepted(callback).await;
        })
    }

    /// Submits `tx` and waits for its result.
    pub(crate) async fn run_tx_and_wait(&self, tx: Arc<Transaction>) -> Result<TransactionResult> {
        let (result_tx, result_rx) = oneshot::channel();
        self.run_tx(tx, move |result| {
            let _ = result_tx.send(result);
        })?;
        result_rx
            .await
            .map_err(|_| Error::QueueClosed(self.label.clone()))
    }
}
