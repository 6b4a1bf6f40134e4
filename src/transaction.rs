//! 事务执行引擎
//! Transaction execution engine
//!
//! 一个 [`Transaction`] 是针对某个连接的一次状态变更尝试。它由一个 [`GattOperation`]
//! 描述要做什么，由本模块的提交协议保证：
//!
//! - 每个实例只能提交一次；
//! - 前置子事务、自身、后置子事务按顺序执行，共享同一个超时期限；
//! - 每一项在触及无线电之前都要通过状态守卫；
//! - 无论结果来自无线电回调还是超时，回调都只会收到恰好一个最终结果。
//!
//! A [`Transaction`] is one attempted state change against a connection. A
//! [`GattOperation`] describes what it does, and the commit protocol in this
//! module guarantees that:
//!
//! - every instance is committed at most once;
//! - pre-commit children, the transaction itself and post-commit children run
//!   in order under a single deadline;
//! - every item passes the state guard before touching the radio;
//! - the callback receives exactly one terminal result, whether it came from a
//!   radio callback or from the timeout.

mod client_ops;
mod composite;
mod server_ops;

#[cfg(test)]
mod tests;

pub use client_ops::{
    CLIENT_CHARACTERISTIC_CONFIGURATION, ConnectOperation, DisconnectOperation,
    DiscoverServicesOperation, NotificationMode, ReadCharacteristicOperation, ReadRssiOperation,
    RequestMtuOperation, SetClientStateOperation, SetPreferredPhyOperation, SubscribeOperation,
    WriteCharacteristicOperation,
};
pub use composite::CompositeOperation;
pub use server_ops::{AddServiceOperation, SetServerStateOperation};

use crate::{
    config::Config,
    connection::{ConnectionCore, ConnectionHandle, GattClientConnection, GattServerConnection},
    error::{Error, Result},
    event::{GattEvent, GattEventListener},
    guard::{GuardResult, TransactionCategory},
    result::{TransactionResult, TransactionStatus},
    state::GattState,
};
use async_trait::async_trait;
use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::oneshot,
    time::{Instant, timeout_at},
};
use tracing::{debug, error, warn};

/// What a transaction does.
///
/// An operation initiates one native call in [`execute`](Self::execute) and
/// turns the radio callback it is waiting for into a result in
/// [`on_gatt_event`](Self::on_gatt_event). Either method may finish the
/// operation early through [`TransactionContext::complete`].
///
/// 事务所做的事情。操作在 [`execute`](Self::execute) 中发起一次原生调用，并在
/// [`on_gatt_event`](Self::on_gatt_event) 中把等待的无线电回调转换为结果。
#[async_trait]
pub trait GattOperation: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// The state the connection reaches when the operation succeeds. The state
    /// guard validates the transition towards it.
    ///
    /// 操作成功时连接到达的状态。状态守卫会验证向该状态的转换。
    fn target_state(&self) -> GattState;

    fn category(&self) -> TransactionCategory {
        TransactionCategory::Ordinary
    }

    /// Multiplier applied to the base timeout.
    fn timeout_scale(&self) -> u32 {
        1
    }

    /// Whether committing without a connection is a usage error.
    fn requires_connection(&self) -> bool {
        true
    }

    /// Starts the native operation.
    ///
    /// 发起原生操作。
    async fn execute(&self, ctx: &TransactionContext);

    /// Called for every radio event while the operation is in flight.
    /// Returning `Some` completes the operation. The state changes carried by
    /// the [`Outcome`] are applied only if it wins against the timeout.
    ///
    /// 操作进行期间，每个无线电事件都会调用该方法。返回 `Some` 表示操作完成；
    /// [`Outcome`] 携带的状态变更只有在其先于超时完成时才会生效。
    fn on_gatt_event(&self, _event: &GattEvent, _ctx: &TransactionContext) -> Option<Outcome> {
        None
    }

    /// Called once if the deadline passes first, before the timeout result is built.
    ///
    /// 如果期限先到达，则在构建超时结果之前调用一次。
    async fn on_timeout(&self, _ctx: &TransactionContext) {}
}

/// A terminal result together with the connection states it leaves behind.
///
/// 最终结果及其留下的连接状态。
#[derive(Debug)]
pub struct Outcome {
    result: TransactionResult,
    transitions: Vec<GattState>,
}

impl Outcome {
    pub fn new(result: TransactionResult) -> Self {
        Self {
            result,
            transitions: Vec::new(),
        }
    }

    /// Moves the connection to `state` when the outcome is applied, after
    /// any state queued before it.
    pub fn then_state(mut self, state: GattState) -> Self {
        self.transitions.push(state);
        self
    }

    pub fn result(&self) -> &TransactionResult {
        &self.result
    }
}

impl From<TransactionResult> for Outcome {
    fn from(result: TransactionResult) -> Self {
        Self::new(result)
    }
}

/// One-shot slot for the terminal result of one chain item.
///
/// Whichever path claims it first, radio callback or timeout, wins.
///
/// 链中单项最终结果的一次性槽位。无论是无线电回调还是超时，先声明者获胜。
#[derive(Debug)]
struct Completion {
    claimed: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<TransactionResult>>>,
}

impl Completion {
    fn new() -> (Arc<Self>, oneshot::Receiver<TransactionResult>) {
        let (tx, rx) = oneshot::channel();
        let completion = Arc::new(Self {
            claimed: AtomicBool::new(false),
            sender: Mutex::new(Some(tx)),
        });
        (completion, rx)
    }

    fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Hands the result to the waiting item. Only the claimant calls this.
    fn deliver(&self, result: TransactionResult) {
        if let Some(sender) = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = sender.send(result);
        }
    }

    fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

/// What an operation sees of the transaction it runs in.
///
/// 操作所能看到的其所属事务的信息。
#[derive(Debug, Clone)]
pub struct TransactionContext {
    transaction_id: u32,
    connection: Option<ConnectionHandle>,
    deadline: Instant,
    completion: Arc<Completion>,
}

impl TransactionContext {
    pub fn transaction_id(&self) -> u32 {
        self.transaction_id
    }

    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    pub fn client(&self) -> Option<&Arc<GattClientConnection>> {
        self.connection.as_ref().and_then(ConnectionHandle::as_client)
    }

    pub fn server(&self) -> Option<&Arc<GattServerConnection>> {
        self.connection.as_ref().and_then(ConnectionHandle::as_server)
    }

    /// The deadline shared by the whole chain this item runs in.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Delivers the terminal result. Returns `false` if one was already delivered.
    ///
    /// 投递最终结果。如果已经投递过则返回 `false`。
    pub fn complete(&self, result: TransactionResult) -> bool {
        self.finish(Outcome::new(result))
    }

    /// Claims completion, applies the outcome's state changes, then delivers
    /// its result. A losing outcome leaves the connection untouched.
    ///
    /// 先声明完成，再应用状态变更并投递结果。落败的结果不会触碰连接。
    pub fn finish(&self, outcome: Outcome) -> bool {
        if !self.completion.claim() {
            return false;
        }
        for state in outcome.transitions {
            self.set_state(state);
        }
        self.completion.deliver(outcome.result);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.completion.is_claimed()
    }

    /// Current state of the connection, `Idle` if there is none.
    pub fn gatt_state(&self) -> GattState {
        self.connection
            .as_ref()
            .map_or(GattState::Idle, |conn| conn.core().gatt_state())
    }

    pub fn set_state(&self, state: GattState) {
        if let Some(conn) = &self.connection {
            conn.core().set_state(state);
        }
    }
}

/// Routes connection events to the operation currently in flight.
struct InFlight {
    operation: Arc<dyn GattOperation>,
    ctx: TransactionContext,
}

impl GattEventListener for InFlight {
    fn on_gatt_event(&self, event: &GattEvent) {
        // 超时之后到达的回调必须无效
        if self.ctx.is_complete() {
            return;
        }
        if let Some(outcome) = self.operation.on_gatt_event(event, &self.ctx) {
            self.ctx.finish(outcome);
        }
    }
}

/// 事务：一次针对连接的状态变更尝试
/// Transaction: one attempted state change against a connection
pub struct Transaction {
    id: u32,
    connection: Option<ConnectionHandle>,
    operation: Arc<dyn GattOperation>,
    timeout: Option<Duration>,
    pre_commit: Vec<Transaction>,
    post_commit: Vec<Transaction>,
    started: AtomicBool,
    halted: AtomicBool,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("target_state", &self.target_state())
            .field("pre_commit", &self.pre_commit)
            .field("post_commit", &self.post_commit)
            .field("started", &self.is_started())
            .field("halted", &self.is_halted())
            .finish()
    }
}

impl Transaction {
    pub fn new(connection: impl Into<ConnectionHandle>, operation: impl GattOperation) -> Self {
        Self::from_parts(Some(connection.into()), Arc::new(operation))
    }

    /// A transaction without a connection. Only operations that do not need
    /// one, such as composites, can be committed this way.
    ///
    /// 不带连接的事务。只有不需要连接的操作（例如组合操作）可以这样提交。
    pub fn detached(operation: impl GattOperation) -> Self {
        Self::from_parts(None, Arc::new(operation))
    }

    /// Shorthand for a [`CompositeOperation`] on `connection`.
    pub fn composite(connection: impl Into<ConnectionHandle>, children: Vec<Transaction>) -> Self {
        Self::new(connection, CompositeOperation::new(children))
    }

    pub fn from_parts(connection: Option<ConnectionHandle>, operation: Arc<dyn GattOperation>) -> Self {
        Self {
            id: rand::random(),
            connection,
            operation,
            timeout: None,
            pre_commit: Vec::new(),
            post_commit: Vec::new(),
            started: AtomicBool::new(false),
            halted: AtomicBool::new(false),
        }
    }

    /// Overrides the configured default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Runs `tx` before this transaction, within the same deadline.
    ///
    /// 在本事务之前运行 `tx`，共享同一个期限。
    pub fn with_pre_commit(mut self, tx: Transaction) -> Self {
        self.pre_commit.push(tx);
        self
    }

    /// Runs `tx` after this transaction, within the same deadline.
    ///
    /// 在本事务之后运行 `tx`，共享同一个期限。
    pub fn with_post_commit(mut self, tx: Transaction) -> Self {
        self.post_commit.push(tx);
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.operation.name()
    }

    pub fn target_state(&self) -> GattState {
        self.operation.target_state()
    }

    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    /// Whether the transaction was submitted to a queue or committed.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether the chain was aborted by a failure, an invalid state or the timeout.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// The deadline applied to the whole chain.
    ///
    /// 应用于整个事务链的期限。
    pub fn timeout(&self) -> Duration {
        let base = self
            .timeout
            .unwrap_or(self.config().transaction.default_timeout);
        base * self.operation.timeout_scale().max(1)
    }

    fn config(&self) -> Arc<Config> {
        self.connection
            .as_ref()
            .map_or_else(|| Arc::new(Config::default()), |conn| conn.core().config().clone())
    }

    /// 提交事务
    /// Commits the transaction
    ///
    /// Waits for the whole chain and hands the single terminal result to
    /// `callback`. Usage errors are returned as `Err` and no result is
    /// delivered for them.
    ///
    /// 等待整个事务链完成，并把唯一的最终结果交给 `callback`。使用错误以 `Err` 返回，
    /// 不会为其投递结果。
    pub async fn commit<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(TransactionResult) + Send + 'static,
    {
        self.commit_within(None, callback).await
    }

    /// Commits with the deadline capped at `outer`, so the chain never
    /// outlives the transaction that started it.
    pub(crate) async fn commit_within<F>(&self, outer: Option<Instant>, callback: F) -> Result<()>
    where
        F: FnOnce(TransactionResult) + Send + 'static,
    {
        let config = self.config();
        if config.main_thread == Some(std::thread::current().id()) {
            error!(tx = self.id, name = self.name(), "Transaction committed on the main thread");
            return Err(Error::CommitOnMainThread);
        }

        let chain = self.chain();
        if let Some(missing) = chain
            .iter()
            .find(|item| item.connection.is_none() && item.operation.requires_connection())
        {
            error!(tx = missing.id, name = missing.name(), "Transaction committed without a connection");
            return Err(Error::MissingConnection(missing.name()));
        }
        Self::mark_started(&chain)?;

        self.run_chain(&chain, outer, callback).await;
        Ok(())
    }

    /// Validates and latches a transaction submitted to the queue of `core`.
    ///
    /// Every item of the chain must belong to `core`, or need no connection
    /// at all. On success the chain is marked started, so a second
    /// submission fails here instead of on the worker.
    ///
    /// 验证并锁定提交到 `core` 队列的事务。链中每一项都必须属于 `core` 或不需要连接；
    /// 成功后整个链被标记为已开始，因此第二次提交会在此处失败，而不是在工作线程上失败。
    pub(crate) fn accept_submission(&self, core: &ConnectionCore) -> Result<()> {
        if self.connection.is_none() {
            error!(connection = %core.label(), tx = self.id, name = self.name(), "Transaction has no connection");
            return Err(Error::MissingConnection(self.name()));
        }
        let chain = self.chain();
        for item in &chain {
            match &item.connection {
                None if item.operation.requires_connection() => {
                    error!(connection = %core.label(), tx = item.id, name = item.name(), "Chain item has no connection");
                    return Err(Error::MissingConnection(item.name()));
                }
                Some(owner) if !std::ptr::eq(owner.core(), core) => {
                    error!(
                        connection = %core.label(),
                        owner = %owner.core().label(),
                        tx = item.id,
                        name = item.name(),
                        "Transaction submitted to a foreign connection"
                    );
                    return Err(Error::ConnectionMismatch(item.name()));
                }
                _ => {}
            }
        }
        Self::mark_started(&chain)
    }

    /// Runs a chain already latched by [`accept_submission`](Self::accept_submission).
    pub(crate) async fn run_accepted<F>(&self, callback: F)
    where
        F: FnOnce(TransactionResult) + Send + 'static,
    {
        let chain = self.chain();
        self.run_chain(&chain, None, callback).await;
    }

    async fn run_chain<F>(&self, chain: &[&Transaction], outer: Option<Instant>, callback: F)
    where
        F: FnOnce(TransactionResult) + Send + 'static,
    {
        let timeout = self.timeout();
        let own = Instant::now() + timeout;
        let deadline = outer.map_or(own, |outer| outer.min(own));
        debug!(tx = self.id, name = self.name(), items = chain.len(), ?timeout, "Committing transaction");

        let mut results = Vec::with_capacity(chain.len());
        for item in chain {
            let result = item.run(deadline).await;
            if !result.is_success() {
                self.halted.store(true, Ordering::Release);
                debug!(
                    tx = self.id,
                    name = self.name(),
                    failed = item.name(),
                    status = ?result.status(),
                    "Transaction chain halted"
                );
                callback(result);
                return;
            }
            results.push(result);
        }

        let Some(last) = results.pop() else {
            return;
        };
        debug!(tx = self.id, name = self.name(), "Transaction succeeded");
        callback(last.with_earlier_results(results));
    }

    fn chain(&self) -> Vec<&Transaction> {
        let mut chain = Vec::new();
        self.collect_chain(&mut chain);
        chain
    }

    fn collect_chain<'a>(&'a self, chain: &mut Vec<&'a Transaction>) {
        for child in &self.pre_commit {
            child.collect_chain(chain);
        }
        chain.push(self);
        for child in &self.post_commit {
            child.collect_chain(chain);
        }
    }

    /// Latches `started` on every item. Nothing stays latched on failure.
    fn mark_started(chain: &[&Transaction]) -> Result<()> {
        for (index, item) in chain.iter().enumerate() {
            let latched = item
                .started
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if !latched {
                for earlier in &chain[..index] {
                    earlier.started.store(false, Ordering::Release);
                }
                error!(tx = item.id, name = item.name(), "Transaction committed twice");
                return Err(Error::AlreadyCommitted(item.name()));
            }
        }
        Ok(())
    }

    /// Runs one item of a chain and returns its terminal result.
    async fn run(&self, deadline: Instant) -> TransactionResult {
        let name = self.name();
        let (completion, mut rx) = Completion::new();
        let ctx = TransactionContext {
            transaction_id: self.id,
            connection: self.connection.clone(),
            deadline,
            completion: completion.clone(),
        };

        if let Some(conn) = &self.connection {
            let current = conn.core().gatt_state();
            let verdict = conn
                .core()
                .guard()
                .check_transaction(current, self.operation.as_ref());
            if verdict == GuardResult::InvalidTargetState {
                debug!(
                    tx = self.id,
                    name,
                    from = %current,
                    target = %self.target_state(),
                    "Transaction rejected by state guard"
                );
                return TransactionResult::new(TransactionStatus::InvalidState, current).named(name);
            }
        }

        if Instant::now() >= deadline {
            warn!(tx = self.id, name, "Deadline passed before the transaction could start");
            return TransactionResult::new(TransactionStatus::Timeout, ctx.gatt_state()).named(name);
        }

        let listener = self.connection.as_ref().map(|conn| {
            conn.core().register_in_flight(Arc::new(InFlight {
                operation: self.operation.clone(),
                ctx: ctx.clone(),
            }))
        });

        debug!(tx = self.id, name, "Executing transaction");
        let outcome = timeout_at(deadline, async {
            self.operation.execute(&ctx).await;
            (&mut rx).await
        })
        .await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => TransactionResult::new(TransactionStatus::Failure, ctx.gatt_state()),
            Err(_) if completion.claim() => {
                self.halted.store(true, Ordering::Release);
                self.operation.on_timeout(&ctx).await;
                warn!(tx = self.id, name, "Transaction timed out");
                TransactionResult::new(TransactionStatus::Timeout, ctx.gatt_state())
            }
            // 真实结果恰好在超时时刻到达
            Err(_) => rx
                .await
                .unwrap_or_else(|_| TransactionResult::new(TransactionStatus::Failure, ctx.gatt_state())),
        };

        if let (Some(conn), Some(id)) = (&self.connection, listener) {
            conn.core().unregister_in_flight(id);
        }
        result.named(name)
    }
}
