//! 定义了连接和事务引擎的可配置参数。
//! Defines configurable parameters for connections and the transaction engine.

use std::{thread::ThreadId, time::Duration};

/// A structure containing all configurable parameters.
///
/// 包含所有可配置参数的结构体。
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Transaction execution parameters.
    /// 事务执行相关参数。
    pub transaction: TransactionConfig,

    /// Connection lifetime parameters.
    /// 连接生命周期相关参数。
    pub connection: ConnectionConfig,

    /// State guard policy.
    /// 状态守卫策略。
    pub guard: GuardConfig,

    /// The thread that owns the UI. Committing a transaction on this thread
    /// is a usage error because it would block the UI for up to a timeout.
    ///
    /// 拥有UI的线程。在该线程上提交事务属于使用错误，因为它可能阻塞UI直到超时。
    pub main_thread: Option<ThreadId>,
}

impl Config {
    /// Designates `thread` as the main thread.
    /// 将 `thread` 指定为主线程。
    pub fn with_main_thread(mut self, thread: ThreadId) -> Self {
        self.main_thread = Some(thread);
        self
    }
}

/// Transaction execution parameters.
///
/// 事务执行相关参数。
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Timeout applied to a transaction chain when the transaction does not
    /// override it. Composite operations scale this by their child count.
    ///
    /// 当事务未覆盖时应用于事务链的超时。组合操作会按子事务数量放大该值。
    pub default_timeout: Duration,
    /// Spacing inserted before each transaction submitted through `run_tx`.
    /// Some peripherals drop requests that arrive back to back.
    ///
    /// 在每个通过 `run_tx` 提交的事务之前插入的间隔。
    pub intra_transaction_delay: Duration,
}

/// Connection lifetime parameters.
///
/// 连接生命周期相关参数。
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long a disconnected client connection may stay without activity
    /// before the registry closes and evicts it.
    ///
    /// 已断开的客户端连接在无活动状态下可以保留多久，之后注册表会关闭并移除它。
    pub disconnected_ttl: Duration,
    /// The interval at which the registry cleanup task runs.
    ///
    /// 注册表清理任务的运行间隔。
    pub cleanup_interval: Duration,
}

/// State guard policy.
///
/// 状态守卫策略。
#[derive(Debug, Clone, Default)]
pub struct GuardConfig {
    /// When set, adding a service to the local server is only legal while the
    /// server is `Idle`. When unset, add-service transactions rely on the
    /// generic IDLE/IN_PROGRESS rule.
    ///
    /// 启用后，只有在服务端处于 `Idle` 时才允许添加服务；否则仅依赖通用规则。
    pub guard_add_services: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            intra_transaction_delay: Duration::ZERO,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            disconnected_ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(10),
        }
    }
}
