//! 定义了库中所有可能的错误类型。
//! Defines all possible error types in the library.

use crate::event::DeviceId;
use thiserror::Error;

/// An error reported by the platform radio shim when a native operation
/// could not be initiated.
///
/// 平台无线电适配层在无法发起原生操作时报告的错误。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("radio rejected operation (status {status}): {message}")]
pub struct RadioError {
    /// The native status code, preserved for diagnostics.
    /// 原生状态码，保留用于诊断。
    pub status: i32,
    /// A human readable description from the shim.
    /// 适配层给出的可读描述。
    pub message: String,
}

impl RadioError {
    /// Native status used when the shim has no better code to offer.
    pub const GENERIC_FAILURE: i32 = 0x101;

    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Builds an error carrying the generic failure status.
    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(Self::GENERIC_FAILURE, message)
    }
}

/// The primary error type for the transaction engine.
/// 事务引擎的主要错误类型。
#[derive(Debug, Error)]
pub enum Error {
    /// A transaction (or one of its pre/post-commit children) was committed twice.
    /// 事务（或其前置/后置子事务）被提交了两次。
    #[error("transaction `{0}` has already been committed")]
    AlreadyCommitted(&'static str),

    /// `commit` was invoked from the designated main thread.
    /// 在指定的主线程上调用了 `commit`。
    #[error("transactions must never be committed from the main thread")]
    CommitOnMainThread,

    /// The transaction was built without a connection but needs one.
    /// 事务在构建时没有连接，但执行时需要连接。
    #[error("transaction `{0}` was committed without a connection")]
    MissingConnection(&'static str),

    /// The transaction was submitted to a connection it does not belong to.
    /// 事务被提交到了不属于它的连接上。
    #[error("transaction `{0}` belongs to a different connection")]
    ConnectionMismatch(&'static str),

    /// Another connection object already owns the native handle for this device.
    /// 另一个连接对象已经持有该设备的原生句柄。
    #[error("a connection for device {0} already exists in the registry")]
    DuplicateConnection(DeviceId),

    /// The radio shim refused to start a native operation.
    /// 无线电适配层拒绝发起原生操作。
    #[error(transparent)]
    Radio(#[from] RadioError),

    /// The worker thread of an execution queue could not be spawned.
    /// 无法创建执行队列的工作线程。
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The execution queue could not accept the work item.
    /// 执行队列无法接收该工作项。
    #[error("execution queue `{0}` is not accepting work")]
    QueueClosed(String),
}

impl Error {
    /// Returns `true` for programming-misuse errors, which are raised at the
    /// call site instead of being delivered as a transaction result.
    ///
    /// 对于编程误用类错误返回 `true`，这类错误会在调用处直接返回，而不是作为事务结果投递。
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Error::AlreadyCommitted(_)
                | Error::CommitOnMainThread
                | Error::MissingConnection(_)
                | Error::ConnectionMismatch(_)
        )
    }
}

/// A specialized `Result` type for this library.
/// 本库专用的 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;
