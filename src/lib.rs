#![deny(clippy::expect_used, clippy::unwrap_used)]

//! BLE连接管理与事务执行库的根。
//! The root of the BLE connection-management and transaction-execution library.
//!
//! 应用通过 [`ConnectionRegistry`] 获取连接，再用 `run_tx` 提交 [`Transaction`]。
//! 同一连接上的事务严格按提交顺序逐个执行，每个事务恰好得到一个最终结果：
//! 成功、失败、状态无效或超时。
//!
//! Applications obtain connections from a [`ConnectionRegistry`] and submit
//! [`Transaction`]s with `run_tx`. Transactions on one connection run one at a
//! time in submission order, and each ends with exactly one terminal result:
//! success, failure, invalid state or timeout.

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod guard;
pub mod queue;
pub mod radio;
pub mod registry;
pub mod result;
pub mod state;
pub mod transaction;

mod testing;

pub use config::Config;
pub use connection::{ConnectionHandle, GattClientConnection, GattServerConnection};
pub use error::{Error, RadioError, Result};
pub use event::{DeviceId, GattEvent, GattEventListener, GattEventSink, GattStatus};
pub use registry::ConnectionRegistry;
pub use result::{TransactionResult, TransactionStatus};
pub use state::GattState;
pub use transaction::{GattOperation, Outcome, Transaction, TransactionContext};
