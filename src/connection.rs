//! 连接对象
//! Connection objects
//!
//! 每个连接（客户端或服务端）拥有自己的串行执行队列、当前 [`GattState`](crate::state::GattState)
//! 和状态守卫，是应用提交事务的入口。
//!
//! Every connection, client or server, owns its serial execution queue, its
//! current [`GattState`](crate::state::GattState) and the state guard. It is the
//! entry point applications use to submit transactions.

mod client;
mod core;
mod server;

pub use self::core::ConnectionCore;
pub use client::GattClientConnection;
pub use server::GattServerConnection;

use std::sync::Arc;

/// A shared reference to either kind of connection.
///
/// 对任一类型连接的共享引用。
#[derive(Debug, Clone)]
pub enum ConnectionHandle {
    Client(Arc<GattClientConnection>),
    Server(Arc<GattServerConnection>),
}

impl ConnectionHandle {
    pub fn core(&self) -> &ConnectionCore {
        match self {
            ConnectionHandle::Client(client) => client.core(),
            ConnectionHandle::Server(server) => server.core(),
        }
    }

    pub fn as_client(&self) -> Option<&Arc<GattClientConnection>> {
        match self {
            ConnectionHandle::Client(client) => Some(client),
            ConnectionHandle::Server(_) => None,
        }
    }

    pub fn as_server(&self) -> Option<&Arc<GattServerConnection>> {
        match self {
            ConnectionHandle::Server(server) => Some(server),
            ConnectionHandle::Client(_) => None,
        }
    }

    /// Whether both handles refer to the same connection object.
    /// 两个句柄是否指向同一个连接对象。
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        std::ptr::eq(self.core(), other.core())
    }
}

impl From<Arc<GattClientConnection>> for ConnectionHandle {
    fn from(client: Arc<GattClientConnection>) -> Self {
        ConnectionHandle::Client(client)
    }
}

impl From<&Arc<GattClientConnection>> for ConnectionHandle {
    fn from(client: &Arc<GattClientConnection>) -> Self {
        ConnectionHandle::Client(client.clone())
    }
}

impl From<Arc<GattServerConnection>> for ConnectionHandle {
    fn from(server: Arc<GattServerConnection>) -> Self {
        ConnectionHandle::Server(server)
    }
}

impl From<&Arc<GattServerConnection>> for ConnectionHandle {
    fn from(server: &Arc<GattServerConnection>) -> Self {
        ConnectionHandle::Server(server.clone())
    }
}
