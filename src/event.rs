//! 无线电回调事件与监听器
//! Radio callback events and listeners
//!
//! 平台无线电栈的所有回调都被转换为单一的 [`GattEvent`] 枚举，通过 [`GattEventSink`]
//! 推送到所属连接。监听器集合采用写时复制：分派时遍历不可变快照，注册和注销永远不会
//! 与正在进行的分派发生竞争。
//!
//! Every callback of the platform radio stack is turned into a single
//! [`GattEvent`] enum and pushed into the owning connection through a
//! [`GattEventSink`]. Listener sets are copy-on-write: dispatch walks an
//! immutable snapshot, so registration and removal never race a dispatch in
//! progress.

use crate::{
    connection::{GattClientConnection, GattServerConnection},
    result::{Phy, TransactionStatus},
};
use bytes::Bytes;
use std::{
    fmt,
    sync::{
        Arc, PoisonError, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::trace;
use uuid::Uuid;

/// Identity of a remote device, usually its Bluetooth address.
///
/// 远程设备的标识，通常是其蓝牙地址。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A native status code carried by a radio callback.
///
/// 无线电回调携带的原生状态码。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    pub const INSUFFICIENT_AUTHENTICATION: GattStatus = GattStatus(0x05);
    pub const WRITE_NOT_PERMITTED: GattStatus = GattStatus(0x03);
    pub const CONNECTION_CONGESTED: GattStatus = GattStatus(0x8f);
    pub const ERROR: GattStatus = GattStatus(0x85);
    pub const FAILURE: GattStatus = GattStatus(0x101);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn code(self) -> i32 {
        self.0
    }

    /// Maps the native code to the outcome of a transaction.
    /// 将原生状态码映射为事务结果状态。
    pub fn to_transaction_status(self) -> TransactionStatus {
        if self.is_success() {
            TransactionStatus::Success
        } else {
            TransactionStatus::Failure
        }
    }
}

/// An asynchronous callback from the radio stack.
///
/// 来自无线电栈的异步回调。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    /// The local adapter was switched on or off.
    /// 本地适配器被打开或关闭。
    AdapterStateChanged { enabled: bool },
    /// The link to the peer came up or went down.
    /// 与对端的链路建立或断开。
    ConnectionStateChanged { status: GattStatus, connected: bool },
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<Uuid>,
    },
    CharacteristicRead {
        status: GattStatus,
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
    },
    CharacteristicWrite {
        status: GattStatus,
        service: Uuid,
        characteristic: Uuid,
    },
    /// A spontaneous notification or indication from the peer.
    /// 来自对端的主动通知或指示。
    CharacteristicChanged {
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
    },
    DescriptorWrite {
        status: GattStatus,
        characteristic: Uuid,
        descriptor: Uuid,
    },
    MtuChanged { status: GattStatus, mtu: u16 },
    RssiRead { status: GattStatus, rssi: i32 },
    PhyUpdated {
        status: GattStatus,
        tx_phy: Phy,
        rx_phy: Phy,
    },
    /// The local server finished adding a service.
    /// 本地服务端完成添加服务。
    ServiceAdded { status: GattStatus, service: Uuid },
    /// A remote client connected to or disconnected from the local server.
    /// 远程客户端连接到或断开本地服务端。
    ServerConnectionStateChanged {
        device: DeviceId,
        status: GattStatus,
        connected: bool,
    },
}

/// Receives events that are not scoped to a single transaction.
///
/// 接收不属于单个事务范围的事件。
pub trait GattEventListener: Send + Sync {
    fn on_gatt_event(&self, event: &GattEvent);
}

impl<F> GattEventListener for F
where
    F: Fn(&GattEvent) + Send + Sync,
{
    fn on_gatt_event(&self, event: &GattEvent) {
        self(event)
    }
}

/// Handle returned by [`ListenerSet::register`], used to unregister.
///
/// [`ListenerSet::register`] 返回的句柄，用于注销。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// An immutable view of a listener set at one instant.
pub type ListenerSnapshot<L> = Arc<[(ListenerId, Arc<L>)]>;

/// 写时复制的监听器集合
/// Copy-on-write listener set
pub struct ListenerSet<L: ?Sized> {
    listeners: RwLock<ListenerSnapshot<L>>,
    next_id: AtomicU64,
}

impl<L: ?Sized> fmt::Debug for ListenerSet<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners_count", &self.len())
            .finish()
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Arc::from(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.to_vec();
        next.push((id, listener));
        *guard = Arc::from(next);
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        if !guard.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let next: Vec<_> = guard
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        *guard = Arc::from(next);
        true
    }

    /// Returns the current listeners. Later registrations do not affect the
    /// returned snapshot.
    ///
    /// 返回当前监听器。之后的注册不会影响返回的快照。
    pub fn snapshot(&self) -> ListenerSnapshot<L> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ListenerSet<dyn GattEventListener> {
    /// Delivers `event` to every listener of the current snapshot.
    pub fn dispatch(&self, event: &GattEvent) {
        for (_, listener) in self.snapshot().iter() {
            listener.on_gatt_event(event);
        }
    }
}

#[derive(Debug, Clone)]
enum SinkTarget {
    Client(Weak<GattClientConnection>),
    Server(Weak<GattServerConnection>),
}

/// The entry point the radio shim uses to push callbacks into a connection.
///
/// The sink only holds a weak reference. Events for a connection that has
/// already been dropped are discarded.
///
/// 无线电适配层向连接推送回调的入口。该入口只持有弱引用，已被释放的连接的事件会被丢弃。
#[derive(Debug, Clone)]
pub struct GattEventSink {
    target: SinkTarget,
}

impl GattEventSink {
    pub(crate) fn client(connection: &Arc<GattClientConnection>) -> Self {
        Self {
            target: SinkTarget::Client(Arc::downgrade(connection)),
        }
    }

    pub(crate) fn server(connection: &Arc<GattServerConnection>) -> Self {
        Self {
            target: SinkTarget::Server(Arc::downgrade(connection)),
        }
    }

    /// Pushes an event. Safe to call from any thread.
    ///
    /// 推送一个事件。可以从任意线程调用。
    pub fn deliver(&self, event: GattEvent) {
        match &self.target {
            SinkTarget::Client(weak) => match weak.upgrade() {
                Some(connection) => connection.handle_gatt_event(event),
                None => trace!(?event, "Dropping event for a released client connection"),
            },
            SinkTarget::Server(weak) => match weak.upgrade() {
                Some(connection) => connection.handle_gatt_event(event),
                None => trace!(?event, "Dropping event for a released server connection"),
            },
        }
    }
}
