//! 客户端连接：应用与单个远程外设的连接
//! Client connection: the application's link to one remote peripheral

use super::core::ConnectionCore;
use crate::{
    config::Config,
    error::{Error, Result},
    event::{DeviceId, GattEvent, GattEventListener, GattEventSink, ListenerId},
    radio::{GattClientHandle, GattRadio},
    result::TransactionResult,
    state::GattState,
    transaction::Transaction,
};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info, warn};

pub(crate) type ClientMap = DashMap<DeviceId, Arc<GattClientConnection>>;

/// A connection to one remote peripheral.
///
/// At most one native handle is alive at a time, and the handle is absent
/// exactly when the link is down.
///
/// 与一个远程外设的连接。同一时刻最多存在一个原生句柄，链路断开时句柄为空。
#[derive(Debug)]
pub struct GattClientConnection {
    device: DeviceId,
    core: ConnectionCore,
    radio: Arc<dyn GattRadio>,
    handle: Mutex<Option<Arc<dyn GattClientHandle>>>,
    /// The registry this connection belongs to, used to refuse duplicates.
    /// 该连接所属的注册表，用于拒绝重复连接。
    registry: Weak<ClientMap>,
}

impl GattClientConnection {
    pub(crate) fn new(
        device: DeviceId,
        radio: Arc<dyn GattRadio>,
        config: Arc<Config>,
        registry: Weak<ClientMap>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: ConnectionCore::new(format!("client-{device}"), GattState::Disconnected, config),
            device,
            radio,
            handle: Mutex::new(None),
            registry,
        })
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn core(&self) -> &ConnectionCore {
        &self.core
    }

    pub fn gatt_state(&self) -> GattState {
        self.core.gatt_state()
    }

    pub fn set_state(&self, state: GattState) {
        self.core.set_state(state);
    }

    pub fn register_listener(&self, listener: Arc<dyn GattEventListener>) -> ListenerId {
        self.core.register_listener(listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.core.unregister_listener(id)
    }

    /// Queues `tx` on this connection; `callback` receives its single result.
    ///
    /// Usage errors are returned here and no result is delivered for them.
    ///
    /// 将 `tx` 排入该连接的队列；`callback` 接收其唯一结果。使用错误在此处直接返回，不会投递结果。
    pub fn run_tx<F>(&self, tx: impl Into<Arc<Transaction>>, callback: F) -> Result<()>
    where
        F: FnOnce(TransactionResult) + Send + 'static,
    {
        self.core.run_tx(tx.into(), callback)
    }

    /// Like [`run_tx`](Self::run_tx) but waits for the result.
    pub async fn run_tx_and_wait(&self, tx: impl Into<Arc<Transaction>>) -> Result<TransactionResult> {
        self.core.run_tx_and_wait(tx.into()).await
    }

    /// The live native handle, if the link is up.
    ///
    /// 如果链路已建立，返回有效的原生句柄。
    pub fn native_handle(&self) -> Option<Arc<dyn GattClientHandle>> {
        self.lock_handle().clone()
    }

    /// 发起连接
    /// Initiates the connection
    ///
    /// Refuses with [`Error::DuplicateConnection`] when the owning registry
    /// already holds another connection object for the same device. `Ok` means
    /// the native connect was started; the link coming up is reported later as
    /// an event.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.has_duplicate_in_registry() {
            warn!(device = %self.device, "Refusing to open a second native handle for device");
            return Err(Error::DuplicateConnection(self.device.clone()));
        }

        // A stale handle from an abandoned attempt is released before a new one is acquired.
        if self.close_handle() {
            debug!(device = %self.device, "Released stale native handle");
        }

        self.core.set_state(GattState::Connecting);
        match self.radio.connect(&self.device, GattEventSink::client(self)).await {
            Ok(handle) => {
                *self.lock_handle() = Some(handle);
                Ok(())
            }
            Err(err) => {
                warn!(device = %self.device, %err, "Radio refused to connect");
                self.core.set_state(GattState::Disconnected);
                Err(err.into())
            }
        }
    }

    /// 断开连接
    /// Disconnects
    ///
    /// Returns `true` when a disconnection event is still to be expected.
    /// A native failure is treated as already being disconnected.
    ///
    /// 当仍需等待断开事件时返回 `true`。原生调用失败被视为已经断开。
    pub async fn disconnect(&self) -> Result<bool> {
        let Some(handle) = self.native_handle() else {
            self.core.set_state(GattState::Disconnected);
            return Ok(false);
        };

        self.core.set_state(GattState::Disconnecting);
        match handle.disconnect().await {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(device = %self.device, %err, "Native disconnect failed, treating as disconnected");
                self.release_handle();
                Ok(false)
            }
        }
    }

    /// Closes the native handle, marks the connection disconnected and stops its queue.
    ///
    /// 关闭原生句柄，将连接标记为断开并停止其队列。
    pub fn close(&self) {
        info!(device = %self.device, "Closing client connection");
        self.release_handle();
        self.core.queue().stop();
    }

    /// Closes the native handle without touching the queue.
    pub(crate) fn release_handle(&self) {
        self.close_handle();
        self.core.set_state(GattState::Disconnected);
    }

    /// Entry point for radio callbacks, see [`GattEventSink`].
    pub(crate) fn handle_gatt_event(&self, event: GattEvent) {
        match &event {
            GattEvent::ConnectionStateChanged { status, connected } => {
                if *connected && status.is_success() {
                    self.core.set_state(GattState::Connected);
                } else {
                    debug!(device = %self.device, status = status.code(), "Link is down");
                    self.close_handle();
                    self.core.set_state(GattState::Disconnected);
                }
            }
            GattEvent::AdapterStateChanged { enabled: false } => {
                self.close_handle();
                self.core.set_state(GattState::BtOff);
            }
            GattEvent::AdapterStateChanged { enabled: true } => {
                if self.core.gatt_state() == GattState::BtOff {
                    self.core.set_state(GattState::Disconnected);
                }
            }
            _ => {}
        }
        self.core.dispatch(&event);
    }

    fn has_duplicate_in_registry(self: &Arc<Self>) -> bool {
        let Some(clients) = self.registry.upgrade() else {
            return false;
        };
        clients
            .get(&self.device)
            .is_some_and(|existing| !Arc::ptr_eq(existing.value(), self))
    }

    /// Takes the native handle out and closes it. Returns whether there was one.
    fn close_handle(&self) -> bool {
        let handle = self.lock_handle().take();
        match handle {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    fn lock_handle(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn GattClientHandle>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
