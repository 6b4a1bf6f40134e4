//! 服务端连接：本地GATT服务端
//! Server connection: the local GATT server

use super::core::ConnectionCore;
use crate::{
    config::Config,
    error::{Error, Result},
    event::{DeviceId, GattEvent, GattEventListener, GattEventSink, ListenerId},
    radio::{GattRadio, GattServerHandle},
    result::TransactionResult,
    state::GattState,
    transaction::Transaction,
};
use dashmap::DashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// The local GATT server.
///
/// Its [`GattState`] models only the server's own operation. Remote clients
/// are tracked separately in a peer set, since many can be connected at once.
///
/// 本地GATT服务端。其 [`GattState`] 只描述服务端自身的操作；远程客户端单独记录在
/// 对端集合中，因为可能同时有多个客户端连接。
#[derive(Debug)]
pub struct GattServerConnection {
    core: ConnectionCore,
    radio: Arc<dyn GattRadio>,
    handle: Mutex<Option<Arc<dyn GattServerHandle>>>,
    peers: DashSet<DeviceId>,
}

impl GattServerConnection {
    pub(crate) fn new(radio: Arc<dyn GattRadio>, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            core: ConnectionCore::new("server", GattState::Idle, config),
            radio,
            handle: Mutex::new(None),
            peers: DashSet::new(),
        })
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

    /// Queues `tx` on the server queue; `callback` receives its single result.
    ///
    /// 将 `tx` 排入服务端队列；`callback` 接收其唯一结果。
    pub fn run_tx<F>(&self, tx: impl Into<Arc<Transaction>>, callback: F) -> Result<()>
    where
        F: FnOnce(TransactionResult) + Send + 'static,
    {
        self.core.run_tx(tx.into(), callback)
    }

    pub async fn run_tx_and_wait(&self, tx: impl Into<Arc<Transaction>>) -> Result<TransactionResult> {
        self.core.run_tx_and_wait(tx.into()).await
    }

    pub fn native_handle(&self) -> Option<Arc<dyn GattServerHandle>> {
        self.lock_handle().clone()
    }

    /// Opens the native server if it is not open yet.
    ///
    /// 如果本地服务端尚未打开，则打开它。
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        if self.native_handle().is_some() {
            return Ok(());
        }
        let handle = self
            .radio
            .open_server(GattEventSink::server(self))
            .await
            .map_err(Error::from)?;
        *self.lock_handle() = Some(handle);
        self.core.set_state(GattState::Idle);
        info!("GATT server opened");
        Ok(())
    }

    /// Closes the native server, forgets every peer and stops the queue.
    pub fn close(&self) {
        let handle = self.lock_handle().take();
        if let Some(handle) = handle {
            handle.close();
        }
        self.peers.clear();
        self.core.set_state(GattState::Disconnected);
        self.core.queue().stop();
        info!("GATT server closed");
    }

    /// Remote clients currently connected to this server.
    ///
    /// 当前连接到本服务端的远程客户端。
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<_> = self.peers.iter().map(|peer| peer.key().clone()).collect();
        devices.sort();
        devices
    }

    pub fn is_peer_connected(&self, device: &DeviceId) -> bool {
        self.peers.contains(device)
    }

    pub(crate) fn handle_gatt_event(&self, event: GattEvent) {
        match &event {
            GattEvent::ServerConnectionStateChanged {
                device,
                status,
                connected,
            } => {
                if *connected && status.is_success() {
                    debug!(%device, "Peer connected to server");
                    self.peers.insert(device.clone());
                } else {
                    debug!(%device, status = status.code(), "Peer left server");
                    self.peers.remove(device);
                }
            }
            GattEvent::AdapterStateChanged { enabled: false } => {
                self.peers.clear();
                self.core.set_state(GattState::BtOff);
            }
            GattEvent::AdapterStateChanged { enabled: true } => {
                if self.core.gatt_state() == GattState::BtOff {
                    self.core.set_state(GattState::Idle);
                }
            }
            _ => {}
        }
        self.core.dispatch(&event);
    }

    fn lock_handle(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn GattServerHandle>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
