//! 连接注册表
//! Connection registry
//!
//! 注册表由应用启动代码显式构造并通过 `Arc` 共享，不存在进程级的全局实例。
//! 它按设备标识保存客户端连接，最多保存一个本地服务端，并周期性地关闭和移除
//! 已断开且长时间无活动的客户端连接。
//!
//! The registry is constructed explicitly by application start-up code and
//! shared by `Arc`; there is no process-wide instance. It keeps client
//! connections by device identity, at most one local server, and periodically
//! closes and evicts client connections that are disconnected and have been
//! inactive for too long.

use crate::{
    config::Config,
    connection::{GattClientConnection, GattServerConnection},
    error::Result,
    event::{DeviceId, GattEvent},
    radio::GattRadio,
};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// 连接注册表
/// Connection registry
#[derive(Debug)]
pub struct ConnectionRegistry {
    radio: Arc<dyn GattRadio>,
    config: Arc<Config>,
    clients: Arc<DashMap<DeviceId, Arc<GattClientConnection>>>,
    server: Mutex<Option<Arc<GattServerConnection>>>,
    /// Serializes `open_server` across its radio await.
    opening: tokio::sync::Mutex<()>,
}

impl ConnectionRegistry {
    pub fn new(radio: Arc<dyn GattRadio>, config: Config) -> Arc<Self> {
        Arc::new(Self {
            radio,
            config: Arc::new(config),
            clients: Arc::new(DashMap::new()),
            server: Mutex::new(None),
            opening: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Returns the connection for `device`, creating it on first use.
    ///
    /// 返回 `device` 的连接，首次使用时创建。
    pub fn client(&self, device: &DeviceId) -> Arc<GattClientConnection> {
        self.clients
            .entry(device.clone())
            .or_insert_with(|| {
                debug!(%device, "Registering client connection");
                self.new_client(device.clone())
            })
            .clone()
    }

    /// Creates a connection that is linked to this registry but not stored in
    /// it. Connecting it fails while the registry holds another connection for
    /// the same device.
    ///
    /// 创建一个与本注册表关联但未存入其中的连接。当注册表中已有同一设备的其他连接时，
    /// 对它发起连接会失败。
    pub fn detached_client(&self, device: &DeviceId) -> Arc<GattClientConnection> {
        self.new_client(device.clone())
    }

    pub fn get_client(&self, device: &DeviceId) -> Option<Arc<GattClientConnection>> {
        self.clients.get(device).map(|entry| entry.value().clone())
    }

    pub fn clients(&self) -> Vec<Arc<GattClientConnection>> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Removes and closes the connection for `device`.
    pub fn remove_client(&self, device: &DeviceId) -> bool {
        let Some((_, client)) = self.clients.remove(device) else {
            return false;
        };
        client.close();
        true
    }

    /// Opens the local server, or returns the one already open.
    ///
    /// 打开本地服务端，或返回已经打开的服务端。
    pub async fn open_server(&self) -> Result<Arc<GattServerConnection>> {
        if let Some(server) = self.server() {
            return Ok(server);
        }
        let _opening = self.opening.lock().await;
        // 等锁期间可能已有调用者打开了服务端
        if let Some(server) = self.server() {
            return Ok(server);
        }
        let server = GattServerConnection::new(self.radio.clone(), self.config.clone());
        server.open().await?;
        *self.lock_server() = Some(server.clone());
        Ok(server)
    }

    pub fn server(&self) -> Option<Arc<GattServerConnection>> {
        self.lock_server().clone()
    }

    /// Broadcasts an adapter state change to every connection.
    ///
    /// 向所有连接广播适配器状态变化。
    pub fn set_adapter_enabled(&self, enabled: bool) {
        info!(enabled, "Adapter state changed");
        for client in self.clients() {
            client.handle_gatt_event(GattEvent::AdapterStateChanged { enabled });
        }
        if let Some(server) = self.server() {
            server.handle_gatt_event(GattEvent::AdapterStateChanged { enabled });
        }
    }

    /// 清理过期的客户端连接
    /// Cleans up expired client connections
    ///
    /// A client expires when it is disconnected, has no queued work, and its
    /// last submitted transaction is older than `disconnected_ttl`. Returns the
    /// evicted devices.
    ///
    /// 当客户端已断开、没有排队的工作，并且最后一次提交事务的时间早于 `disconnected_ttl`
    /// 时，该客户端过期。返回被移除的设备。
    pub fn cleanup(&self) -> Vec<DeviceId> {
        let ttl = self.config.connection.disconnected_ttl;
        let is_expired = |client: &GattClientConnection| {
            client.gatt_state().is_disconnected()
                && client.core().queue().pending() == 0
                && client.core().idle_for() >= ttl
        };

        let candidates: Vec<DeviceId> = self
            .clients
            .iter()
            .filter(|entry| is_expired(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        if candidates.is_empty() {
            return candidates;
        }

        let mut evicted = Vec::with_capacity(candidates.len());
        for device in candidates {
            // 在收集与移除之间可能有新的活动
            let Some((_, client)) = self.clients.remove_if(&device, |_, client| is_expired(client)) else {
                continue;
            };
            client.close();
            evicted.push(device);
        }

        if !evicted.is_empty() {
            trace!(cleaned_count = evicted.len(), "Evicted expired client connections");
        }
        evicted
    }

    /// Runs [`cleanup`](Self::cleanup) every `cleanup_interval` until the
    /// registry is dropped.
    ///
    /// 每隔 `cleanup_interval` 运行一次 [`cleanup`](Self::cleanup)，直到注册表被释放。
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = self.config.connection.cleanup_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // 第一次tick立即完成
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    debug!("Registry dropped, stopping cleanup task");
                    break;
                };
                registry.cleanup();
            }
        })
    }

    fn new_client(&self, device: DeviceId) -> Arc<GattClientConnection> {
        GattClientConnection::new(
            device,
            self.radio.clone(),
            self.config.clone(),
            Arc::downgrade(&self.clients),
        )
    }

    fn lock_server(&self) -> std::sync::MutexGuard<'_, Option<Arc<GattServerConnection>>> {
        self.server.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::Error, state::GattState, testing::NullRadio};
    use std::time::Duration;

    fn registry() -> Arc<ConnectionRegistry> {
        ConnectionRegistry::new(Arc::new(NullRadio), Config::default())
    }

    #[tokio::test]
    async fn test_client_is_created_once() {
        let registry = registry();
        let device = DeviceId::new("AA:BB:CC:DD:EE:01");

        let first = registry.client(&device);
        let second = registry.client(&device);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.gatt_state(), GattState::Disconnected);
        assert_eq!(registry.clients().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_connection_is_refused() {
        let registry = registry();
        let device = DeviceId::new("AA:BB:CC:DD:EE:02");
        let _registered = registry.client(&device);

        let duplicate = registry.detached_client(&device);
        let err = duplicate.connect().await.unwrap_err();
        assert!(matches!(err, Error::DuplicateConnection(d) if d == device));
        // 被拒绝的连接从未触及无线电
        assert_eq!(duplicate.gatt_state(), GattState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_evicts_after_ttl() {
        let registry = registry();
        let stale = DeviceId::new("AA:BB:CC:DD:EE:03");
        let connected = DeviceId::new("AA:BB:CC:DD:EE:04");
        registry.client(&stale);
        registry.client(&connected).set_state(GattState::Connected);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(registry.cleanup().is_empty());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(registry.cleanup(), vec![stale.clone()]);
        assert!(registry.get_client(&stale).is_none());
        // 已连接的客户端不会被移除
        assert!(registry.get_client(&connected).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_ttl() {
        let registry = registry();
        let device = DeviceId::new("AA:BB:CC:DD:EE:05");
        let client = registry.client(&device);

        tokio::time::sleep(Duration::from_secs(50)).await;
        client.core().touch();
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(registry.cleanup().is_empty());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(registry.cleanup(), vec![device]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_stops_with_registry() {
        let registry = registry();
        let device = DeviceId::new("AA:BB:CC:DD:EE:06");
        registry.client(&device);

        let task = registry.spawn_cleanup_task();
        tokio::time::sleep(Duration::from_secs(75)).await;
        assert!(registry.get_client(&device).is_none());

        drop(registry);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn test_adapter_state_is_broadcast() {
        let registry = registry();
        let first = registry.client(&DeviceId::new("AA:BB:CC:DD:EE:07"));
        let second = registry.client(&DeviceId::new("AA:BB:CC:DD:EE:08"));
        second.set_state(GattState::Connected);

        registry.set_adapter_enabled(false);
        assert_eq!(first.gatt_state(), GattState::BtOff);
        assert_eq!(second.gatt_state(), GattState::BtOff);

        registry.set_adapter_enabled(true);
        assert_eq!(first.gatt_state(), GattState::Disconnected);
        assert_eq!(second.gatt_state(), GattState::Disconnected);
    }

    #[tokio::test]
    async fn test_server_is_opened_once() {
        let registry = registry();
        assert!(registry.server().is_none());
        let first = registry.open_server().await.unwrap();
        let second = registry.open_server().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.gatt_state(), GattState::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_open_server_shares_one_server() {
        let registry = registry();
        let (first, second) = tokio::join!(registry.open_server(), registry.open_server());
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&registry.server().unwrap(), &first));
    }
}
