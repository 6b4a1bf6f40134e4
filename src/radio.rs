//! 平台无线电适配层抽象
//! Platform radio shim abstractions
//!
//! 这些trait是本库与平台BLE栈之间的唯一边界。`Ok` 返回值仅表示原生操作已经发起；
//! 操作的完成总是稍后以 [`GattEvent`](crate::event::GattEvent) 的形式推送到
//! 连接或打开服务端时传入的 [`GattEventSink`] 中。
//!
//! These traits are the only boundary between this library and the platform
//! BLE stack. An `Ok` return only means the native operation was initiated;
//! completion always arrives later as a [`GattEvent`](crate::event::GattEvent)
//! pushed into the [`GattEventSink`] handed over at connect or open time.

use crate::{
    error::RadioError,
    event::{DeviceId, GattEventSink},
    result::Phy,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{fmt::Debug, sync::Arc};
use uuid::Uuid;

/// How a characteristic write is acknowledged.
///
/// 特征写入的确认方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteType {
    #[default]
    WithResponse,
    WithoutResponse,
}

/// The adapter-level entry point of the platform stack.
///
/// 平台栈的适配器级入口。
#[async_trait]
pub trait GattRadio: Send + Sync + Debug + 'static {
    /// Acquires a native client handle for `device` and starts connecting.
    /// The link coming up is reported through `sink`.
    ///
    /// 为 `device` 获取原生客户端句柄并开始连接。链路建立通过 `sink` 报告。
    async fn connect(
        &self,
        device: &DeviceId,
        sink: GattEventSink,
    ) -> Result<Arc<dyn GattClientHandle>, RadioError>;

    /// Opens the local GATT server.
    ///
    /// 打开本地GATT服务端。
    async fn open_server(&self, sink: GattEventSink) -> Result<Arc<dyn GattServerHandle>, RadioError>;
}

/// A native GATT client handle bound to one peripheral.
///
/// 绑定到一个外设的原生GATT客户端句柄。
#[async_trait]
pub trait GattClientHandle: Send + Sync + Debug + 'static {
    async fn disconnect(&self) -> Result<(), RadioError>;

    /// Releases the native handle. No further events are expected afterwards.
    ///
    /// Synchronous, like the platform call it wraps: it runs from radio
    /// callbacks as well as from transactions and must not block.
    ///
    /// 释放原生句柄。之后不应再有事件。与其封装的平台调用一样是同步的：
    /// 它既会在无线电回调中运行，也会在事务中运行，不得阻塞。
    fn close(&self);

    async fn discover_services(&self) -> Result<(), RadioError>;

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<(), RadioError>;

    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
        write_type: WriteType,
    ) -> Result<(), RadioError>;

    async fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Bytes,
    ) -> Result<(), RadioError>;

    async fn request_mtu(&self, mtu: u16) -> Result<(), RadioError>;

    async fn read_rssi(&self) -> Result<(), RadioError>;

    async fn set_preferred_phy(&self, tx: Phy, rx: Phy) -> Result<(), RadioError>;
}

/// The native handle of the local GATT server.
///
/// 本地GATT服务端的原生句柄。
#[async_trait]
pub trait GattServerHandle: Send + Sync + Debug + 'static {
    async fn add_service(&self, service: Uuid, characteristics: Vec<Uuid>) -> Result<(), RadioError>;

    fn close(&self);
}
