//! 客户端叶子操作
//! Client leaf operations
//!
//! 每个GATT叶子操作在原生调用之前设置其进行中状态，在结果中记录成功或失败状态，
//! 然后把连接恢复为 `Idle`。
//!
//! Every GATT leaf sets its in-progress state before the native call, records
//! its success or failure state in the result, then returns the connection to
//! `Idle`.

use super::{GattOperation, Outcome, TransactionContext};
use crate::{
    connection::GattClientConnection,
    error::RadioError,
    event::{GattEvent, GattStatus},
    guard::TransactionCategory,
    radio::{GattClientHandle, WriteType},
    result::{Phy, TransactionResult, TransactionResultBuilder, TransactionStatus},
    state::GattState,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// The Client Characteristic Configuration Descriptor.
///
/// 客户端特征配置描述符。
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);

/// Returns the client, or completes the transaction with a failure.
fn require_client<'a>(ctx: &'a TransactionContext, name: &'static str) -> Option<&'a Arc<GattClientConnection>> {
    let client = ctx.client();
    if client.is_none() {
        warn!(tx = ctx.transaction_id(), name, "Client operation committed on a server connection");
        ctx.complete(TransactionResult::new(TransactionStatus::Failure, ctx.gatt_state()));
    }
    client
}

/// Returns the live native handle, or completes the transaction with a failure.
fn require_handle(ctx: &TransactionContext, name: &'static str) -> Option<Arc<dyn GattClientHandle>> {
    let handle = require_client(ctx, name)?.native_handle();
    if handle.is_none() {
        warn!(tx = ctx.transaction_id(), name, "No native handle, link is down");
        ctx.complete(TransactionResult::new(TransactionStatus::Failure, ctx.gatt_state()));
    }
    handle
}

/// Completes with FAILURE after the radio refused to start the operation.
fn reject(ctx: &TransactionContext, name: &'static str, failure: GattState, err: RadioError) {
    warn!(tx = ctx.transaction_id(), name, %err, "Radio rejected operation");
    let result = TransactionResult::builder(TransactionStatus::Failure, failure)
        .response_status(err.status)
        .build();
    ctx.finish(back_to_idle(failure, result));
}

/// Picks the terminal state of a GATT leaf for `status` and starts its result.
fn settle(status: GattStatus, success: GattState, failure: GattState) -> (GattState, TransactionResultBuilder) {
    let state = if status.is_success() { success } else { failure };
    let result = TransactionResult::builder(status.to_transaction_status(), state).response_status(status.code());
    (state, result)
}

/// Records `state`, then returns the connection to `Idle`.
pub(super) fn back_to_idle(state: GattState, result: TransactionResult) -> Outcome {
    Outcome::new(result).then_state(state).then_state(GattState::Idle)
}

/// Opens the native handle and waits for the link to come up.
///
/// 打开原生句柄并等待链路建立。
#[derive(Debug, Default)]
pub struct ConnectOperation;

impl ConnectOperation {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GattOperation for ConnectOperation {
    fn name(&self) -> &'static str {
        "connect"
    }

    fn target_state(&self) -> GattState {
        GattState::Connected
    }

    async fn execute(&self, ctx: &TransactionContext) {
        let Some(client) = require_client(ctx, self.name()) else {
            return;
        };
        if let Err(err) = client.connect().await {
            warn!(tx = ctx.transaction_id(), device = %client.device(), %err, "Connect failed");
            let mut result = TransactionResult::builder(TransactionStatus::Failure, ctx.gatt_state());
            if let crate::error::Error::Radio(radio) = &err {
                result = result.response_status(radio.status);
            }
            ctx.complete(result.build());
        }
    }

    fn on_gatt_event(&self, event: &GattEvent, ctx: &TransactionContext) -> Option<Outcome> {
        let GattEvent::ConnectionStateChanged { status, connected } = event else {
            return None;
        };
        // 连接层已经根据该事件更新了状态
        let status_code = status.code();
        let result = if *connected && status.is_success() {
            TransactionResult::builder(TransactionStatus::Success, ctx.gatt_state())
        } else {
            TransactionResult::builder(TransactionStatus::Failure, ctx.gatt_state())
        };
        Some(result.response_status(status_code).build().into())
    }

    async fn on_timeout(&self, ctx: &TransactionContext) {
        if let Some(client) = ctx.client() {
            client.release_handle();
        }
    }
}

/// Disconnects the link; a native failure counts as already disconnected.
///
/// 断开链路；原生调用失败视为已经断开。
#[derive(Debug, Default)]
pub struct DisconnectOperation;

impl DisconnectOperation {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GattOperation for DisconnectOperation {
    fn name(&self) -> &'static str {
        "disconnect"
    }

    fn target_state(&self) -> GattState {
        GattState::Disconnected
    }

    async fn execute(&self, ctx: &TransactionContext) {
        let Some(client) = require_client(ctx, self.name()) else {
            return;
        };
        match client.disconnect().await {
            Ok(true) => {}
            Ok(false) => {
                ctx.complete(TransactionResult::new(TransactionStatus::Success, ctx.gatt_state()));
            }
            Err(err) => {
                warn!(tx = ctx.transaction_id(), %err, "Disconnect failed");
                ctx.complete(TransactionResult::new(TransactionStatus::Failure, ctx.gatt_state()));
            }
        }
    }

    fn on_gatt_event(&self, event: &GattEvent, ctx: &TransactionContext) -> Option<Outcome> {
        match event {
            GattEvent::ConnectionStateChanged {
                status,
                connected: false,
            } => Some(
                TransactionResult::builder(TransactionStatus::Success, ctx.gatt_state())
                    .response_status(status.code())
                    .build()
                    .into(),
            ),
            _ => None,
        }
    }

    async fn on_timeout(&self, ctx: &TransactionContext) {
        if let Some(client) = ctx.client() {
            client.release_handle();
        }
    }
}

#[derive(Debug, Default)]
pub struct DiscoverServicesOperation;

impl DiscoverServicesOperation {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GattOperation for DiscoverServicesOperation {
    fn name(&self) -> &'static str {
        "discover_services"
    }

    fn target_state(&self) -> GattState {
        GattState::DiscoverySuccess
    }

    async fn execute(&self, ctx: &TransactionContext) {
        let Some(handle) = require_handle(ctx, self.name()) else {
            return;
        };
        ctx.set_state(GattState::Discovering);
        if let Err(err) = handle.discover_services().await {
            reject(ctx, self.name(), GattState::DiscoveryFailure, err);
        }
    }

    fn on_gatt_event(&self, event: &GattEvent, _ctx: &TransactionContext) -> Option<Outcome> {
        let GattEvent::ServicesDiscovered { status, services } = event else {
            return None;
        };
        let (state, result) = settle(*status, GattState::DiscoverySuccess, GattState::DiscoveryFailure);
        Some(back_to_idle(state, result.services(services.clone()).build()))
    }

    async fn on_timeout(&self, ctx: &TransactionContext) {
        ctx.set_state(GattState::Idle);
    }
}

/// 读取特征值
/// Reads a characteristic value
#[derive(Debug)]
pub struct ReadCharacteristicOperation {
    service: Uuid,
    characteristic: Uuid,
}

impl ReadCharacteristicOperation {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

#[async_trait]
impl GattOperation for ReadCharacteristicOperation {
    fn name(&self) -> &'static str {
        "read_characteristic"
    }

    fn target_state(&self) -> GattState {
        GattState::ReadCharacteristicSuccess
    }

    async fn execute(&self, ctx: &TransactionContext) {
        let Some(handle) = require_handle(ctx, self.name()) else {
            return;
        };
        ctx.set_state(GattState::ReadingCharacteristic);
        if let Err(err) = handle.read_characteristic(self.service, self.characteristic).await {
            reject(ctx, self.name(), GattState::FailureReadingCharacteristic, err);
        }
    }

    fn on_gatt_event(&self, event: &GattEvent, _ctx: &TransactionContext) -> Option<Outcome> {
        let GattEvent::CharacteristicRead {
            status,
            service,
            characteristic,
            value,
        } = event
        else {
            return None;
        };
        if *service != self.service || *characteristic != self.characteristic {
            return None;
        }
        let (state, result) = settle(
            *status,
            GattState::ReadCharacteristicSuccess,
            GattState::FailureReadingCharacteristic,
        );
        let result = result
            .service_uuid(self.service)
            .characteristic_uuid(self.characteristic)
            .data(value.clone())
            .build();
        Some(back_to_idle(state, result))
    }

    async fn on_timeout(&self, ctx: &TransactionContext) {
        ctx.set_state(GattState::Idle);
    }
}

/// 写入特征值
/// Writes a characteristic value
#[derive(Debug)]
pub struct WriteCharacteristicOperation {
    service: Uuid,
    characteristic: Uuid,
    value: Bytes,
    write_type: WriteType,
}

impl WriteCharacteristicOperation {
    pub fn new(service: Uuid, characteristic: Uuid, value: impl Into<Bytes>) -> Self {
        Self {
            service,
            characteristic,
            value: value.into(),
            write_type: WriteType::WithResponse,
        }
    }

    pub fn with_write_type(mut self, write_type: WriteType) -> Self {
        self.write_type = write_type;
        self
    }
}

#[async_trait]
impl GattOperation for WriteCharacteristicOperation {
    fn name(&self) -> &'static str {
        "write_characteristic"
    }

    fn target_state(&self) -> GattState {
        GattState::WriteCharacteristicSuccess
    }

    async fn execute(&self, ctx: &TransactionContext) {
        let Some(handle) = require_handle(ctx, self.name()) else {
            return;
        };
        ctx.set_state(GattState::WritingCharacteristic);
        let written = handle
            .write_characteristic(self.service, self.characteristic, self.value.clone(), self.write_type)
            .await;
        if let Err(err) = written {
            reject(ctx, self.name(), GattState::FailureWritingCharacteristic, err);
        }
    }

    fn on_gatt_event(&self, event: &GattEvent, _ctx: &TransactionContext) -> Option<Outcome> {
        let GattEvent::CharacteristicWrite {
            status,
            service,
            characteristic,
        } = event
        else {
            return None;
        };
        if *service != self.service || *characteristic != self.characteristic {
            return None;
        }
        let (state, result) = settle(
            *status,
            GattState::WriteCharacteristicSuccess,
            GattState::FailureWritingCharacteristic,
        );
        let result = result
            .service_uuid(self.service)
            .characteristic_uuid(self.characteristic)
            .data(self.value.clone())
            .build();
        Some(back_to_idle(state, result))
    }

    async fn on_timeout(&self, ctx: &TransactionContext) {
        ctx.set_state(GattState::Idle);
    }
}

/// What a peripheral should push for a subscribed characteristic.
///
/// 外设针对已订阅特征应推送的内容。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationMode {
    Notify,
    Indicate,
    Disabled,
}

impl NotificationMode {
    /// The CCCD value for this mode, little endian.
    fn descriptor_value(self) -> &'static [u8] {
        match self {
            NotificationMode::Notify => &[0x01, 0x00],
            NotificationMode::Indicate => &[0x02, 0x00],
            NotificationMode::Disabled => &[0x00, 0x00],
        }
    }
}

/// Enables or disables notifications by writing the CCCD of a characteristic.
///
/// 通过写入特征的CCCD来启用或禁用通知。
#[derive(Debug)]
pub struct SubscribeOperation {
    service: Uuid,
    characteristic: Uuid,
    mode: NotificationMode,
}

impl SubscribeOperation {
    pub fn new(service: Uuid, characteristic: Uuid, mode: NotificationMode) -> Self {
        Self {
            service,
            characteristic,
            mode,
        }
    }
}

#[async_trait]
impl GattOperation for SubscribeOperation {
    fn name(&self) -> &'static str {
        "subscribe"
    }

    fn target_state(&self) -> GattState {
        GattState::WriteDescriptorSuccess
    }

    async fn execute(&self, ctx: &TransactionContext) {
        let Some(handle) = require_handle(ctx, self.name()) else {
            return;
        };
        ctx.set_state(GattState::WritingDescriptor);
        let written = handle
            .write_descriptor(
                self.service,
                self.characteristic,
                CLIENT_CHARACTERISTIC_CONFIGURATION,
                Bytes::from_static(self.mode.descriptor_value()),
            )
            .await;
        if let Err(err) = written {
            reject(ctx, self.name(), GattState::FailureWritingDescriptor, err);
        }
    }

    fn on_gatt_event(&self, event: &GattEvent, _ctx: &TransactionContext) -> Option<Outcome> {
        let GattEvent::DescriptorWrite {
            status,
            characteristic,
            descriptor,
        } = event
        else {
            return None;
        };
        if *characteristic != self.characteristic || *descriptor != CLIENT_CHARACTERISTIC_CONFIGURATION {
            return None;
        }
        let (state, result) = settle(
            *status,
            GattState::WriteDescriptorSuccess,
            GattState::FailureWritingDescriptor,
        );
        let result = result
            .service_uuid(self.service)
            .characteristic_uuid(self.characteristic)
            .descriptor_uuid(CLIENT_CHARACTERISTIC_CONFIGURATION)
            .data(Bytes::from_static(self.mode.descriptor_value()))
            .build();
        Some(back_to_idle(state, result))
    }

    async fn on_timeout(&self, ctx: &TransactionContext) {
        ctx.set_state(GattState::Idle);
    }
}

#[derive(Debug)]
pub struct RequestMtuOperation {
    mtu: u16,
}

impl RequestMtuOperation {
    pub fn new(mtu: u16) -> Self {
        Self { mtu }
    }
}

#[async_trait]
impl GattOperation for RequestMtuOperation {
    fn name(&self) -> &'static str {
        "request_mtu"
    }

    fn target_state(&self) -> GattState {
        GattState::RequestMtuSuccess
    }

    async fn execute(&self, ctx: &TransactionContext) {
        let Some(handle) = require_handle(ctx, self.name()) else {
            return;
        };
        ctx.set_state(GattState::RequestingMtu);
        if let Err(err) = handle.request_mtu(self.mtu).await {
            reject(ctx, self.name(), GattState::FailureRequestingMtu, err);
        }
    }

    fn on_gatt_event(&self, event: &GattEvent, _ctx: &TransactionContext) -> Option<Outcome> {
        let GattEvent::MtuChanged { status, mtu } = event else {
            return None;
        };
        // 对端可能协商出比请求值更小的MTU
        let (state, result) = settle(*status, GattState::RequestMtuSuccess, GattState::FailureRequestingMtu);
        Some(back_to_idle(state, result.mtu(*mtu).build()))
    }

    async fn on_timeout(&self, ctx: &TransactionContext) {
        ctx.set_state(GattState::Idle);
    }
}

#[derive(Debug, Default)]
pub struct ReadRssiOperation;

impl ReadRssiOperation {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GattOperation for ReadRssiOperation {
    fn name(&self) -> &'static str {
        "read_rssi"
    }

    fn target_state(&self) -> GattState {
        GattState::ReadRssiSuccess
    }

    async fn execute(&self, ctx: &TransactionContext) {
        let Some(handle) = require_handle(ctx, self.name()) else {
            return;
        };
        ctx.set_state(GattState::ReadingRssi);
        if let Err(err) = handle.read_rssi().await {
            reject(ctx, self.name(), GattState::FailureReadingRssi, err);
        }
    }

    fn on_gatt_event(&self, event: &GattEvent, _ctx: &TransactionContext) -> Option<Outcome> {
        let GattEvent::RssiRead { status, rssi } = event else {
            return None;
        };
        let (state, result) = settle(*status, GattState::ReadRssiSuccess, GattState::FailureReadingRssi);
        Some(back_to_idle(state, result.rssi(*rssi).build()))
    }

    async fn on_timeout(&self, ctx: &TransactionContext) {
        ctx.set_state(GattState::Idle);
    }
}

#[derive(Debug)]
pub struct SetPreferredPhyOperation {
    tx: Phy,
    rx: Phy,
}

impl SetPreferredPhyOperation {
    pub fn new(tx: Phy, rx: Phy) -> Self {
        Self { tx, rx }
    }
}

#[async_trait]
impl GattOperation for SetPreferredPhyOperation {
    fn name(&self) -> &'static str {
        "set_preferred_phy"
    }

    fn target_state(&self) -> GattState {
        GattState::RequestPhySuccess
    }

    async fn execute(&self, ctx: &TransactionContext) {
        let Some(handle) = require_handle(ctx, self.name()) else {
            return;
        };
        ctx.set_state(GattState::RequestingPhy);
        if let Err(err) = handle.set_preferred_phy(self.tx, self.rx).await {
            reject(ctx, self.name(), GattState::FailureRequestingPhy, err);
        }
    }

    fn on_gatt_event(&self, event: &GattEvent, _ctx: &TransactionContext) -> Option<Outcome> {
        let GattEvent::PhyUpdated { status, tx_phy, rx_phy } = event else {
            return None;
        };
        let (state, result) = settle(*status, GattState::RequestPhySuccess, GattState::FailureRequestingPhy);
        Some(back_to_idle(state, result.phy(*tx_phy, *rx_phy).build()))
    }

    async fn on_timeout(&self, ctx: &TransactionContext) {
        ctx.set_state(GattState::Idle);
    }
}

/// Forces the client connection into a given state.
///
/// Belongs to the state-reset category, so the guard always lets it through,
/// even with the radio off. Used to recover from error states.
///
/// 强制将客户端连接设置为指定状态。属于状态重置类别，守卫总是放行，即使无线电已关闭。
#[derive(Debug)]
pub struct SetClientStateOperation {
    state: GattState,
}

impl SetClientStateOperation {
    pub fn new(state: GattState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl GattOperation for SetClientStateOperation {
    fn name(&self) -> &'static str {
        "set_client_state"
    }

    fn target_state(&self) -> GattState {
        self.state
    }

    fn category(&self) -> TransactionCategory {
        TransactionCategory::StateReset
    }

    async fn execute(&self, ctx: &TransactionContext) {
        if require_client(ctx, self.name()).is_none() {
            return;
        }
        let result = TransactionResult::new(TransactionStatus::Success, self.state);
        ctx.finish(Outcome::new(result).then_state(self.state));
    }
}
