//! The terminal outcome of a transaction.
//!
//! 事务的最终结果。

use crate::state::GattState;
use bytes::Bytes;
use uuid::Uuid;

/// How a transaction ended.
///
/// 事务的结束方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// The radio confirmed the operation.
    /// 无线电确认了操作。
    Success,
    /// The radio rejected or failed the operation.
    /// 无线电拒绝了操作或操作失败。
    Failure,
    /// The connection state did not allow the operation; the radio was never touched.
    /// 连接状态不允许该操作；从未触及无线电。
    InvalidState,
    /// No terminal callback arrived in time.
    /// 在规定时间内没有收到最终回调。
    Timeout,
}

/// Physical layer modes reported by PHY updates.
///
/// PHY更新报告的物理层模式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phy {
    Le1M,
    Le2M,
    LeCoded,
}

/// An immutable record of a finished transaction.
///
/// Fields unrelated to the transaction kind keep their defaults: empty data,
/// `None` identifiers, zero RSSI.
///
/// 已完成事务的不可变记录。与事务类型无关的字段保持默认值。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    status: TransactionStatus,
    gatt_state: GattState,
    transaction_name: &'static str,
    response_status: i32,
    data: Bytes,
    service_uuid: Option<Uuid>,
    characteristic_uuid: Option<Uuid>,
    descriptor_uuid: Option<Uuid>,
    services: Vec<Uuid>,
    rssi: i32,
    mtu: Option<u16>,
    tx_phy: Option<Phy>,
    rx_phy: Option<Phy>,
    sub_results: Vec<TransactionResult>,
}

impl TransactionResult {
    pub fn builder(status: TransactionStatus, gatt_state: GattState) -> TransactionResultBuilder {
        TransactionResultBuilder {
            inner: TransactionResult {
                status,
                gatt_state,
                transaction_name: "",
                response_status: 0,
                data: Bytes::new(),
                service_uuid: None,
                characteristic_uuid: None,
                descriptor_uuid: None,
                services: Vec::new(),
                rssi: 0,
                mtu: None,
                tx_phy: None,
                rx_phy: None,
                sub_results: Vec::new(),
            },
        }
    }

    /// Shorthand for a result with no payload.
    pub fn new(status: TransactionStatus, gatt_state: GattState) -> Self {
        Self::builder(status, gatt_state).build()
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == TransactionStatus::Success
    }

    pub fn gatt_state(&self) -> GattState {
        self.gatt_state
    }

    pub fn transaction_name(&self) -> &'static str {
        self.transaction_name
    }

    /// The native status code the radio reported, if any.
    /// 无线电报告的原生状态码。
    pub fn response_status(&self) -> i32 {
        self.response_status
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn service_uuid(&self) -> Option<Uuid> {
        self.service_uuid
    }

    pub fn characteristic_uuid(&self) -> Option<Uuid> {
        self.characteristic_uuid
    }

    pub fn descriptor_uuid(&self) -> Option<Uuid> {
        self.descriptor_uuid
    }

    pub fn services(&self) -> &[Uuid] {
        &self.services
    }

    pub fn rssi(&self) -> i32 {
        self.rssi
    }

    pub fn mtu(&self) -> Option<u16> {
        self.mtu
    }

    pub fn tx_phy(&self) -> Option<Phy> {
        self.tx_phy
    }

    pub fn rx_phy(&self) -> Option<Phy> {
        self.rx_phy
    }

    /// Results of the children that ran before this result was produced, in
    /// execution order.
    ///
    /// 在产生此结果之前运行的子事务的结果，按执行顺序排列。
    pub fn sub_results(&self) -> &[TransactionResult] {
        &self.sub_results
    }

    /// Returns a copy with `earlier` placed in front of the existing sub-results.
    pub(crate) fn with_earlier_results(mut self, mut earlier: Vec<TransactionResult>) -> Self {
        earlier.append(&mut self.sub_results);
        self.sub_results = earlier;
        self
    }

    pub(crate) fn named(mut self, name: &'static str) -> Self {
        if self.transaction_name.is_empty() {
            self.transaction_name = name;
        }
        self
    }
}

/// Builder for [`TransactionResult`].
#[derive(Debug)]
pub struct TransactionResultBuilder {
    inner: TransactionResult,
}

impl TransactionResultBuilder {
    pub fn transaction_name(mut self, name: &'static str) -> Self {
        self.inner.transaction_name = name;
        self
    }

    pub fn response_status(mut self, status: i32) -> Self {
        self.inner.response_status = status;
        self
    }

    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.inner.data = data.into();
        self
    }

    pub fn service_uuid(mut self, uuid: Uuid) -> Self {
        self.inner.service_uuid = Some(uuid);
        self
    }

    pub fn characteristic_uuid(mut self, uuid: Uuid) -> Self {
        self.inner.characteristic_uuid = Some(uuid);
        self
    }

    pub fn descriptor_uuid(mut self, uuid: Uuid) -> Self {
        self.inner.descriptor_uuid = Some(uuid);
        self
    }

    pub fn services(mut self, services: Vec<Uuid>) -> Self {
        self.inner.services = services;
        self
    }

    pub fn rssi(mut self, rssi: i32) -> Self {
        self.inner.rssi = rssi;
        self
    }

    pub fn mtu(mut self, mtu: u16) -> Self {
        self.inner.mtu = Some(mtu);
        self
    }

    pub fn phy(mut self, tx: Phy, rx: Phy) -> Self {
        self.inner.tx_phy = Some(tx);
        self.inner.rx_phy = Some(rx);
        self
    }

    pub fn sub_results(mut self, results: Vec<TransactionResult>) -> Self {
        self.inner.sub_results = results;
        self
    }

    pub fn build(self) -> TransactionResult {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrelated_fields_keep_defaults() {
        let result = TransactionResult::builder(TransactionStatus::Success, GattState::RequestMtuSuccess)
            .mtu(247)
            .build();

        assert!(result.is_success());
        assert_eq!(result.mtu(), Some(247));
        assert!(result.data().is_empty());
        assert_eq!(result.rssi(), 0);
        assert_eq!(result.characteristic_uuid(), None);
        assert_eq!(result.tx_phy(), None);
        assert!(result.sub_results().is_empty());
        assert_eq!(result.response_status(), 0);
    }

    #[test]
    fn test_earlier_results_are_prepended() {
        let first = TransactionResult::new(TransactionStatus::Success, GattState::Connected);
        let nested = TransactionResult::new(TransactionStatus::Success, GattState::DiscoverySuccess);
        let last = TransactionResult::builder(TransactionStatus::Success, GattState::Idle)
            .sub_results(vec![nested.clone()])
            .build()
            .with_earlier_results(vec![first.clone()]);

        assert_eq!(last.sub_results(), &[first, nested]);
    }

    #[test]
    fn test_named_does_not_override() {
        let result = TransactionResult::builder(TransactionStatus::Failure, GattState::Idle)
            .transaction_name("read_characteristic")
            .build()
            .named("composite");
        assert_eq!(result.transaction_name(), "read_characteristic");

        let unnamed = TransactionResult::new(TransactionStatus::Timeout, GattState::Idle).named("mtu");
        assert_eq!(unnamed.transaction_name(), "mtu");
    }
}
