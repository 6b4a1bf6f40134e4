//! 连接状态守卫模块
//! Connection State Guard Module
//!
//! 该模块负责在事务触及无线电之前，验证从当前连接状态到事务目标状态的转换是否合法。
//! 所有检查都是纯函数，不修改连接。
//!
//! This module validates, before a transaction ever touches the radio, whether
//! moving from the current connection state towards the transaction's target
//! state is legal. Every check is a pure function and never mutates the
//! connection.

use crate::{
    config::GuardConfig,
    state::{GattState, StateType},
    transaction::GattOperation,
};

/// The category of a transaction as seen by the guard.
///
/// 守卫所看到的事务类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionCategory {
    /// A regular operation, subject to every rule.
    /// 普通操作，受所有规则约束。
    #[default]
    Ordinary,
    /// An internal state reset. Always allowed, even with the radio off.
    /// 内部状态重置。总是允许，即使无线电已关闭。
    StateReset,
    /// Adding a service to the local GATT server.
    /// 向本地GATT服务端添加服务。
    AddService,
}

/// Outcome of a guard check.
///
/// 守卫检查的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardResult {
    Ok,
    InvalidTargetState,
}

impl GuardResult {
    pub fn is_ok(self) -> bool {
        self == GuardResult::Ok
    }
}

/// The rule that rejected a transition. Only the first failing rule is reported.
///
/// 拒绝转换的规则。只报告第一个失败的规则。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardViolation {
    /// The radio is off.
    RadioOff,
    /// Connecting while already connected or in a failed connection state.
    AlreadyConnected,
    /// Disconnecting while not connected.
    NotConnected,
    /// Anything but a connect attempt while disconnected or disconnecting.
    Disconnected,
    /// The local server is busy or failed and cannot take a new service.
    ServerNotIdle,
    /// A general operation issued from an error state.
    ErrorState,
}

/// 状态守卫，负责所有事务前置条件的检查
/// State guard responsible for all transaction precondition checks
#[derive(Debug, Clone, Default)]
pub struct StateGuard {
    guard_add_services: bool,
}

impl StateGuard {
    pub fn new(config: &GuardConfig) -> Self {
        Self {
            guard_add_services: config.guard_add_services,
        }
    }

    /// 检查事务在当前状态下是否可以执行
    /// Check whether a transaction may run from the current state
    pub fn check_transaction(&self, current: GattState, operation: &dyn GattOperation) -> GuardResult {
        self.check(current, operation.target_state(), operation.category())
    }

    /// 检查从 `current` 到 `target` 的转换
    /// Check the transition from `current` towards `target`
    pub fn check(
        &self,
        current: GattState,
        target: GattState,
        category: TransactionCategory,
    ) -> GuardResult {
        match self.violation(current, target, category) {
            None => GuardResult::Ok,
            Some(_) => GuardResult::InvalidTargetState,
        }
    }

    /// Returns the first rule the transition breaks, in evaluation order.
    ///
    /// 按求值顺序返回转换违反的第一条规则。
    pub fn violation(
        &self,
        current: GattState,
        target: GattState,
        category: TransactionCategory,
    ) -> Option<GuardViolation> {
        if category == TransactionCategory::StateReset {
            return None;
        }
        if current == GattState::BtOff {
            return Some(GuardViolation::RadioOff);
        }
        if !Self::can_connect(current, target) {
            return Some(GuardViolation::AlreadyConnected);
        }
        if !Self::can_disconnect(current, target) {
            return Some(GuardViolation::NotConnected);
        }
        if !Self::is_allowed_while_disconnected(current, target) {
            return Some(GuardViolation::Disconnected);
        }
        if category == TransactionCategory::AddService
            && self.guard_add_services
            && !Self::is_valid_for_adding_services(current)
        {
            return Some(GuardViolation::ServerNotIdle);
        }
        if !Self::is_valid_for_general_operation(current, target) {
            return Some(GuardViolation::ErrorState);
        }
        None
    }

    /// 连接只能从断开或正在连接状态发起
    /// A connect is only legal from `Disconnected` or `Connecting`
    fn can_connect(current: GattState, target: GattState) -> bool {
        target != GattState::Connected
            || matches!(current, GattState::Disconnected | GattState::Connecting)
    }

    /// 断开只能从空闲或已连接状态发起
    /// A disconnect is only legal from `Idle` or `Connected`
    fn can_disconnect(current: GattState, target: GattState) -> bool {
        target != GattState::Disconnected
            || matches!(current, GattState::Idle | GattState::Connected)
    }

    /// 断开状态下只允许连接
    /// While disconnected, only a connect may proceed
    fn is_allowed_while_disconnected(current: GattState, target: GattState) -> bool {
        !matches!(current, GattState::Disconnected | GattState::Disconnecting)
            || target == GattState::Connected
    }

    fn is_valid_for_adding_services(current: GattState) -> bool {
        current == GattState::Idle
    }

    /// 通用操作不能从错误状态直接发起
    /// General operations never start directly from an error state
    fn is_valid_for_general_operation(current: GattState, target: GattState) -> bool {
        target.state_type() != StateType::Idle || current.state_type() != StateType::Error
    }
}
