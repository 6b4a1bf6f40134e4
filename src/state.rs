//! Defines the operational state of a GATT connection.
//!
//! 定义GATT连接的运行状态。

use std::fmt;

/// The category a [`GattState`] belongs to.
///
/// 一个 [`GattState`] 所属的类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateType {
    /// Nothing is happening on the connection; a new operation may start.
    /// 连接上没有进行中的操作，可以开始新的操作。
    Idle,
    /// An operation has been handed to the radio and is awaiting completion.
    /// 操作已交给无线电，正在等待完成。
    InProgress,
    /// The last operation failed, or the radio is off.
    /// 上一个操作失败，或者无线电已关闭。
    Error,
}

/// The single present condition of one connection, client or server side.
///
/// 单个连接（客户端或服务端）当前的唯一状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattState {
    Idle,
    BtOff,

    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    FailureConnecting,
    FailureDisconnecting,

    Discovering,
    DiscoverySuccess,
    DiscoveryFailure,

    ReadingCharacteristic,
    ReadCharacteristicSuccess,
    FailureReadingCharacteristic,

    WritingCharacteristic,
    WriteCharacteristicSuccess,
    FailureWritingCharacteristic,

    WritingDescriptor,
    WriteDescriptorSuccess,
    FailureWritingDescriptor,

    RequestingMtu,
    RequestMtuSuccess,
    FailureRequestingMtu,

    ReadingRssi,
    ReadRssiSuccess,
    FailureReadingRssi,

    RequestingPhy,
    RequestPhySuccess,
    FailureRequestingPhy,

    AddingService,
    AddServiceSuccess,
    FailureAddingService,
}

impl GattState {
    /// Returns the category of this state.
    /// 返回该状态的类别。
    pub fn state_type(self) -> StateType {
        use GattState::*;

        match self {
            Idle | Disconnected | Connected => StateType::Idle,
            DiscoverySuccess
            | ReadCharacteristicSuccess
            | WriteCharacteristicSuccess
            | WriteDescriptorSuccess
            | RequestMtuSuccess
            | ReadRssiSuccess
            | RequestPhySuccess
            | AddServiceSuccess => StateType::Idle,

            Connecting
            | Disconnecting
            | Discovering
            | ReadingCharacteristic
            | WritingCharacteristic
            | WritingDescriptor
            | RequestingMtu
            | ReadingRssi
            | RequestingPhy
            | AddingService => StateType::InProgress,

            BtOff
            | FailureConnecting
            | FailureDisconnecting
            | DiscoveryFailure
            | FailureReadingCharacteristic
            | FailureWritingCharacteristic
            | FailureWritingDescriptor
            | FailureRequestingMtu
            | FailureReadingRssi
            | FailureRequestingPhy
            | FailureAddingService => StateType::Error,
        }
    }

    /// Whether the state implies there is no link to the peer.
    /// 该状态是否意味着与对端没有链路。
    pub fn is_disconnected(self) -> bool {
        matches!(
            self,
            GattState::Disconnected | GattState::FailureConnecting | GattState::BtOff
        )
    }
}

impl fmt::Display for GattState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
