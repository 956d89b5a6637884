//! 通用枚举模块。
//!
//! 本模块定义了心跳子系统多个组件之间共享的枚举类型，
//! 确保连接状态、控制器状态等概念在整个系统中有一致的表示。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 表示一条双工连接当前所处的生命周期状态。
///
/// 只有处于 `Open` 状态的连接才允许写入数据；背压发送器在每次尝试写入前都会检查此状态，
/// 连接一旦离开 `Open`，所有尚未完成的发送都会被静默丢弃。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// 连接已建立，可以正常收发数据。
    Open,
    /// 已请求关闭（例如心跳超时后调用了 `close()`），底层链路正在拆除。
    Closing,
    /// 连接已彻底关闭。
    Closed,
}

impl ConnectionState {
    /// 将状态编码为 `u8`，供连接实现以原子变量保存状态。
    pub fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Open => 0,
            ConnectionState::Closing => 1,
            ConnectionState::Closed => 2,
        }
    }

    /// `as_u8` 的逆操作；未知取值一律视为 `Closed`。
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Open => "OPEN",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// 心跳控制器的两态状态机。
///
/// - `Idle`: 没有任何周期定时器在运行（连接注册表为空）。
/// - `Active`: 恰好有一个周期定时器在驱动存活巡检（连接注册表非空）。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ControllerState {
    #[default]
    Idle,
    Active,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Idle => "IDLE",
            ControllerState::Active => "ACTIVE",
        };
        f.write_str(name)
    }
}
