//! `heartbeat_models` 公共模型库 crate。
//!
//! 本 crate 集中定义了心跳（连接存活）子系统中各个 Rust 组件之间共享的核心数据结构和枚举类型：
//! `heartbeat_core` 核心库与 `heartbeat_server` 独立服务端都依赖这里的定义，
//! 以保证线上协议格式与连接状态的表示在各处一致。
//!
//! 主要包含以下类型的模型：
//! - **WebSocket 消息负载 (`ws_payloads`)**: 心跳协议使用的信封结构 `Envelope` 以及
//!   `ping` / `pong` 等协议消息类型常量。
//! - **通用枚举 (`enums`)**: 连接状态 (`ConnectionState`) 与心跳控制器状态 (`ControllerState`)。
//!
//! 设计原则：
//! - **共享性**: 所有在此 crate 中定义的模型都旨在被多个其他 crate 共享使用。
//! - **可调试性与克隆**: 所有模型都派生 `Debug` 和 `Clone`，以方便调试输出和创建副本。

pub mod enums; // 连接状态、控制器状态等通用枚举
pub mod ws_payloads; // 心跳协议信封与消息类型常量

pub use enums::{ConnectionState, ControllerState};
pub use ws_payloads::Envelope;
