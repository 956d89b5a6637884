//! `heartbeat_core` 是 WebSocket 服务端的连接心跳子系统。
//!
//! 它在注册表非空时周期性地对所有连接发起存活巡检，
//! 关闭在一个心跳间隔内没有任何入站流量的连接，并即时回复客户端发来的 `ping`。
//!
//! 主要模块包括：
//! - `message`: 心跳帧的编码与入站帧的解码。
//! - `sender`: 背压感知的发送器，缓冲未排空时延迟重试。
//! - `sweep`: 一轮 Ping / 确认 / 超时关闭的存活巡检。
//! - `controller`: 根据注册表占用数量在 IDLE 与 ACTIVE 之间切换的心跳控制器。
//! - `registry` / `event_bus`: 服务端维护的连接注册表与生命周期事件总线。
//! - `scheduler`: 可注入的定时调度器（Tokio 实现与模拟时钟实现）。
//! - `server`: 基于 `tokio-tungstenite` 的服务端传输层。
//! - `testing`: 模拟连接与模拟服务端，供单元测试与集成测试使用（`test-util` 特性）。

pub mod connection;
pub mod controller;
pub mod error;
pub mod event_bus;
pub mod message;
pub mod registry;
pub mod scheduler;
pub mod sender;
pub mod server;
pub mod sweep;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use connection::{Connection, ConnectionId, ConnectionRef};
pub use controller::HeartbeatController;
pub use error::HeartbeatError;
pub use event_bus::{ConnectionEvent, EventBus, Subscription, Topic};
pub use registry::{ConnectionRegistry, Registry};
pub use scheduler::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler};
pub use sender::{BackpressureSender, Delivery, DeliveryStatus, DropReason, RetryPolicy};
pub use sweep::{LivenessSweep, SweepOutcome};
