//! WebSocket 服务端模块。
//!
//! - `connection`: 实现心跳子系统 `Connection` trait 的 `WsConnection`。
//! - `service`: 接受连接、维护注册表、向事件总线发布连接事件与入站消息的 `WsService`。

pub mod connection;
pub mod service;
