//! `heartbeat_server` 服务端核心库。
//!
//! 带连接心跳检测的独立 WebSocket 服务器：接受客户端连接，
//! 周期性地对所有连接发起存活巡检，关闭失联的连接，并即时回复客户端的 `ping`。
//!
//! 主要模块包括：
//! - `config`: 管理应用的配置信息加载与访问。
//! - `error`: 定义应用特定的错误类型。
//! - `state`: 组装注册表、事件总线与心跳控制器。
//! - `ws_server`: 实现 WebSocket 服务端，处理客户端连接与入站消息。

pub mod config;
pub mod error;
pub mod state;
pub mod ws_server;
