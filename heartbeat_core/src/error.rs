// heartbeat_core/src/error.rs

//! 定义心跳核心库相关的错误类型。
//!
//! 注意：存活巡检、心跳控制器与背压发送器本身不会向调用方返回错误，
//! 异常情况只会被记录日志，最坏结果是关闭受影响的连接。
//! 这里的错误类型服务于入站帧解码、配置校验以及底层传输；出站编码不会失败，因此没有序列化错误。

use thiserror::Error;

/// 心跳核心库的统一错误类型。
#[derive(Error, Debug)]
pub enum HeartbeatError {
    /// 入站帧无法解码为信封时返回（不是 JSON 对象、缺少 `type` 字段等）。
    #[error("反序列化错误: {0}")]
    DeserializationError(String),

    /// 配置参数不合法，例如心跳间隔为零。
    #[error("配置无效: {0}")]
    InvalidConfig(String),

    /// WebSocket 协议相关的错误。
    #[error("WebSocket协议错误: {0}")]
    WebSocketProtocolError(#[from] tokio_tungstenite::tungstenite::Error),

    /// 底层 I/O 错误。
    #[error("I/O错误: {0}")]
    IoError(#[from] std::io::Error),
}
