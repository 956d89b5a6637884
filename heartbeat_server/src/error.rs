use heartbeat_core::HeartbeatError;
use thiserror::Error;

/// 应用的主要错误类型
///
/// 覆盖服务端启动与运行过程中的致命错误。心跳子系统本身的异常只记录日志，
/// 不会出现在这里。
#[derive(Error, Debug)]
pub enum AppError {
    #[error("WebSocket 服务错误: {0}")]
    WebSocketService(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("心跳核心错误: {0}")]
    Core(#[from] HeartbeatError),
}
