// heartbeat_core/src/connection.rs

//! 心跳子系统所消费的连接抽象。
//!
//! 连接由外部的服务端创建并拥有（登记在连接注册表中）；心跳子系统只通过
//! `Connection` trait 使用它：读取标识、状态与出站缓冲占用，发送数据，请求关闭。
//! 底层传输的分帧、TLS、握手等细节都不在此处体现。

use heartbeat_models::ConnectionState;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// 连接的唯一标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// 生成一个新的随机标识 (UUID v4)。
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 一条已建立的双工连接。
///
/// 实现方需要保证这些方法可以在任意回调中同步调用且不会阻塞事件循环：
/// `send` 只是把数据放入出站队列，`close` 只是发出关闭请求。
pub trait Connection: Send + Sync {
    /// 连接的唯一标识。
    fn id(&self) -> ConnectionId;

    /// 当前生命周期状态。
    fn state(&self) -> ConnectionState;

    /// 出站缓冲中尚未刷出到传输层的字节数。大于零表示存在背压。
    fn buffered_amount(&self) -> usize;

    /// 写入一帧数据。调用方（背压发送器）保证只在 `Open` 且缓冲为空时调用。
    fn send(&self, frame: &str);

    /// 请求关闭连接。
    fn close(&self);
}

/// 对连接的共享引用。
pub type ConnectionRef = Arc<dyn Connection>;
