// heartbeat_core/src/event_bus.rs

//! 连接生命周期与入站消息的事件总线。
//!
//! 事件总线是一个显式构造的实例（不是全局单例），由服务端发布事件，
//! 心跳控制器和每一轮存活巡检通过 `subscribe` 订阅感兴趣的主题。
//! 订阅返回 `Subscription` 句柄，句柄被丢弃或调用 `unsubscribe()` 时自动退订。
//!
//! `publish` 在调用方的上下文中同步分发：先在锁内取出匹配主题的处理函数快照，
//! 释放锁之后再逐个调用。因此处理函数内部可以安全地订阅、退订或再次发布事件；
//! 分发过程中新增的订阅者不会收到本次事件，分发过程中被退订的订阅者也不再收到本次事件。

use heartbeat_models::Envelope;
use log::debug;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::connection::{Connection, ConnectionId, ConnectionRef};
use crate::scheduler::lock;

/// 事件主题。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `connection-opened`
    ConnectionOpened,
    /// `connection-error`
    ConnectionError,
    /// `connection-closed`
    ConnectionClosed,
    /// `message-received`
    MessageReceived,
}

impl Topic {
    /// 主题在日志中的名称。
    pub fn name(self) -> &'static str {
        match self {
            Topic::ConnectionOpened => "connection-opened",
            Topic::ConnectionError => "connection-error",
            Topic::ConnectionClosed => "connection-closed",
            Topic::MessageReceived => "message-received",
        }
    }
}

/// 总线上传递的事件。
#[derive(Clone)]
pub enum ConnectionEvent {
    /// 新连接已建立并登记到注册表。
    Opened(ConnectionId),
    /// 连接发生错误。
    Error(ConnectionId),
    /// 连接已关闭并从注册表移除。
    Closed(ConnectionId),
    /// 收到一条入站消息。
    ///
    /// `envelope` 为 `None` 表示该帧无法解码为信封（非 JSON、缺少 `type` 等），
    /// 它依然是来自该连接的流量，可以作为存活证明。
    MessageReceived {
        connection: ConnectionRef,
        envelope: Option<Envelope>,
    },
}

impl ConnectionEvent {
    /// 事件所属的主题。
    pub fn topic(&self) -> Topic {
        match self {
            ConnectionEvent::Opened(_) => Topic::ConnectionOpened,
            ConnectionEvent::Error(_) => Topic::ConnectionError,
            ConnectionEvent::Closed(_) => Topic::ConnectionClosed,
            ConnectionEvent::MessageReceived { .. } => Topic::MessageReceived,
        }
    }

    /// 事件关联的连接标识。
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Opened(id)
            | ConnectionEvent::Error(id)
            | ConnectionEvent::Closed(id) => *id,
            ConnectionEvent::MessageReceived { connection, .. } => connection.id(),
        }
    }
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::MessageReceived { connection, envelope } => f
                .debug_struct("MessageReceived")
                .field("connection", &connection.id())
                .field("envelope", envelope)
                .finish(),
            other => f
                .debug_tuple(other.topic().name())
                .field(&other.connection_id())
                .finish(),
        }
    }
}

type Handler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    topics: Vec<Topic>,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    handlers: Vec<HandlerEntry>,
}

/// 事件总线。克隆得到的是同一条总线的另一个引用。
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    /// 创建一条没有任何订阅者的总线。
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅一组主题。返回的句柄被丢弃时自动退订。
    pub fn subscribe<F>(&self, topics: &[Topic], handler: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.handlers.push(HandlerEntry {
            id,
            topics: topics.to_vec(),
            handler: Arc::new(handler),
        });
        debug!("[事件总线] 新增订阅 #{}，主题: {:?}", id, topics);
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// 同步地把事件分发给所有订阅了该主题、且在分发时刻仍然有效的处理函数。
    pub fn publish(&self, event: &ConnectionEvent) {
        let topic = event.topic();
        let targets: Vec<(u64, Handler)> = lock(&self.inner)
            .handlers
            .iter()
            .filter(|entry| entry.topics.contains(&topic))
            .map(|entry| (entry.id, Arc::clone(&entry.handler)))
            .collect();

        for (id, handler) in targets {
            // 前一个处理函数可能已经把后面的订阅者退订
            let still_subscribed = lock(&self.inner).handlers.iter().any(|entry| entry.id == id);
            if still_subscribed {
                handler(event);
            }
        }
    }

    /// 当前有效的订阅数量。
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).handlers.len()
    }

    fn unsubscribe_id(inner: &Mutex<BusInner>, id: u64) -> bool {
        let mut inner = lock(inner);
        let before = inner.handlers.len();
        inner.handlers.retain(|entry| entry.id != id);
        before != inner.handlers.len()
    }
}

/// 订阅句柄。被丢弃或显式调用 `unsubscribe()` 时退订；重复退订无副作用。
pub struct Subscription {
    id: u64,
    bus: Weak<Mutex<BusInner>>,
}

impl Subscription {
    /// 显式退订。
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            if EventBus::unsubscribe_id(&inner, self.id) {
                debug!("[事件总线] 订阅 #{} 已退订。", self.id);
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
