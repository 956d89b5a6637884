// heartbeat_core/src/testing.rs

//! 测试辅助工具：可编程的模拟连接，以及一个用模拟时钟驱动的最小“服务端”。
//!
//! `TestServer` 扮演注册表的拥有者：连接建立时登记并发布 `connection-opened`，
//! 连接关闭时移除并发布 `connection-closed`，收到帧时发布 `message-received`。
//! 单元测试与 `tests/` 下的集成测试共用这些工具。

use heartbeat_models::ConnectionState;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::connection::{Connection, ConnectionId};
use crate::event_bus::{ConnectionEvent, EventBus};
use crate::message;
use crate::registry::ConnectionRegistry;
use crate::scheduler::{ManualScheduler, lock};

type CloseHook = Arc<dyn Fn(ConnectionId) + Send + Sync>;

/// 行为可编程的模拟连接。
pub struct MockConnection {
    id: ConnectionId,
    state: AtomicU8,
    /// 持续报告的缓冲占用
    buffered: AtomicUsize,
    /// 接下来还要报告“缓冲非空”的检查次数
    busy_polls: AtomicUsize,
    polls: AtomicUsize,
    close_calls: AtomicUsize,
    sent: Mutex<Vec<String>>,
    on_close: Mutex<Option<CloseHook>>,
}

impl MockConnection {
    /// 创建一个处于 `Open` 状态、缓冲为空的连接。
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(),
            state: AtomicU8::new(ConnectionState::Open.as_u8()),
            buffered: AtomicUsize::new(0),
            busy_polls: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            on_close: Mutex::new(None),
        })
    }

    /// 直接设置连接状态（不触发关闭钩子）。
    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// 设置持续报告的缓冲占用；非零即表示缓冲永远排不空。
    pub fn set_buffered(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }

    /// 接下来的 `polls` 次缓冲检查报告缓冲非空，之后恢复为 `set_buffered` 的值。
    pub fn busy_for(&self, polls: usize) {
        self.busy_polls.store(polls, Ordering::SeqCst);
    }

    /// 缓冲占用被检查的次数。
    pub fn buffer_polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// `close()` 被调用的次数。
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// 已写入的所有帧。
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    /// 已写入帧中类型为 `message_type` 的数量。
    pub fn sent_of_type(&self, message_type: &str) -> usize {
        lock(&self.sent)
            .iter()
            .filter_map(|frame| message::decode(frame).ok())
            .filter(|envelope| envelope.message_type == message_type)
            .count()
    }

    /// 设置首次关闭时调用的钩子。
    pub fn on_close<F>(&self, hook: F)
    where
        F: Fn(ConnectionId) + Send + Sync + 'static,
    {
        *lock(&self.on_close) = Some(Arc::new(hook));
    }
}

impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn buffered_amount(&self) -> usize {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let busy = self
            .busy_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if busy {
            usize::max(self.buffered.load(Ordering::SeqCst), 1)
        } else {
            self.buffered.load(Ordering::SeqCst)
        }
    }

    fn send(&self, frame: &str) {
        lock(&self.sent).push(frame.to_string());
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let previous = self.state.swap(ConnectionState::Closed.as_u8(), Ordering::SeqCst);
        if ConnectionState::from_u8(previous) == ConnectionState::Closed {
            return;
        }
        let hook = lock(&self.on_close).clone();
        if let Some(hook) = hook {
            hook(self.id);
        }
    }
}

/// 用模拟时钟驱动的最小服务端：维护注册表并向总线发布事件。
pub struct TestServer {
    pub scheduler: Arc<ManualScheduler>,
    pub registry: ConnectionRegistry,
    pub bus: EventBus,
}

impl TestServer {
    pub fn new() -> Self {
        Self {
            scheduler: Arc::new(ManualScheduler::new()),
            registry: ConnectionRegistry::new(),
            bus: EventBus::new(),
        }
    }

    /// 建立一个新连接：登记到注册表并发布 `connection-opened`。
    /// 连接被关闭时自动从注册表移除并发布 `connection-closed`。
    pub fn connect(&self) -> Arc<MockConnection> {
        let connection = MockConnection::new();
        let registry = self.registry.clone();
        let bus = self.bus.clone();
        connection.on_close(move |id| {
            registry.remove(&id);
            bus.publish(&ConnectionEvent::Closed(id));
        });
        self.registry.add(connection.clone());
        self.bus.publish(&ConnectionEvent::Opened(connection.id()));
        connection
    }

    /// 模拟收到一帧入站数据；无法解码的帧以 `envelope: None` 发布。
    pub fn receive(&self, connection: &Arc<MockConnection>, frame: &str) {
        let envelope = message::decode(frame).ok();
        self.bus.publish(&ConnectionEvent::MessageReceived {
            connection: connection.clone(),
            envelope,
        });
    }

    /// 模拟连接出错（不改变注册表）。
    pub fn report_error(&self, connection: &Arc<MockConnection>) {
        self.bus.publish(&ConnectionEvent::Error(connection.id()));
    }
}

impl Default for TestServer {
    fn default() -> Self {
        Self::new()
    }
}
