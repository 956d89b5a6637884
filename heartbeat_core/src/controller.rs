// heartbeat_core/src/controller.rs

//! 心跳控制器。
//!
//! 控制器只有两个状态：
//! - `Idle`：注册表为空，没有任何周期定时器；
//! - `Active`：注册表非空，恰好有一个周期定时器每隔心跳间隔启动一轮 `LivenessSweep`。
//!
//! 状态只在 `recheck` 中根据注册表占用数量切换，`recheck` 由连接建立、出错、关闭事件触发。
//! 入站消息不会触发 `recheck`，但控制器会在任何状态下对 `ping` 立即回复 `pong`
//! （回显请求中的 `uid`），回复同样经过背压发送器。

use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use heartbeat_models::{ControllerState, Envelope};

use crate::connection::{Connection, ConnectionRef};
use crate::error::HeartbeatError;
use crate::event_bus::{ConnectionEvent, EventBus, Subscription, Topic};
use crate::message;
use crate::registry::Registry;
use crate::scheduler::{Scheduler, TimerHandle, lock};
use crate::sender::BackpressureSender;
use crate::sweep::LivenessSweep;

struct ControllerSlot {
    state: ControllerState,
    /// `Active` 状态下的周期定时器；`Idle` 状态下必为 `None`
    timer: Option<TimerHandle>,
    latest_sweep: Option<LivenessSweep>,
}

struct ControllerInner {
    registry: Arc<dyn Registry>,
    bus: EventBus,
    scheduler: Arc<dyn Scheduler>,
    sender: BackpressureSender,
    interval: Duration,
    slot: Mutex<ControllerSlot>,
    subscription: Mutex<Option<Subscription>>,
    sweep_counter: AtomicU64,
}

/// 心跳控制器。克隆得到的是同一个控制器。
#[derive(Clone)]
pub struct HeartbeatController {
    inner: Arc<ControllerInner>,
}

impl HeartbeatController {
    /// 创建一个处于 `Idle` 状态的控制器。心跳间隔必须大于零。
    ///
    /// 创建后需要调用 [`start`](Self::start) 才会开始订阅事件。
    pub fn new(
        registry: Arc<dyn Registry>,
        bus: EventBus,
        scheduler: Arc<dyn Scheduler>,
        sender: BackpressureSender,
        interval: Duration,
    ) -> Result<Self, HeartbeatError> {
        if interval.is_zero() {
            return Err(HeartbeatError::InvalidConfig("心跳间隔必须大于零".to_string()));
        }
        info!("[心跳控制器] 正在创建心跳控制器，心跳间隔: {:?}", interval);
        Ok(Self {
            inner: Arc::new(ControllerInner {
                registry,
                bus,
                scheduler,
                sender,
                interval,
                slot: Mutex::new(ControllerSlot {
                    state: ControllerState::Idle,
                    timer: None,
                    latest_sweep: None,
                }),
                subscription: Mutex::new(None),
                sweep_counter: AtomicU64::new(0),
            }),
        })
    }

    /// 订阅连接事件与入站消息，并按当前注册表占用数量做一次初始 `recheck`。
    ///
    /// 重复调用会替换之前的订阅。
    pub fn start(&self) {
        let weak: Weak<ControllerInner> = Arc::downgrade(&self.inner);
        let subscription = self.inner.bus.subscribe(
            &[
                Topic::ConnectionOpened,
                Topic::ConnectionError,
                Topic::ConnectionClosed,
                Topic::MessageReceived,
            ],
            move |event| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match event {
                    ConnectionEvent::MessageReceived {
                        connection,
                        envelope: Some(envelope),
                    } => ControllerInner::handle_message(&inner, connection, envelope),
                    ConnectionEvent::MessageReceived { envelope: None, .. } => {}
                    _ => ControllerInner::recheck(&inner),
                }
            },
        );
        let previous = lock(&self.inner.subscription).replace(subscription);
        if previous.is_some() {
            warn!("[心跳控制器] start() 被重复调用，旧的事件订阅已被替换。");
        }
        drop(previous);
        info!("[心跳控制器] 心跳控制器已启动。");
        ControllerInner::recheck(&self.inner);
    }

    /// 退订全部事件并取消周期定时器，控制器回到 `Idle`。
    ///
    /// 已经在进行中的巡检不受影响，会按各自的超时自然结束。
    pub fn stop(&self) {
        drop(lock(&self.inner.subscription).take());
        let timer = {
            let mut slot = lock(&self.inner.slot);
            slot.state = ControllerState::Idle;
            slot.timer.take()
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        info!("[心跳控制器] 心跳控制器已停止。");
    }

    /// 根据注册表占用数量切换状态。
    pub fn recheck(&self) {
        ControllerInner::recheck(&self.inner);
    }

    /// 处理一条入站消息：`ping` 立即回复 `pong`，其他消息忽略。
    pub fn handle_message(&self, connection: &ConnectionRef, envelope: &Envelope) {
        ControllerInner::handle_message(&self.inner, connection, envelope);
    }

    pub fn state(&self) -> ControllerState {
        lock(&self.inner.slot).state
    }

    /// 心跳间隔。
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// 最近一次启动的巡检。
    pub fn latest_sweep(&self) -> Option<LivenessSweep> {
        lock(&self.inner.slot).latest_sweep.clone()
    }
}

impl ControllerInner {
    fn recheck(inner: &Arc<ControllerInner>) {
        let occupancy = inner.registry.size();
        let mut slot = lock(&inner.slot);
        match (slot.state, occupancy > 0) {
            (ControllerState::Idle, true) => {
                let weak = Arc::downgrade(inner);
                let timer = inner.scheduler.every(
                    inner.interval,
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            ControllerInner::tick(&inner);
                        }
                    }),
                );
                slot.timer = Some(timer);
                slot.state = ControllerState::Active;
                info!("[心跳控制器] 当前连接数 {}，进入 ACTIVE 状态，开始周期心跳。", occupancy);
            }
            (ControllerState::Active, false) => {
                if let Some(timer) = slot.timer.take() {
                    timer.cancel();
                }
                slot.state = ControllerState::Idle;
                info!("[心跳控制器] 已无任何连接，进入 IDLE 状态，周期心跳已停止。");
            }
            (state, _) => {
                debug!("[心跳控制器] recheck：状态保持为 {}，当前连接数 {}。", state, occupancy);
            }
        }
    }

    /// 周期定时器的一次触发：启动新一轮巡检。
    fn tick(inner: &Arc<ControllerInner>) {
        let id = inner.sweep_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let sweep = LivenessSweep::start(
            id,
            inner.registry.as_ref(),
            &inner.bus,
            &inner.scheduler,
            &inner.sender,
            inner.interval,
        );
        lock(&inner.slot).latest_sweep = Some(sweep);
    }

    fn handle_message(inner: &Arc<ControllerInner>, connection: &ConnectionRef, envelope: &Envelope) {
        if !message::is_ping(&envelope.message_type) {
            return;
        }
        debug!(
            "[心跳控制器] 收到来自连接 {} 的 ping (uid: {:?})，回复 pong。",
            connection.id(),
            envelope.uid
        );
        let frame = message::pong_frame(envelope.uid.as_deref());
        let _ = inner.sender.send(Arc::clone(connection), frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::RetryPolicy;
    use crate::sweep::SweepOutcome;
    use crate::testing::TestServer;
    use heartbeat_models::ConnectionState;
    use serde_json::Value;

    const INTERVAL: Duration = Duration::from_millis(1000);

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn controller_for(server: &TestServer) -> HeartbeatController {
        let scheduler: Arc<dyn Scheduler> = server.scheduler.clone();
        let sender = BackpressureSender::new(Arc::clone(&scheduler), RetryPolicy::default());
        let controller = HeartbeatController::new(
            Arc::new(server.registry.clone()),
            server.bus.clone(),
            scheduler,
            sender,
            INTERVAL,
        )
        .expect("间隔为正，创建应成功");
        controller.start();
        controller
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let server = TestServer::new();
        let scheduler: Arc<dyn Scheduler> = server.scheduler.clone();
        let sender = BackpressureSender::new(Arc::clone(&scheduler), RetryPolicy::default());
        let result = HeartbeatController::new(
            Arc::new(server.registry.clone()),
            server.bus.clone(),
            scheduler,
            sender,
            Duration::ZERO,
        );
        assert!(matches!(result, Err(HeartbeatError::InvalidConfig(_))));
    }

    #[test]
    /// 周期定时器数量 = (注册表非空 ? 1 : 0)，在每次连接建立/关闭之后都成立。
    fn test_repeating_timer_tracks_occupancy() {
        let server = TestServer::new();
        let controller = controller_for(&server);
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(server.scheduler.live_repeating_timers(), 0);

        let a = server.connect();
        assert_eq!(controller.state(), ControllerState::Active);
        assert_eq!(server.scheduler.live_repeating_timers(), 1);

        let b = server.connect();
        assert_eq!(server.scheduler.live_repeating_timers(), 1, "第二个连接不应再登记定时器");

        server.report_error(&b);
        assert_eq!(server.scheduler.live_repeating_timers(), 1);

        a.close();
        assert_eq!(server.scheduler.live_repeating_timers(), 1);
        b.close();
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(server.scheduler.live_repeating_timers(), 0);

        server.connect();
        assert_eq!(server.scheduler.live_repeating_timers(), 1);
    }

    #[test]
    fn test_ping_reply_echoes_uid_even_when_idle() {
        let server = TestServer::new();
        let controller = controller_for(&server);

        // 未登记到注册表的连接，控制器保持 IDLE
        let connection = crate::testing::MockConnection::new();
        server.receive(&connection, r#"{"type":"ping","uid":"42"}"#);
        assert_eq!(controller.state(), ControllerState::Idle);

        let sent = connection.sent();
        assert_eq!(sent.len(), 1);
        let reply: Value = serde_json::from_str(&sent[0]).expect("回复应为 JSON");
        assert_eq!(reply["type"], "pong");
        assert_eq!(reply["uid"], "42");
    }

    #[test]
    fn test_ping_without_uid_gets_bare_pong() {
        let server = TestServer::new();
        let _controller = controller_for(&server);
        let connection = server.connect();

        server.receive(&connection, r#"{"type":"PING"}"#);
        let sent = connection.sent();
        assert_eq!(sent, vec![r#"{"type":"pong"}"#.to_string()]);
    }

    #[test]
    fn test_non_ping_messages_get_no_reply() {
        let server = TestServer::new();
        let _controller = controller_for(&server);
        let connection = server.connect();

        server.receive(&connection, r#"{"type":"pong"}"#);
        server.receive(&connection, r#"{"type":"chat"}"#);
        server.receive(&connection, "not json");
        assert!(connection.sent().is_empty());
    }

    #[test]
    fn test_pong_reply_waits_for_buffer_to_drain() {
        let server = TestServer::new();
        let _controller = controller_for(&server);
        let connection = server.connect();
        connection.busy_for(2);

        server.receive(&connection, r#"{"type":"ping","uid":"7"}"#);
        assert!(connection.sent().is_empty());
        server.scheduler.advance(ms(200));
        assert_eq!(connection.sent_of_type("pong"), 1);
    }

    #[test]
    /// 一轮巡检中所有连接都被别处关闭：不关闭任何连接，控制器回到 IDLE，周期定时器被取消。
    fn test_all_connections_closed_mid_sweep() {
        let server = TestServer::new();
        let controller = controller_for(&server);
        let a = server.connect();
        let b = server.connect();

        server.scheduler.advance(INTERVAL);
        let sweep = controller.latest_sweep().expect("应已启动一轮巡检");
        assert_eq!(sweep.pending_count(), 2);

        server.scheduler.advance(ms(200));
        a.close();
        b.close();

        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(server.scheduler.live_repeating_timers(), 0);
        assert_eq!(sweep.outcome(), SweepOutcome::Completed { confirmed: 0 });

        server.scheduler.advance(INTERVAL * 3);
        assert_eq!(a.close_calls(), 1);
        assert_eq!(b.close_calls(), 1);
        assert_eq!(server.scheduler.pending_timers(), 0);
    }

    #[test]
    fn test_each_tick_starts_a_new_sweep() {
        let server = TestServer::new();
        let controller = controller_for(&server);
        let connection = server.connect();

        server.scheduler.advance(INTERVAL);
        let first = controller.latest_sweep().expect("第一轮巡检");
        server.receive(&connection, r#"{"type":"pong"}"#);
        server.scheduler.advance(INTERVAL);
        let second = controller.latest_sweep().expect("第二轮巡检");

        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert_eq!(connection.sent_of_type("ping"), 2);
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[test]
    fn test_stop_cancels_timer_and_unsubscribes() {
        let server = TestServer::new();
        let controller = controller_for(&server);
        server.connect();
        assert_eq!(server.scheduler.live_repeating_timers(), 1);

        controller.stop();
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(server.scheduler.live_repeating_timers(), 0);
        assert_eq!(server.bus.subscriber_count(), 0);

        server.connect();
        assert_eq!(server.scheduler.live_repeating_timers(), 0, "停止后不再响应连接事件");
    }

    #[test]
    fn test_start_with_existing_connections_activates() {
        let server = TestServer::new();
        server.connect();
        let controller = controller_for(&server);
        assert_eq!(controller.state(), ControllerState::Active);
        assert_eq!(server.scheduler.live_repeating_timers(), 1);
    }
}
