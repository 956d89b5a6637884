// heartbeat_core/src/sweep.rs

//! 存活巡检：一轮完整的 Ping / 确认 / 超时关闭周期。
//!
//! 控制器处于 ACTIVE 状态时，每个心跳间隔启动一轮巡检：
//!
//! 1. 对连接注册表取快照，全部放入 `pending`（待确认）集合，`active`（已确认）集合为空；
//! 2. 登记一个与心跳间隔等长的一次性超时；
//! 3. 在事件总线上临时订阅 `message-received` 与 `connection-closed`；
//! 4. 通过背压发送器向快照中的每个连接发送 `ping`。
//!
//! 任何入站消息（不仅仅是 `pong`）都能证明连接存活，使其从 `pending` 移入 `active`。
//! 快照中的连接如果在确认之前被别处关闭，就直接从 `pending` 中剔除，不会被再次关闭。
//!
//! 两条结束路径恰好执行其一：
//! - `pending` 清空：取消超时、退订，巡检以 `Completed` 结束；
//! - 超时先到：关闭 `pending` 中仍处于 `Open` 状态的所有连接、退订，巡检以 `TimedOut` 结束。
//!
//! 超时回调即使已经排队，只要巡检已经结束就什么都不做，因此取消是幂等的。
//!
//! 巡检对连接只持有弱引用；巡检本身由超时回调持有，结束后随定时器与订阅一起释放。

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use heartbeat_models::ConnectionState;

use crate::connection::{Connection, ConnectionId};
use crate::event_bus::{ConnectionEvent, EventBus, Subscription, Topic};
use crate::message;
use crate::registry::Registry;
use crate::scheduler::{Scheduler, TimerHandle, lock};
use crate::sender::BackpressureSender;

/// 一轮巡检的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// 仍在等待确认。
    InProgress,
    /// `pending` 在超时之前清空。`confirmed` 为通过入站消息确认存活的连接数。
    Completed { confirmed: usize },
    /// 超时先到，`closed` 为因此被关闭的连接数。
    TimedOut { confirmed: usize, closed: usize },
}

struct SweepState {
    id: u64,
    pending: HashMap<ConnectionId, Weak<dyn Connection>>,
    active: HashSet<ConnectionId>,
    timeout: Option<TimerHandle>,
    subscription: Option<Subscription>,
    outcome: SweepOutcome,
}

/// 一轮存活巡检的句柄。克隆得到的是同一轮巡检。
#[derive(Clone)]
pub struct LivenessSweep {
    state: Arc<Mutex<SweepState>>,
}

impl LivenessSweep {
    /// 启动一轮巡检，`timeout` 通常等于心跳间隔。
    pub fn start(
        id: u64,
        registry: &dyn Registry,
        bus: &EventBus,
        scheduler: &Arc<dyn Scheduler>,
        sender: &BackpressureSender,
        timeout: Duration,
    ) -> Self {
        let snapshot = registry.snapshot();
        let pending: HashMap<ConnectionId, Weak<dyn Connection>> = snapshot
            .iter()
            .map(|connection| (connection.id(), Arc::downgrade(connection)))
            .collect();
        let sweep = LivenessSweep {
            state: Arc::new(Mutex::new(SweepState {
                id,
                pending,
                active: HashSet::new(),
                timeout: None,
                subscription: None,
                outcome: SweepOutcome::InProgress,
            })),
        };

        if snapshot.is_empty() {
            debug!("[存活巡检] 第 {} 轮巡检开始时没有任何连接，直接结束。", id);
            let leftover = Self::complete(&mut lock(&sweep.state));
            drop(leftover);
            return sweep;
        }

        info!(
            "[存活巡检] 第 {} 轮巡检开始，共 {} 个连接待确认，超时: {:?}",
            id,
            snapshot.len(),
            timeout
        );

        let on_timeout = sweep.clone();
        let timer = scheduler.after(timeout, Box::new(move || on_timeout.expire()));

        let observed = Arc::downgrade(&sweep.state);
        let subscription = bus.subscribe(
            &[Topic::MessageReceived, Topic::ConnectionClosed],
            move |event| {
                if let Some(state) = observed.upgrade() {
                    LivenessSweep { state }.observe(event);
                }
            },
        );

        {
            let mut state = lock(&sweep.state);
            state.timeout = Some(timer);
            state.subscription = Some(subscription);
        }

        let frame: Arc<str> = message::ping_frame().into();
        for connection in snapshot {
            let _ = sender.send(connection, Arc::clone(&frame));
        }
        sweep
    }

    /// 巡检编号。
    pub fn id(&self) -> u64 {
        lock(&self.state).id
    }

    /// 尚未确认的连接数。
    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// 已确认存活的连接数。
    pub fn active_count(&self) -> usize {
        lock(&self.state).active.len()
    }

    /// 连接是否仍在待确认集合中。
    pub fn is_pending(&self, id: &ConnectionId) -> bool {
        lock(&self.state).pending.contains_key(id)
    }

    /// 连接是否已被确认存活。
    pub fn is_active(&self, id: &ConnectionId) -> bool {
        lock(&self.state).active.contains(id)
    }

    /// 巡检是否已经结束（任一路径）。
    pub fn is_finished(&self) -> bool {
        lock(&self.state).outcome != SweepOutcome::InProgress
    }

    pub fn outcome(&self) -> SweepOutcome {
        lock(&self.state).outcome
    }

    fn observe(&self, event: &ConnectionEvent) {
        let leftover = {
            let mut state = lock(&self.state);
            if state.outcome != SweepOutcome::InProgress {
                return;
            }
            match event {
                ConnectionEvent::MessageReceived { connection, .. } => {
                    let id = connection.id();
                    if state.pending.remove(&id).is_some() {
                        state.active.insert(id);
                        debug!("[存活巡检] 第 {} 轮：连接 {} 已确认存活。", state.id, id);
                    }
                }
                ConnectionEvent::Closed(id) => {
                    if state.pending.remove(id).is_some() {
                        debug!("[存活巡检] 第 {} 轮：连接 {} 在确认前已关闭，不再等待。", state.id, id);
                    }
                }
                _ => {}
            }
            if !state.pending.is_empty() {
                return;
            }
            Self::complete(&mut state)
        };
        // 在巡检锁之外退订
        drop(leftover);
    }

    /// 成功路径：取消超时并交出订阅句柄，由调用方在释放锁后丢弃。
    fn complete(state: &mut SweepState) -> Option<Subscription> {
        state.outcome = SweepOutcome::Completed {
            confirmed: state.active.len(),
        };
        if let Some(timer) = state.timeout.take() {
            timer.cancel();
        }
        info!(
            "[存活巡检] 第 {} 轮巡检完成，{} 个连接确认存活。",
            state.id,
            state.active.len()
        );
        state.subscription.take()
    }

    /// 失败路径：超时先到，关闭所有仍未确认的连接。
    fn expire(&self) {
        let (id, confirmed, victims, subscription) = {
            let mut state = lock(&self.state);
            if state.outcome != SweepOutcome::InProgress {
                // 巡检已经走了成功路径，迟到的超时回调什么都不做
                return;
            }
            state.timeout = None;
            let confirmed = state.active.len();
            state.outcome = SweepOutcome::TimedOut { confirmed, closed: 0 };
            let victims: Vec<(ConnectionId, Weak<dyn Connection>)> = state.pending.drain().collect();
            (state.id, confirmed, victims, state.subscription.take())
        };
        drop(subscription);

        let mut closed = 0;
        for (connection_id, weak) in victims {
            match weak.upgrade() {
                Some(connection) if connection.state() == ConnectionState::Open => {
                    warn!(
                        "[存活巡检] 第 {} 轮：连接 {} 在超时前没有任何响应，判定为失联，正在关闭。",
                        id, connection_id
                    );
                    connection.close();
                    closed += 1;
                }
                Some(connection) => {
                    debug!(
                        "[存活巡检] 第 {} 轮：连接 {} 已处于 {} 状态，跳过关闭。",
                        id,
                        connection_id,
                        connection.state()
                    );
                }
                None => {
                    debug!("[存活巡检] 第 {} 轮：连接 {} 已被释放，跳过关闭。", id, connection_id);
                }
            }
        }

        lock(&self.state).outcome = SweepOutcome::TimedOut { confirmed, closed };
        info!(
            "[存活巡检] 第 {} 轮巡检超时结束：{} 个连接确认存活，{} 个连接被关闭。",
            id, confirmed, closed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::RetryPolicy;
    use crate::testing::TestServer;

    const INTERVAL: Duration = Duration::from_millis(1000);

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn start_sweep(server: &TestServer) -> LivenessSweep {
        let scheduler: Arc<dyn Scheduler> = server.scheduler.clone();
        let sender = BackpressureSender::new(Arc::clone(&scheduler), RetryPolicy::default());
        LivenessSweep::start(1, &server.registry, &server.bus, &scheduler, &sender, INTERVAL)
    }

    #[test]
    fn test_sweep_pings_every_member_of_snapshot() {
        let server = TestServer::new();
        let connections: Vec<_> = (0..3).map(|_| server.connect()).collect();

        let sweep = start_sweep(&server);
        for connection in &connections {
            assert_eq!(connection.sent_of_type("ping"), 1, "每个连接都应收到一次 ping");
        }
        assert_eq!(sweep.pending_count(), 3);
        assert_eq!(sweep.active_count(), 0);
        assert_eq!(server.bus.subscriber_count(), 1, "巡检期间应保持一个临时订阅");
    }

    #[test]
    /// 任何入站消息都算存活证明；全部确认后取消超时、退订，不关闭任何连接。
    fn test_any_message_confirms_and_completion_cancels_timeout() {
        let server = TestServer::new();
        let a = server.connect();
        let b = server.connect();
        let sweep = start_sweep(&server);

        server.receive(&a, r#"{"type":"chat","text":"hi"}"#);
        assert!(sweep.is_active(&a.id()));
        assert!(sweep.is_pending(&b.id()));
        server.receive(&b, "garbage that is not json");

        assert_eq!(sweep.outcome(), SweepOutcome::Completed { confirmed: 2 });
        assert_eq!(server.bus.subscriber_count(), 0, "完成后应退订");
        assert_eq!(server.scheduler.pending_timers(), 0, "完成后超时应被取消");

        server.scheduler.advance(INTERVAL * 2);
        assert_eq!(a.close_calls() + b.close_calls(), 0, "已完成的巡检不应关闭任何连接");
    }

    #[test]
    fn test_timeout_closes_only_silent_connections() {
        let server = TestServer::new();
        let talker = server.connect();
        let silent = server.connect();
        let sweep = start_sweep(&server);

        server.scheduler.advance(ms(100));
        server.receive(&talker, r#"{"type":"pong"}"#);
        server.receive(&talker, r#"{"type":"pong"}"#);
        server.scheduler.advance(ms(900));

        assert_eq!(sweep.outcome(), SweepOutcome::TimedOut { confirmed: 1, closed: 1 });
        assert_eq!(silent.close_calls(), 1);
        assert_eq!(talker.close_calls(), 0);
        assert_eq!(server.registry.size(), 1);
        assert_eq!(server.bus.subscriber_count(), 0, "超时结束后应退订");
    }

    #[test]
    /// 快照中的连接在确认前被关闭：从 pending 中剔除；全部剔除后巡检走成功路径，超时不再关闭任何连接。
    fn test_connections_closed_elsewhere_leave_pending() {
        let server = TestServer::new();
        let a = server.connect();
        let b = server.connect();
        let sweep = start_sweep(&server);

        a.close();
        assert!(!sweep.is_pending(&a.id()));
        assert!(!sweep.is_finished());
        b.close();

        assert_eq!(sweep.outcome(), SweepOutcome::Completed { confirmed: 0 });
        server.scheduler.advance(INTERVAL * 3);
        assert_eq!(a.close_calls(), 1, "超时不应再次关闭已关闭的连接");
        assert_eq!(b.close_calls(), 1);
    }

    #[test]
    fn test_messages_after_completion_are_ignored() {
        let server = TestServer::new();
        let a = server.connect();
        let sweep = start_sweep(&server);
        server.receive(&a, r#"{"type":"pong"}"#);
        let newcomer = server.connect();
        server.receive(&newcomer, r#"{"type":"pong"}"#);

        assert_eq!(sweep.outcome(), SweepOutcome::Completed { confirmed: 1 });
        assert!(!sweep.is_active(&newcomer.id()), "快照之外的连接不参与本轮巡检");
    }

    #[test]
    /// 成功路径之后迟到的超时回调不改变结果，也不关闭任何连接。
    fn test_late_timeout_after_completion_is_noop() {
        let server = TestServer::new();
        let a = server.connect();
        let sweep = start_sweep(&server);
        server.receive(&a, r#"{"type":"pong"}"#);
        assert_eq!(sweep.outcome(), SweepOutcome::Completed { confirmed: 1 });

        sweep.expire();

        assert_eq!(sweep.outcome(), SweepOutcome::Completed { confirmed: 1 });
        assert_eq!(a.close_calls(), 0);
        assert_eq!(server.bus.subscriber_count(), 0);
    }

    #[test]
    fn test_empty_snapshot_finishes_immediately() {
        let server = TestServer::new();
        let sweep = start_sweep(&server);
        assert_eq!(sweep.outcome(), SweepOutcome::Completed { confirmed: 0 });
        assert_eq!(server.scheduler.pending_timers(), 0);
        assert_eq!(server.bus.subscriber_count(), 0);
    }

    #[test]
    fn test_timeout_skips_connections_already_closing() {
        let server = TestServer::new();
        let closing = server.connect();
        let sweep = start_sweep(&server);
        closing.set_state(ConnectionState::Closing);

        server.scheduler.advance(INTERVAL);
        assert_eq!(sweep.outcome(), SweepOutcome::TimedOut { confirmed: 0, closed: 0 });
        assert_eq!(closing.close_calls(), 0);
    }
}
