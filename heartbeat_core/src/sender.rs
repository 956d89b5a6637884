// heartbeat_core/src/sender.rs

//! 背压感知的消息发送器。
//!
//! 向单个连接投递一帧数据时遵循以下规则：
//!
//! 1. 连接不处于 `Open` 状态：立即返回，静默丢弃（对端正在关闭或已关闭不算错误，
//!    由存活巡检或调用方负责把它视为失效连接）；
//! 2. 出站缓冲占用大于零：在 `RetryPolicy::delay` 之后重新尝试同一次发送，当前调用立即返回，不阻塞事件循环；
//! 3. 否则立即写入。
//!
//! 每一次发送返回一个 `Delivery` 句柄，它是这条重试链的显式取消令牌，
//! 同时可以查询投递结果与已经进行的缓冲检查次数。`RetryPolicy::max_attempts`
//! 为重试链设置上限；上限为 `None` 时一直重试，直到缓冲排空或连接离开 `Open` 状态。

use heartbeat_models::ConnectionState;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connection::{Connection, ConnectionRef};
use crate::scheduler::{Scheduler, TimerHandle, lock};

/// 默认的背压重试间隔。
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// 背压重试策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 缓冲未排空时，两次尝试之间的等待时长。
    pub delay: Duration,
    /// 最多进行的缓冲检查次数；`None` 表示不设上限。
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// 不设上限的重试策略。
    pub fn unbounded(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    /// 最多进行 `max_attempts` 次缓冲检查的重试策略。
    pub fn bounded(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: Some(max_attempts.max(1)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded(DEFAULT_RETRY_DELAY)
    }
}

/// 投递被丢弃的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// 尝试时连接已不处于 `Open` 状态。
    NotOpen,
    /// 达到重试上限时缓冲仍未排空。
    RetriesExhausted,
    /// 调用方通过 `Delivery::cancel()` 取消。
    Cancelled,
}

/// 一次投递的当前状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// 正在等待缓冲排空。
    Pending,
    /// 已写入连接。
    Written,
    /// 已放弃，未写入。
    Dropped(DropReason),
}

#[derive(Debug)]
struct DeliveryState {
    status: DeliveryStatus,
    attempts: u32,
    retry_timer: Option<TimerHandle>,
}

/// 一次投递的句柄：查询结果，或取消尚未完成的重试链。
#[derive(Debug, Clone)]
pub struct Delivery {
    state: Arc<Mutex<DeliveryState>>,
}

impl Delivery {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeliveryState {
                status: DeliveryStatus::Pending,
                attempts: 0,
                retry_timer: None,
            })),
        }
    }

    /// 当前投递状态。
    pub fn status(&self) -> DeliveryStatus {
        lock(&self.state).status
    }

    /// 已进行的缓冲检查次数。
    pub fn attempts(&self) -> u32 {
        lock(&self.state).attempts
    }

    /// 取消尚未完成的投递。已经写入或已经丢弃的投递不受影响；重复调用无副作用。
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        if state.status != DeliveryStatus::Pending {
            return;
        }
        state.status = DeliveryStatus::Dropped(DropReason::Cancelled);
        if let Some(timer) = state.retry_timer.take() {
            timer.cancel();
        }
    }

    fn is_pending(&self) -> bool {
        let mut state = lock(&self.state);
        state.retry_timer = None;
        state.status == DeliveryStatus::Pending
    }

    fn record_attempt(&self) -> u32 {
        let mut state = lock(&self.state);
        state.attempts += 1;
        state.attempts
    }

    fn finish(&self, status: DeliveryStatus) {
        lock(&self.state).status = status;
    }

    fn arm_retry(&self, timer: TimerHandle) {
        let mut state = lock(&self.state);
        if state.status == DeliveryStatus::Pending {
            state.retry_timer = Some(timer);
        } else {
            timer.cancel();
        }
    }
}

/// 背压感知的发送器。克隆代价很低，所有克隆共享同一个调度器。
#[derive(Clone)]
pub struct BackpressureSender {
    scheduler: Arc<dyn Scheduler>,
    policy: RetryPolicy,
}

impl BackpressureSender {
    /// 使用给定的调度器与重试策略创建发送器。
    pub fn new(scheduler: Arc<dyn Scheduler>, policy: RetryPolicy) -> Self {
        Self { scheduler, policy }
    }

    /// 当前使用的重试策略。
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// 向 `connection` 投递一帧数据，必要时延迟到缓冲排空之后。
    ///
    /// 调用立即返回；返回的 `Delivery` 可以忽略。
    pub fn send(&self, connection: ConnectionRef, frame: impl Into<Arc<str>>) -> Delivery {
        let delivery = Delivery::new();
        attempt(
            Arc::clone(&self.scheduler),
            self.policy,
            connection,
            frame.into(),
            delivery.clone(),
        );
        delivery
    }
}

fn attempt(
    scheduler: Arc<dyn Scheduler>,
    policy: RetryPolicy,
    connection: ConnectionRef,
    frame: Arc<str>,
    delivery: Delivery,
) {
    if !delivery.is_pending() {
        return;
    }

    let state = connection.state();
    if state != ConnectionState::Open {
        debug!(
            "[背压发送] 连接 {} 处于 {} 状态，丢弃待发送的数据帧。",
            connection.id(),
            state
        );
        delivery.finish(DeliveryStatus::Dropped(DropReason::NotOpen));
        return;
    }

    let attempts = delivery.record_attempt();
    let buffered = connection.buffered_amount();
    if buffered > 0 {
        if policy.max_attempts.is_some_and(|max| attempts >= max) {
            warn!(
                "[背压发送] 连接 {} 的出站缓冲在 {} 次检查后仍有 {} 字节未刷出，放弃本次发送。",
                connection.id(),
                attempts,
                buffered
            );
            delivery.finish(DeliveryStatus::Dropped(DropReason::RetriesExhausted));
            return;
        }

        debug!(
            "[背压发送] 连接 {} 的出站缓冲仍有 {} 字节，{:?} 后重试 (第 {} 次检查)。",
            connection.id(),
            buffered,
            policy.delay,
            attempts
        );
        let retry_scheduler = Arc::clone(&scheduler);
        let retry_delivery = delivery.clone();
        let timer = scheduler.after(
            policy.delay,
            Box::new(move || attempt(retry_scheduler, policy, connection, frame, retry_delivery)),
        );
        delivery.arm_retry(timer);
        return;
    }

    connection.send(&frame);
    delivery.finish(DeliveryStatus::Written);
}
