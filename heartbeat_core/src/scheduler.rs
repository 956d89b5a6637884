// heartbeat_core/src/scheduler.rs

//! 可注入的定时调度抽象。
//!
//! 心跳子系统中所有“挂起点”都是定时回调：控制器的周期定时器、每轮巡检的一次性超时、
//! 背压发送的重试延迟。它们统一通过 `Scheduler` trait 申请：
//!
//! - `after(delay, task)`: 一次性定时器，`delay` 之后执行一次 `task`；
//! - `every(period, task)`: 周期定时器，首次在一个 `period` 之后触发，此后每隔 `period` 触发一次。
//!
//! 两者都返回 `TimerHandle` 作为显式的取消令牌。取消是幂等的，
//! 已取消的定时器即使回调已经排队也不会再执行。
//!
//! 本模块提供两个实现：
//! - `TokioScheduler`: 生产环境使用，基于 Tokio 的异步任务与 `tokio::time`；
//! - `ManualScheduler`: 模拟时钟，测试中通过 `advance` 手动推进时间，不依赖真实的墙钟延迟。

use log::debug;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// 一次性定时回调。
pub type OnceTask = Box<dyn FnOnce() + Send + 'static>;
/// 周期定时回调。
pub type RepeatingTask = Box<dyn FnMut() + Send + 'static>;

/// 定时调度器接口。
pub trait Scheduler: Send + Sync {
    /// 在 `delay` 之后执行一次 `task`。
    fn after(&self, delay: Duration, task: OnceTask) -> TimerHandle;

    /// 每隔 `period` 执行一次 `task`，首次触发在一个 `period` 之后。
    fn every(&self, period: Duration, task: RepeatingTask) -> TimerHandle;
}

/// 定时器的取消令牌。
///
/// 可以克隆；所有克隆共享同一个取消标志。`cancel()` 可以重复调用，只有第一次生效。
#[derive(Clone, Debug)]
pub struct TimerHandle {
    inner: Arc<TimerInner>,
}

#[derive(Debug)]
struct TimerInner {
    id: u64,
    cancelled: AtomicBool,
    /// Tokio 实现下承载定时器的任务，取消时一并中止。
    abort: Mutex<Option<AbortHandle>>,
}

impl TimerHandle {
    fn new(id: u64) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                id,
                cancelled: AtomicBool::new(false),
                abort: Mutex::new(None),
            }),
        }
    }

    /// 定时器编号，仅用于日志。
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// 取消定时器。幂等：重复调用不会产生任何额外效果。
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(abort) = lock(&self.inner.abort).take() {
            abort.abort();
        }
        debug!("[调度器] 定时器 #{} 已取消。", self.inner.id);
    }

    /// 定时器是否已被取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn attach_abort(&self, abort: AbortHandle) {
        let mut slot = lock(&self.inner.abort);
        if self.is_cancelled() {
            // 在任务挂接之前就已被取消
            abort.abort();
        } else {
            *slot = Some(abort);
        }
    }
}

/// 获取互斥锁；锁被毒化时沿用内部数据（回调 panic 不应让整个调度器失效）。
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 基于 Tokio 运行时的调度器。
///
/// 每个定时器对应一个派生到运行时上的异步任务；取消时除了设置标志，还会中止该任务，
/// 因此被取消的定时器不会在运行时里残留。
pub struct TokioScheduler {
    runtime: Handle,
    next_id: AtomicU64,
}

impl TokioScheduler {
    /// 使用指定的运行时句柄创建调度器。
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
        }
    }

    /// 使用当前所在的 Tokio 运行时创建调度器。
    ///
    /// # Panics
    /// 在 Tokio 运行时之外调用时 panic（与 `Handle::current()` 一致）。
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    fn next_timer(&self) -> TimerHandle {
        TimerHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: OnceTask) -> TimerHandle {
        let timer = self.next_timer();
        let guard = timer.clone();
        let join = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if !guard.is_cancelled() {
                task();
            }
        });
        timer.attach_abort(join.abort_handle());
        timer
    }

    fn every(&self, period: Duration, mut task: RepeatingTask) -> TimerHandle {
        let timer = self.next_timer();
        let guard = timer.clone();
        let join = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let _ = ticker.tick().await;
                if guard.is_cancelled() {
                    break;
                }
                task();
            }
        });
        timer.attach_abort(join.abort_handle());
        timer
    }
}

/// 模拟时钟调度器。
///
/// 时间只在调用 `advance` / `advance_to` 时前进；到期的回调按截止时间先后执行，
/// 截止时间相同的按登记顺序执行。回调执行期间不持有内部锁，
/// 因此回调内部可以自由地登记或取消其它定时器（包括推进过程中新登记、且已到期的定时器）。
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_seq: u64,
    queue: BTreeMap<(Duration, u64), Entry>,
}

struct Entry {
    timer: TimerHandle,
    kind: EntryKind,
}

enum EntryKind {
    Once(OnceTask),
    Repeating { period: Duration, task: RepeatingTask },
}

impl ManualState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

impl ManualScheduler {
    /// 创建一个时间起点为 0 的模拟调度器。
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManualState::default()),
        }
    }

    /// 当前模拟时间（自起点起的时长）。
    pub fn now(&self) -> Duration {
        lock(&self.state).now
    }

    /// 把时间推进 `by`，并依次执行期间到期的所有回调。
    pub fn advance(&self, by: Duration) {
        let target = self.now() + by;
        self.advance_to(target);
    }

    /// 把时间推进到 `target`（早于当前时间时不回退），并依次执行期间到期的所有回调。
    pub fn advance_to(&self, target: Duration) {
        loop {
            let popped = {
                let mut state = lock(&self.state);
                let due = state
                    .queue
                    .first_key_value()
                    .is_some_and(|(key, _)| key.0 <= target);
                if due { state.queue.pop_first() } else { None }
            };

            let Some(((deadline, _), entry)) = popped else {
                let mut state = lock(&self.state);
                if state.now < target {
                    state.now = target;
                }
                return;
            };

            lock(&self.state).now = deadline;
            if entry.timer.is_cancelled() {
                continue;
            }

            match entry.kind {
                EntryKind::Once(task) => task(),
                EntryKind::Repeating { period, mut task } => {
                    task();
                    if !entry.timer.is_cancelled() {
                        let mut state = lock(&self.state);
                        let seq = state.next_seq();
                        state.queue.insert(
                            (deadline + period, seq),
                            Entry {
                                timer: entry.timer,
                                kind: EntryKind::Repeating { period, task },
                            },
                        );
                    }
                }
            }
        }
    }

    /// 尚未触发且未被取消的定时器数量（一次性与周期性合计）。
    pub fn pending_timers(&self) -> usize {
        lock(&self.state)
            .queue
            .values()
            .filter(|entry| !entry.timer.is_cancelled())
            .count()
    }

    /// 仍然存活的周期定时器数量。
    pub fn live_repeating_timers(&self) -> usize {
        lock(&self.state)
            .queue
            .values()
            .filter(|entry| {
                matches!(entry.kind, EntryKind::Repeating { .. }) && !entry.timer.is_cancelled()
            })
            .count()
    }

    fn schedule(&self, delay: Duration, kind: EntryKind) -> TimerHandle {
        let mut state = lock(&self.state);
        let seq = state.next_seq();
        let timer = TimerHandle::new(seq);
        let deadline = state.now + delay;
        state.queue.insert(
            (deadline, seq),
            Entry {
                timer: timer.clone(),
                kind,
            },
        );
        timer
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn after(&self, delay: Duration, task: OnceTask) -> TimerHandle {
        self.schedule(delay, EntryKind::Once(task))
    }

    fn every(&self, period: Duration, task: RepeatingTask) -> TimerHandle {
        // 零周期会让 advance 永远推进不完
        let period = period.max(Duration::from_nanos(1));
        self.schedule(period, EntryKind::Repeating { period, task })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_manual_after_fires_once_at_deadline() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let _timer = scheduler.after(ms(100), Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        scheduler.advance(ms(99));
        assert_eq!(fired.load(Ordering::SeqCst), 0, "未到期不应触发");
        scheduler.advance(ms(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1, "到期应恰好触发一次");
        scheduler.advance(ms(1000));
        assert_eq!(fired.load(Ordering::SeqCst), 1, "一次性定时器不应再次触发");
        assert_eq!(scheduler.now(), ms(1100));
    }

    #[test]
    fn test_manual_every_fires_each_period_until_cancelled() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = scheduler.every(ms(10), Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(scheduler.live_repeating_timers(), 1);

        scheduler.advance(ms(35));
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        timer.cancel();
        timer.cancel();
        assert!(timer.is_cancelled());
        assert_eq!(scheduler.live_repeating_timers(), 0, "取消后不应再有存活的周期定时器");
        scheduler.advance(ms(100));
        assert_eq!(fired.load(Ordering::SeqCst), 3, "取消后不应再触发");
    }

    #[test]
    fn test_manual_cancel_after_queued_does_not_fire() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let holder: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));

        // 同一时刻先登记的回调取消后登记的回调：后者虽已到期排队，也不应执行
        let holder_for_first = Arc::clone(&holder);
        let _first = scheduler.after(ms(50), Box::new(move || {
            if let Some(timer) = lock(&holder_for_first).take() {
                timer.cancel();
            }
        }));
        let counter = Arc::clone(&fired);
        let second = scheduler.after(ms(50), Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        *lock(&holder) = Some(second);

        scheduler.advance(ms(50));
        assert_eq!(fired.load(Ordering::SeqCst), 0, "已排队但被取消的回调不应执行");
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn test_manual_callbacks_can_schedule_more_timers() {
        let scheduler = Arc::new(ManualScheduler::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let inner_scheduler = Arc::clone(&scheduler);
        let inner_order = Arc::clone(&order);
        let _outer = scheduler.after(ms(10), Box::new(move || {
            lock(&inner_order).push("outer");
            let nested_order = Arc::clone(&inner_order);
            let _nested = inner_scheduler.after(ms(5), Box::new(move || {
                lock(&nested_order).push("nested");
            }));
        }));

        scheduler.advance(ms(20));
        assert_eq!(*lock(&order), vec!["outer", "nested"], "推进过程中新登记且已到期的回调也应执行");
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_after_and_cancel() {
        let scheduler = TokioScheduler::current();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let _kept = scheduler.after(ms(100), Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = Arc::clone(&fired);
        let cancelled = scheduler.after(ms(100), Box::new(move || {
            counter.fetch_add(10, Ordering::SeqCst);
        }));
        cancelled.cancel();

        tokio::time::sleep(ms(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1, "只有未取消的定时器应触发");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_every_skips_immediate_tick() {
        let scheduler = TokioScheduler::current();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = scheduler.every(ms(100), Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(ms(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "首次触发应在一个周期之后");
        tokio::time::sleep(ms(260)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        timer.cancel();
        tokio::time::sleep(ms(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3, "取消后不应再触发");
    }
}
