//! 互动调度器：多个相互独立、带抖动、不可重入的定时循环
//!
//! 每个循环执行完毕后以 [min, max] 内的均匀随机延迟重新布置定时器；
//! 执行前获取自身的运行标志，标志由 RAII 守卫在任何退出路径（包括出错与 panic）上释放。
//! 可选冷却期：两次成功完成之间的最小间隔，手动触发也受其约束。
//! 循环之间互不阻塞；stop() 取消全部待触发定时器，已发出的网络调用自然完成。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::LoopSection;
use crate::core::Result;
use crate::events::{EngagementEvent, EventBus};

/// 循环体
#[async_trait]
pub trait LoopTask: Send + Sync {
    async fn run(&self) -> Result<()>;
}

/// 循环的定时参数
#[derive(Debug, Clone)]
pub struct LoopSpec {
    pub name: String,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub cooldown: Option<Duration>,
    /// 启动后立即执行一次，而不是先等待一个间隔
    pub run_on_start: bool,
}

impl LoopSpec {
    pub fn new(name: impl Into<String>, min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            name: name.into(),
            min_interval,
            max_interval: max_interval.max(min_interval),
            cooldown: None,
            run_on_start: false,
        }
    }

    pub fn from_section(name: impl Into<String>, section: &LoopSection) -> Self {
        let mut spec = Self::new(name, section.min_interval(), section.max_interval());
        spec.cooldown = section.cooldown();
        spec
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn run_on_start(mut self) -> Self {
        self.run_on_start = true;
        self
    }

    /// [min, max] 内的均匀随机延迟
    pub fn next_delay(&self) -> Duration {
        let min = self.min_interval.as_millis() as u64;
        let max = self.max_interval.as_millis() as u64;
        if max <= min {
            return self.min_interval;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// 单次执行的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    /// 上一次执行尚未结束
    SkippedBusy,
    SkippedCooldown { remaining: Duration },
}

#[derive(Default)]
struct LoopState {
    running: AtomicBool,
    last_run_at: Mutex<Option<DateTime<Utc>>>,
    last_success: Mutex<Option<Instant>>,
    completed: AtomicU64,
}

/// 运行标志守卫：存在期间 running = true
struct RunningFlag {
    state: Arc<LoopState>,
}

impl RunningFlag {
    fn acquire(state: &Arc<LoopState>) -> Option<Self> {
        state
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                state: Arc::clone(state),
            })
    }
}

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
    }
}

/// 具名、独立计时的周期任务
pub struct ScheduledLoop {
    spec: LoopSpec,
    task: Arc<dyn LoopTask>,
    state: Arc<LoopState>,
}

impl ScheduledLoop {
    pub fn new(spec: LoopSpec, task: Arc<dyn LoopTask>) -> Self {
        Self {
            spec,
            task,
            state: Arc::new(LoopState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &LoopSpec {
        &self.spec
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    pub fn last_run_at(&self) -> Option<DateTime<Utc>> {
        *self.state.last_run_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 成功完成的次数
    pub fn completed_runs(&self) -> u64 {
        self.state.completed.load(Ordering::Acquire)
    }

    /// 冷却期剩余时间；无冷却或已过期时为 None
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let cooldown = self.spec.cooldown?;
        let last = (*self.state.last_success.lock().unwrap_or_else(|e| e.into_inner()))?;
        cooldown.checked_sub(last.elapsed()).filter(|d| !d.is_zero())
    }

    /// 执行一次循环体
    ///
    /// 循环体在独立 task 中运行并持有运行标志：调用方被取消时，已开始的执行照常结束后才释放标志。
    pub async fn run_once(&self, events: &EventBus) -> RunOutcome {
        let name = self.spec.name.clone();
        let Some(flag) = RunningFlag::acquire(&self.state) else {
            tracing::debug!(loop_name = %name, "Previous run still in progress, skipping");
            events.emit(EngagementEvent::LoopSkipped {
                name,
                reason: "busy".into(),
            });
            return RunOutcome::SkippedBusy;
        };

        if let Some(remaining) = self.cooldown_remaining() {
            drop(flag);
            tracing::info!(loop_name = %name, remaining_secs = remaining.as_secs(), "Loop in cooldown, skipping");
            events.emit(EngagementEvent::LoopSkipped {
                name,
                reason: "cooldown".into(),
            });
            return RunOutcome::SkippedCooldown { remaining };
        }

        *self.state.last_run_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        events.emit(EngagementEvent::LoopStarted { name: name.clone() });
        tracing::info!(loop_name = %name, "Loop run started");

        let task = Arc::clone(&self.task);
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            let _flag = flag;
            let result = task.run().await;
            if result.is_ok() {
                *state.last_success.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
                state.completed.fetch_add(1, Ordering::AcqRel);
            }
            result
        });

        let outcome = match handle.await {
            Ok(Ok(())) => {
                tracing::info!(loop_name = %name, "Loop run finished");
                RunOutcome::Completed
            }
            Ok(Err(e)) => {
                tracing::warn!(loop_name = %name, error = %e, transient = e.is_transient(), "Loop run failed");
                RunOutcome::Failed
            }
            Err(e) => {
                tracing::error!(loop_name = %name, error = %e, "Loop run panicked");
                RunOutcome::Failed
            }
        };
        events.emit(EngagementEvent::LoopFinished {
            name,
            ok: outcome == RunOutcome::Completed,
        });
        outcome
    }
}

/// 调度器：持有全部循环，start 为每个循环布置独立定时器
pub struct EngagementScheduler {
    loops: HashMap<String, Arc<ScheduledLoop>>,
    events: EventBus,
    token: Mutex<Option<CancellationToken>>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

impl EngagementScheduler {
    pub fn new(events: EventBus) -> Self {
        Self {
            loops: HashMap::new(),
            events,
            token: Mutex::new(None),
            drivers: Mutex::new(Vec::new()),
        }
    }

    /// 注册循环；同名循环会被替换
    pub fn register(&mut self, spec: LoopSpec, task: Arc<dyn LoopTask>) {
        let name = spec.name.clone();
        self.loops
            .insert(name, Arc::new(ScheduledLoop::new(spec, task)));
    }

    pub fn loop_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.loops.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ScheduledLoop>> {
        self.loops.get(name)
    }

    pub fn is_started(&self) -> bool {
        self.token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// 布置所有循环的定时器；已启动时返回 false
    pub fn start(&self, parent: &CancellationToken) -> bool {
        let mut guard = self.token.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return false;
        }
        let token = parent.child_token();
        let mut drivers = self.drivers.lock().unwrap_or_else(|e| e.into_inner());
        for scheduled in self.loops.values() {
            drivers.push(tokio::spawn(drive_loop(
                Arc::clone(scheduled),
                self.events.clone(),
                token.clone(),
            )));
        }
        tracing::info!(loops = self.loops.len(), "Scheduler started");
        *guard = Some(token);
        true
    }

    /// 取消全部待触发的定时器；不会隐式恢复
    pub fn stop(&self) {
        if let Some(token) = self.token.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
            self.drivers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            tracing::info!("Scheduler stopped");
        }
    }

    /// 立即执行一次指定循环（仍受运行标志与冷却期约束）
    pub async fn trigger(&self, name: &str) -> Option<RunOutcome> {
        let scheduled = self.loops.get(name)?;
        Some(scheduled.run_once(&self.events).await)
    }
}

async fn drive_loop(scheduled: Arc<ScheduledLoop>, events: EventBus, token: CancellationToken) {
    let mut delay = if scheduled.spec().run_on_start {
        Duration::ZERO
    } else {
        scheduled.spec().next_delay()
    };

    loop {
        tracing::debug!(loop_name = %scheduled.name(), delay_secs = delay.as_secs(), "Loop armed");
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let outcome = tokio::select! {
            _ = token.cancelled() => break,
            outcome = scheduled.run_once(&events) => outcome,
        };

        delay = scheduled.spec().next_delay();
        // 因冷却被跳过时，下一次至少等到冷却结束
        if let RunOutcome::SkippedCooldown { remaining } = outcome {
            delay = delay.max(remaining);
        }
    }

    tracing::debug!(loop_name = %scheduled.name(), "Loop timer cancelled");
}
