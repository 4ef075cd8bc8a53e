use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pipeline_core::{
    PipelineError, PipelineResult, SchedulerConfig, TaskResponse, TaskState,
};

use crate::policy::{AlwaysPolicy, SchedulePolicy};
use crate::task::{ScheduledTask, TaskCallback};

/// 调度器生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Initialized,
    Running,
    Stopped,
}

struct SchedulerInner {
    config: SchedulerConfig,
    policy: Arc<dyn SchedulePolicy>,
    state: Mutex<SchedulerState>,
    /// 所有加入过的任务（周期任务需要），顺序保留
    registry: Mutex<Vec<Arc<ScheduledTask>>>,
    /// 当前可运行任务队列；不变式：一个任务同一时刻至多出现一次
    runnable: Mutex<VecDeque<Arc<ScheduledTask>>>,
    /// 在途工作句柄队列
    handles: Mutex<VecDeque<JoinHandle<PipelineResult<()>>>>,
    /// 工作池并发许可
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    dispatch_notify: Notify,
    drain_notify: Notify,
}

impl SchedulerInner {
    fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap()
    }

    fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// 请求整体停止；实际排空与合流由 stop() 完成
    fn request_stop(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != SchedulerState::Stopped {
            *state = SchedulerState::Stopped;
            info!("调度器转入停止状态");
        }
        drop(state);
        self.dispatch_notify.notify_waiters();
        self.drain_notify.notify_waiters();
    }

    fn push_runnable(&self, task: Arc<ScheduledTask>) {
        self.runnable.lock().unwrap().push_back(task);
        self.dispatch_notify.notify_one();
    }
}

/// 调度器对任务的完成回调：周期任务重新入队，致命错误触发整体停止
struct SchedulerCallback {
    inner: Weak<SchedulerInner>,
}

#[async_trait]
impl TaskCallback for SchedulerCallback {
    async fn finished(&self, task: &ScheduledTask, _response: &TaskResponse) {
        if let Some(inner) = self.inner.upgrade() {
            // 重新入队为 Waiting，由调度策略决定下一次执行时机
            task.set_state(TaskState::Waiting);
            if inner.is_running() {
                let registry = inner.registry.lock().unwrap();
                if let Some(entry) = registry.iter().find(|t| t.id() == task.id()) {
                    inner.push_runnable(Arc::clone(entry));
                }
            }
        }
    }

    async fn error(&self, task: &ScheduledTask, error: &PipelineError, _response: &TaskResponse) {
        if let Some(inner) = self.inner.upgrade() {
            if error.is_fatal() {
                error!("任务 {} 报告致命错误，停止调度器: {}", task.id(), error);
                inner.request_stop();
            } else {
                // 非致命错误隔离在单个任务内，调度器继续运行
                warn!("任务 {} 执行出错: {}", task.id(), error);
            }
        }
    }
}

/// 有界任务队列调度器
///
/// 接纳任务、派发到固定大小的工作池、跟踪完成并干净停机。
/// 两个常驻后台循环：派发循环与句柄清理循环，空闲时在通知原语上
/// 等待至多 idle_wait_ms。
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_policy(config, Arc::new(AlwaysPolicy))
    }

    pub fn with_policy(config: SchedulerConfig, policy: Arc<dyn SchedulePolicy>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_pool_size));
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                policy,
                state: Mutex::new(SchedulerState::Initialized),
                registry: Mutex::new(Vec::new()),
                runnable: Mutex::new(VecDeque::new()),
                handles: Mutex::new(VecDeque::new()),
                permits,
                in_flight: AtomicUsize::new(0),
                dispatch_notify: Notify::new(),
                drain_notify: Notify::new(),
            }),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.state()
    }

    /// 注册任务的快照
    pub fn tasks(&self) -> Vec<Arc<ScheduledTask>> {
        self.inner.registry.lock().unwrap().clone()
    }

    /// 接纳任务；要求调度器处于 Initialized 或 Running 状态
    pub fn add(&self, task: Arc<ScheduledTask>) -> PipelineResult<()> {
        let state = self.inner.state();
        if state == SchedulerState::Stopped {
            return Err(PipelineError::Internal(
                "调度器已停止，拒绝新任务".to_string(),
            ));
        }

        task.subscribe(Arc::new(SchedulerCallback {
            inner: Arc::downgrade(&self.inner),
        }));
        self.inner.registry.lock().unwrap().push(Arc::clone(&task));
        counter!("pipeline.scheduler.tasks.added").increment(1);

        if state == SchedulerState::Running {
            task.set_state(TaskState::Initialized);
            self.inner.push_runnable(task);
        }
        Ok(())
    }

    /// 启动调度器：派发循环 + 句柄清理循环
    pub fn start(&self) -> PipelineResult<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != SchedulerState::Initialized {
                return Err(PipelineError::Internal(format!(
                    "调度器无法从 {state:?} 状态启动"
                )));
            }
            *state = SchedulerState::Running;
        }

        // 启动前加入的任务此时统一入队
        {
            let registry = self.inner.registry.lock().unwrap();
            let mut runnable = self.inner.runnable.lock().unwrap();
            for task in registry.iter() {
                if task.state() == TaskState::Initialized {
                    runnable.push_back(Arc::clone(task));
                }
            }
        }

        let dispatch = tokio::spawn(Self::dispatch_loop(Arc::clone(&self.inner)));
        let drain = tokio::spawn(Self::drain_loop(Arc::clone(&self.inner)));
        self.loops.lock().unwrap().extend([dispatch, drain]);

        info!(
            "调度器已启动: pool={}, queue_capacity={}",
            self.inner.config.max_pool_size,
            self.inner.config.queue_capacity()
        );
        Ok(())
    }

    /// 派发循环：按空闲槽位弹出可运行任务，判定资格后提交工作池
    async fn dispatch_loop(inner: Arc<SchedulerInner>) {
        let idle_wait = Duration::from_millis(inner.config.idle_wait_ms);
        let capacity = inner.config.queue_capacity();

        while inner.is_running() {
            let mut dispatched = false;
            let mut deferred: Vec<Arc<ScheduledTask>> = Vec::new();

            loop {
                if inner.in_flight.load(Ordering::SeqCst) >= capacity {
                    break;
                }
                let task = match inner.runnable.lock().unwrap().pop_front() {
                    Some(task) => task,
                    None => break,
                };

                match task.state() {
                    TaskState::Initialized => {}
                    TaskState::Error => {
                        debug!("丢弃错误状态任务: {}", task.id());
                        continue;
                    }
                    TaskState::Stopped => {
                        let mut registry = inner.registry.lock().unwrap();
                        registry.retain(|t| t.id() != task.id());
                        debug!("移除已停止任务: {}", task.id());
                        continue;
                    }
                    _ => {
                        if !inner.policy.should_run(&task) {
                            task.set_state(TaskState::Waiting);
                            deferred.push(task);
                            continue;
                        }
                    }
                }

                Self::submit(&inner, task);
                dispatched = true;
            }

            if !deferred.is_empty() {
                let mut runnable = inner.runnable.lock().unwrap();
                for task in deferred {
                    runnable.push_back(task);
                }
            }

            if !dispatched {
                let _ = tokio::time::timeout(idle_wait, inner.dispatch_notify.notified()).await;
            }
        }
        debug!("派发循环退出");
    }

    /// 提交任务占据一个队列槽位；工作位许可在任务内部等待获取。
    /// in_flight 因此统计 Queued 与 Running 的总量，上限为 queue_capacity，
    /// 真实并发仍由 max_pool_size 大小的信号量约束。
    fn submit(inner: &Arc<SchedulerInner>, task: Arc<ScheduledTask>) {
        task.set_state(TaskState::Queued);
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        gauge!("pipeline.scheduler.in_flight").increment(1.0);
        counter!("pipeline.scheduler.tasks.submitted").increment(1);

        let loop_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            let result = match Arc::clone(&loop_inner.permits).acquire_owned().await {
                Ok(permit) => {
                    let result = task.run().await;
                    drop(permit);
                    result
                }
                Err(e) => Err(PipelineError::Internal(format!("工作位许可不可用: {e}"))),
            };
            loop_inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            gauge!("pipeline.scheduler.in_flight").decrement(1.0);
            loop_inner.dispatch_notify.notify_one();
            loop_inner.drain_notify.notify_one();
            result
        });
        inner.handles.lock().unwrap().push_back(handle);
    }

    /// 句柄清理循环：合流已完成的工作句柄并暴露其中的异常
    ///
    /// 任务级错误已经通过回调上报，这里只记录日志；致命错误
    /// （如任务缺少回调）触发整体停止。
    async fn drain_loop(inner: Arc<SchedulerInner>) {
        let idle_wait = Duration::from_millis(inner.config.idle_wait_ms);

        loop {
            let handle = inner.handles.lock().unwrap().pop_front();
            match handle {
                Some(handle) => match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("工作句柄返回错误: {}", e);
                        if e.is_fatal() {
                            inner.request_stop();
                        }
                    }
                    Err(join_error) => {
                        error!("工作句柄异常终止: {}", join_error);
                    }
                },
                None => {
                    if !inner.is_running() && inner.in_flight.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                    let _ = tokio::time::timeout(idle_wait, inner.drain_notify.notified()).await;
                }
            }
        }
        debug!("句柄清理循环退出");
    }

    /// 停止调度器并排空在途工作
    pub async fn stop(&self) {
        self.inner.request_stop();

        let log_interval = Duration::from_secs(self.inner.config.drain_log_interval_seconds);
        let mut last_log = std::time::Instant::now();
        loop {
            let in_flight = self.inner.in_flight.load(Ordering::SeqCst);
            if in_flight == 0 {
                break;
            }
            if last_log.elapsed() >= log_interval {
                info!("等待 {} 个在途任务完成...", in_flight);
                last_log = std::time::Instant::now();
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let loops: Vec<JoinHandle<()>> = self.loops.lock().unwrap().drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!("合流调度循环失败: {}", e);
            }
        }
        info!("调度器已停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::OncePolicy;
    use crate::task::TaskExecutor;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct CountingExecutor {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskExecutor for CountingExecutor {
        async fn execute(&self) -> PipelineResult<serde_json::Value> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        }
    }

    struct FatalExecutor;

    #[async_trait]
    impl TaskExecutor for FatalExecutor {
        async fn execute(&self) -> PipelineResult<serde_json::Value> {
            Err(PipelineError::Fatal("不可恢复".to_string()))
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl TaskExecutor for FailingExecutor {
        async fn execute(&self) -> PipelineResult<serde_json::Value> {
            Err(PipelineError::TaskExecution("一般错误".to_string()))
        }
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            max_pool_size: 2,
            max_queue_capacity: 0,
            idle_wait_ms: 10,
            drain_log_interval_seconds: 5,
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F, timeout_ms: u64) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_add_requires_not_stopped() {
        let scheduler = TaskScheduler::new(test_config());
        scheduler.start().unwrap();
        scheduler.stop().await;

        let runs = Arc::new(AtomicUsize::new(0));
        let task = Arc::new(ScheduledTask::new(
            "copy",
            Arc::new(CountingExecutor { runs }),
        ));
        assert!(scheduler.add(task).is_err());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let scheduler = TaskScheduler::new(test_config());
        scheduler.start().unwrap();
        assert!(scheduler.start().is_err());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_periodic_tasks_all_execute_and_wait() {
        // 池大小2上提交3个周期任务，全部都应执行并回到 Waiting
        let scheduler = TaskScheduler::new(test_config());
        let mut counters = Vec::new();
        for i in 0..3 {
            let runs = Arc::new(AtomicUsize::new(0));
            counters.push(Arc::clone(&runs));
            let task = Arc::new(ScheduledTask::with_shard(
                "periodic",
                &format!("p{i}"),
                Arc::new(CountingExecutor { runs }),
            ));
            scheduler.add(task).unwrap();
        }
        scheduler.start().unwrap();

        let all_ran = wait_until(
            || counters.iter().all(|c| c.load(Ordering::SeqCst) >= 2),
            5000,
        )
        .await;
        assert!(all_ran, "所有周期任务都应至少执行两次");

        scheduler.stop().await;
        for task in scheduler.tasks() {
            assert!(
                matches!(task.state(), TaskState::Waiting | TaskState::Done),
                "停机后任务状态: {:?}",
                task.state()
            );
        }
    }

    #[tokio::test]
    async fn test_fatal_error_stops_scheduler() {
        let scheduler = TaskScheduler::new(test_config());
        scheduler.add(Arc::new(ScheduledTask::new("fatal", Arc::new(FatalExecutor)))).unwrap();
        scheduler.start().unwrap();

        let stopped = {
            let inner = Arc::clone(&scheduler.inner);
            wait_until(move || inner.state() == SchedulerState::Stopped, 5000).await
        };
        assert!(stopped, "致命错误应停止整个调度器");
        scheduler.stop().await;

        // 停止后不再接受新任务
        let runs = Arc::new(AtomicUsize::new(0));
        assert!(scheduler
            .add(Arc::new(ScheduledTask::new(
                "copy",
                Arc::new(CountingExecutor { runs })
            )))
            .is_err());
    }

    #[tokio::test]
    async fn test_nonfatal_error_keeps_scheduler_running() {
        let scheduler =
            TaskScheduler::with_policy(test_config(), Arc::new(OncePolicy));
        let failing = Arc::new(ScheduledTask::new("failing", Arc::new(FailingExecutor)));
        let runs = Arc::new(AtomicUsize::new(0));
        let healthy = Arc::new(ScheduledTask::new(
            "healthy",
            Arc::new(CountingExecutor {
                runs: Arc::clone(&runs),
            }),
        ));
        scheduler.add(failing.clone()).unwrap();
        scheduler.add(healthy).unwrap();
        scheduler.start().unwrap();

        let ran = wait_until(|| runs.load(Ordering::SeqCst) >= 1, 5000).await;
        assert!(ran);
        assert!(
            wait_until(|| failing.state() == TaskState::Error, 5000).await,
            "失败任务进入 Error 状态"
        );
        assert_eq!(scheduler.state(), SchedulerState::Running);
        scheduler.stop().await;
    }

    struct GatedExecutor {
        release: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TaskExecutor for GatedExecutor {
        async fn execute(&self) -> PipelineResult<serde_json::Value> {
            while !self.release.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(serde_json::Value::Null)
        }
    }

    #[tokio::test]
    async fn test_queue_capacity_bounds_in_flight_tasks() {
        // 池大小1、队列容量2：在途（Queued+Running）任务不超过2个
        let config = SchedulerConfig {
            max_pool_size: 1,
            max_queue_capacity: 2,
            idle_wait_ms: 10,
            drain_log_interval_seconds: 5,
        };
        let scheduler = TaskScheduler::with_policy(config, Arc::new(OncePolicy));
        let release = Arc::new(AtomicBool::new(false));
        for i in 0..4 {
            scheduler
                .add(Arc::new(ScheduledTask::with_shard(
                    "gated",
                    &format!("g{i}"),
                    Arc::new(GatedExecutor {
                        release: Arc::clone(&release),
                    }),
                )))
                .unwrap();
        }
        scheduler.start().unwrap();

        let in_flight = || {
            scheduler
                .tasks()
                .iter()
                .filter(|t| matches!(t.state(), TaskState::Queued | TaskState::Running))
                .count()
        };
        assert!(wait_until(|| in_flight() == 2, 5000).await);
        // 容量占满后其余任务留在可运行队列中
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(in_flight(), 2);
        assert_eq!(
            scheduler
                .tasks()
                .iter()
                .filter(|t| t.state() == TaskState::Initialized)
                .count(),
            2
        );

        release.store(true, Ordering::SeqCst);
        let all_done = wait_until(
            || scheduler.tasks().iter().all(|t| t.last_finished().is_some()),
            5000,
        )
        .await;
        assert!(all_done, "释放后所有任务都应执行完成");
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_once_policy_runs_each_task_exactly_once() {
        let scheduler = TaskScheduler::with_policy(test_config(), Arc::new(OncePolicy));
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler
            .add(Arc::new(ScheduledTask::new(
                "once",
                Arc::new(CountingExecutor {
                    runs: Arc::clone(&runs),
                }),
            )))
            .unwrap();
        scheduler.start().unwrap();

        assert!(wait_until(|| runs.load(Ordering::SeqCst) == 1, 5000).await);
        // 再等一段时间确认没有第二次执行
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        scheduler.stop().await;
    }
}
