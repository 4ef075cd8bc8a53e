use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error};

use pipeline_core::{PipelineError, PipelineResult, TaskId, TaskResponse, TaskState};

/// 一个异步工作单元的执行逻辑
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// 执行任务，成功时返回结果值
    async fn execute(&self) -> PipelineResult<serde_json::Value>;
}

/// 任务完成回调，每次执行尝试恰好调用一次 finished 或 error
#[async_trait]
pub trait TaskCallback: Send + Sync {
    async fn finished(&self, task: &ScheduledTask, response: &TaskResponse);

    async fn error(&self, task: &ScheduledTask, error: &PipelineError, response: &TaskResponse);
}

/// 包装一个工作单元并负责响应生命周期记账
///
/// 入队/运行期间由调度器独占持有；产出的响应所有权随回调转移。
pub struct ScheduledTask {
    id: TaskId,
    state: Mutex<TaskState>,
    executor: Arc<dyn TaskExecutor>,
    callbacks: Mutex<Vec<Arc<dyn TaskCallback>>>,
    response: Mutex<Option<TaskResponse>>,
    last_finished: Mutex<Option<DateTime<Utc>>>,
    notify: Notify,
}

impl ScheduledTask {
    pub fn new(task_type: &str, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            id: TaskId::new(task_type),
            state: Mutex::new(TaskState::Initialized),
            executor,
            callbacks: Mutex::new(Vec::new()),
            response: Mutex::new(None),
            last_finished: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn with_shard(task_type: &str, shard_key: &str, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            id: TaskId::with_shard(task_type, shard_key),
            ..Self::new(task_type, executor)
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: TaskState) {
        *self.state.lock().unwrap() = state;
    }

    /// 注册完成回调，必须在任务开始调度前完成
    pub fn subscribe(&self, callback: Arc<dyn TaskCallback>) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// 最近一次执行尝试结束的时间，调度策略据此判定周期任务资格
    pub fn last_finished(&self) -> Option<DateTime<Utc>> {
        *self.last_finished.lock().unwrap()
    }

    /// 当前响应的快照
    pub fn response(&self) -> Option<TaskResponse> {
        self.response.lock().unwrap().clone()
    }

    /// 等待下一次状态通知，调用方自行检查状态并决定是否继续等
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// 执行一次任务
    ///
    /// 执行层面的错误被捕获进响应并通过回调上报，不会向工作线程外传播。
    /// 仅缺少回调这一致命条件通过返回值向上游暴露，由调度器整体停止。
    pub async fn run(self: &Arc<Self>) -> PipelineResult<()> {
        self.set_state(TaskState::Running);

        {
            let mut response = self.response.lock().unwrap();
            if response.is_none() {
                *response = Some(TaskResponse::new());
            }
        }

        let callbacks: Vec<Arc<dyn TaskCallback>> = self.callbacks.lock().unwrap().clone();
        if callbacks.is_empty() {
            self.set_state(TaskState::Error);
            self.notify.notify_waiters();
            return Err(PipelineError::Fatal(format!(
                "任务 {} 未注册完成回调",
                self.id
            )));
        }

        if let Some(response) = self.response.lock().unwrap().as_mut() {
            response.start();
        }

        let result = self.executor.execute().await;

        match result {
            Ok(value) => {
                debug!("任务执行成功: {}", self.id);
                let snapshot = {
                    let mut guard = self.response.lock().unwrap();
                    let response = guard.get_or_insert_with(TaskResponse::new);
                    response.set_result(value);
                    response.clear_error();
                    response.clone()
                };
                self.set_state(TaskState::Done);
                for callback in &callbacks {
                    callback.finished(self, &snapshot).await;
                }
                if let Some(response) = self.response.lock().unwrap().as_mut() {
                    if let Err(e) = response.close() {
                        error!("关闭任务响应失败: {} - {}", self.id, e);
                        response.set_error(e.to_string());
                    }
                }
            }
            Err(e) => {
                error!("任务执行失败: {} - {}", self.id, e);
                let snapshot = {
                    let mut guard = self.response.lock().unwrap();
                    let response = guard.get_or_insert_with(TaskResponse::new);
                    response.set_error(e.to_string());
                    response.clone()
                };
                self.set_state(TaskState::Error);
                for callback in &callbacks {
                    callback.error(self, &e, &snapshot).await;
                }
            }
        }

        *self.last_finished.lock().unwrap() = Some(Utc::now());
        // 阻塞在本任务上的等待方总是被释放，包括异常退出路径
        self.notify.notify_waiters();
        Ok(())
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OkExecutor;

    #[async_trait]
    impl TaskExecutor for OkExecutor {
        async fn execute(&self) -> PipelineResult<serde_json::Value> {
            Ok(serde_json::json!({"ok": true}))
        }
    }

    struct FailExecutor;

    #[async_trait]
    impl TaskExecutor for FailExecutor {
        async fn execute(&self) -> PipelineResult<serde_json::Value> {
            Err(PipelineError::TaskExecution("失败".to_string()))
        }
    }

    #[derive(Default)]
    struct CountingCallback {
        finished: AtomicUsize,
        errored: AtomicUsize,
    }

    #[async_trait]
    impl TaskCallback for CountingCallback {
        async fn finished(&self, _task: &ScheduledTask, _response: &TaskResponse) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }

        async fn error(
            &self,
            _task: &ScheduledTask,
            _error: &PipelineError,
            _response: &TaskResponse,
        ) {
            self.errored.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_successful_run_invokes_finished_once() {
        let task = Arc::new(ScheduledTask::new("copy", Arc::new(OkExecutor)));
        let callback = Arc::new(CountingCallback::default());
        task.subscribe(callback.clone());

        task.run().await.unwrap();

        assert_eq!(task.state(), TaskState::Done);
        assert_eq!(callback.finished.load(Ordering::SeqCst), 1);
        assert_eq!(callback.errored.load(Ordering::SeqCst), 0);

        let response = task.response().unwrap();
        assert!(response.result.is_some());
        assert!(!response.is_error());
        assert!(response.duration_ms.is_some());
        assert!(task.last_finished().is_some());
    }

    #[tokio::test]
    async fn test_failed_run_invokes_error_once() {
        let task = Arc::new(ScheduledTask::new("copy", Arc::new(FailExecutor)));
        let callback = Arc::new(CountingCallback::default());
        task.subscribe(callback.clone());

        task.run().await.unwrap();

        assert_eq!(task.state(), TaskState::Error);
        assert_eq!(callback.finished.load(Ordering::SeqCst), 0);
        assert_eq!(callback.errored.load(Ordering::SeqCst), 1);
        assert!(task.response().unwrap().is_error());
    }

    #[tokio::test]
    async fn test_run_without_callback_is_fatal() {
        let task = Arc::new(ScheduledTask::new("copy", Arc::new(OkExecutor)));
        let result = task.run().await;
        match result {
            Err(PipelineError::Fatal(_)) => {}
            other => panic!("expected fatal error, got {other:?}"),
        }
        assert_eq!(task.state(), TaskState::Error);
    }

    #[tokio::test]
    async fn test_each_attempt_reports_exactly_once() {
        let task = Arc::new(ScheduledTask::new("copy", Arc::new(OkExecutor)));
        let callback = Arc::new(CountingCallback::default());
        task.subscribe(callback.clone());

        task.run().await.unwrap();
        task.run().await.unwrap();

        assert_eq!(callback.finished.load(Ordering::SeqCst), 2);
    }
}
