use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{PipelineError, PipelineResult};

/// 任务唯一标识：类型 + UUID，可选分片键加盐
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(task_type: &str) -> Self {
        Self(format!("{}-{}", task_type, Uuid::new_v4()))
    }

    /// 带分片键的任务ID，同类型不同分片的任务互不冲突
    pub fn with_shard(task_type: &str, shard_key: &str) -> Self {
        Self(format!("{}-{}-{}", task_type, shard_key, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 任务状态机: Initialized -> Queued -> Running -> {Done, Error, Stopped}
///
/// Waiting 是周期任务完成后重新入队使用的伪状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Initialized,
    Queued,
    Waiting,
    Running,
    Done,
    Error,
    Stopped,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Initialized => "INITIALIZED",
            TaskState::Queued => "QUEUED",
            TaskState::Waiting => "WAITING",
            TaskState::Running => "RUNNING",
            TaskState::Done => "DONE",
            TaskState::Error => "ERROR",
            TaskState::Stopped => "STOPPED",
        }
    }

    /// 单次执行的终态（Waiting 不是终态，周期任务会再次运行）
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Error | TaskState::Stopped)
    }
}

/// 任务响应：结果值、错误与执行计时
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResponse {
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl TaskResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录执行开始时间
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
    }

    pub fn set_result(&mut self, result: serde_json::Value) {
        self.result = Some(result);
    }

    pub fn set_error(&mut self, error: String) {
        self.error = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// 关闭响应并盖章执行时长；未调用 start() 就关闭是错误条件
    pub fn close(&mut self) -> PipelineResult<()> {
        let started = self.started_at.ok_or_else(|| {
            PipelineError::Internal("响应在记录开始时间之前被关闭".to_string())
        })?;
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = Some((now - started).num_milliseconds());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_format() {
        let id = TaskId::new("replicate");
        assert!(id.as_str().starts_with("replicate-"));

        let sharded = TaskId::with_shard("replicate", "p07");
        assert!(sharded.as_str().starts_with("replicate-p07-"));
        assert_ne!(TaskId::new("replicate"), TaskId::new("replicate"));
    }

    #[test]
    fn test_state_terminality() {
        assert!(TaskState::Done.is_terminal());
        assert!(TaskState::Error.is_terminal());
        assert!(TaskState::Stopped.is_terminal());
        assert!(!TaskState::Waiting.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
    }

    #[test]
    fn test_response_close_requires_start() {
        let mut response = TaskResponse::new();
        assert!(response.close().is_err());

        response.start();
        assert!(response.close().is_ok());
        assert!(response.completed_at.is_some());
        assert!(response.duration_ms.is_some());
    }

    #[test]
    fn test_response_error_lifecycle() {
        let mut response = TaskResponse::new();
        response.set_error("执行失败".to_string());
        assert!(response.is_error());
        response.clear_error();
        assert!(!response.is_error());
    }
}
