use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, PipelineResult};

/// 不透明、可比较的位置标记，来源内单调递增
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Offset(pub i64);

impl Offset {
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 处理器生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessorState {
    Initialized,
    Running,
    Paused,
    Stopped,
    Error,
}

impl ProcessorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorState::Initialized => "INITIALIZED",
            ProcessorState::Running => "RUNNING",
            ProcessorState::Paused => "PAUSED",
            ProcessorState::Stopped => "STOPPED",
            ProcessorState::Error => "ERROR",
        }
    }

    /// 处理循环是否还可以继续取批
    pub fn is_available(&self) -> bool {
        matches!(self, ProcessorState::Running | ProcessorState::Paused)
    }
}

/// 每个处理器的持久化处理状态记录
///
/// time_updated 同时充当乐观并发版本号：存储副本比内存副本新即拒绝写入。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessState {
    pub namespace: String,
    pub name: String,
    /// 最近更新该状态的实例（主机名）
    pub instance: String,
    pub time_created: DateTime<Utc>,
    pub time_updated: DateTime<Utc>,
    pub offset: Offset,
    /// 操作员可见的最近错误，处理器转入 Error 状态时写入
    pub error: Option<String>,
}

impl ProcessState {
    pub fn new(namespace: &str, name: &str, instance: &str) -> Self {
        let now = Utc::now();
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            instance: instance.to_string(),
            time_created: now,
            time_updated: now,
            offset: Offset::default(),
            error: None,
        }
    }

    /// 校验存储副本相对内存副本没有被并发更新过
    pub fn check_not_stale(&self, stored_time_updated: DateTime<Utc>) -> PipelineResult<()> {
        if stored_time_updated > self.time_updated {
            return Err(PipelineError::StateConflict {
                stored: stored_time_updated.to_rfc3339(),
                current: self.time_updated.to_rfc3339(),
            });
        }
        Ok(())
    }

    /// 推进偏移并刷新版本戳
    pub fn advance(&mut self, offset: Offset, instance: &str) {
        self.offset = offset;
        self.instance = instance.to_string();
        self.time_updated = Utc::now();
    }

    pub fn record_error(&mut self, error: String) {
        self.error = Some(error);
        self.time_updated = Utc::now();
    }

    /// 组合键 namespace/name
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}
