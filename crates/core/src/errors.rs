use thiserror::Error;

/// 处理核心错误类型定义
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 致命错误：调度器/处理器必须整体停止
    #[error("致命错误: {0}")]
    Fatal(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("无效消息: {0}")]
    InvalidMessage(String),

    #[error("消息处理错误: {0}")]
    MessageProcessing(String),

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("状态冲突: 存储副本 {stored} 新于内存副本 {current}")]
    StateConflict { stored: String, current: String },

    #[error("状态未找到: {namespace}/{name}")]
    StateNotFound { namespace: String, name: String },

    #[error("状态已存在: {namespace}/{name}")]
    StateExists { namespace: String, name: String },

    #[error("偏移顺序违例: committed={committed} 超过 read={read}")]
    OffsetOrder { committed: i64, read: i64 },

    #[error("当前接收端不支持seek操作")]
    SeekUnsupported,

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("锁不可用: {0}")]
    LockUnavailable(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl PipelineError {
    /// 判断错误是否应导致调度器/处理器整体停止
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Fatal(_))
    }

    /// 判断错误是否可按单条消息隔离（ack + 转发错误队列后继续）
    pub fn is_message_level(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidMessage(_) | PipelineError::MessageProcessing(_)
        )
    }
}

/// 统一的Result类型
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::Fatal("boom".to_string()).is_fatal());
        assert!(!PipelineError::TaskExecution("boom".to_string()).is_fatal());
        assert!(!PipelineError::InvalidMessage("bad".to_string()).is_fatal());
    }

    #[test]
    fn test_message_level_classification() {
        assert!(PipelineError::InvalidMessage("bad".to_string()).is_message_level());
        assert!(PipelineError::MessageProcessing("bad".to_string()).is_message_level());
        assert!(!PipelineError::MessageQueue("down".to_string()).is_message_level());
        assert!(!PipelineError::Fatal("boom".to_string()).is_message_level());
    }

    #[test]
    fn test_error_display() {
        let err = PipelineError::OffsetOrder {
            committed: 12,
            read: 7,
        };
        assert_eq!(err.to_string(), "偏移顺序违例: committed=12 超过 read=7");
    }
}
