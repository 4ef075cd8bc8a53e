use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, PipelineResult};

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 工作池最大并发数
    pub max_pool_size: usize,
    /// 派发队列容量，0 表示取 4 倍 max_pool_size
    pub max_queue_capacity: usize,
    /// 派发/清理循环空闲等待上限（毫秒）
    pub idle_wait_ms: u64,
    /// 停机排空时的等待日志间隔（秒）
    pub drain_log_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 4,
            max_queue_capacity: 0,
            idle_wait_ms: 50,
            drain_log_interval_seconds: 5,
        }
    }
}

impl SchedulerConfig {
    /// 实际派发队列容量
    pub fn queue_capacity(&self) -> usize {
        if self.max_queue_capacity == 0 {
            self.max_pool_size * 4
        } else {
            self.max_queue_capacity
        }
    }
}

/// 消息处理器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// 持久化处理状态的命名空间
    pub namespace: String,
    /// 处理器名称，同命名空间内唯一
    pub name: String,
    /// 单批最大消息数
    pub batch_size: usize,
    /// 取批超时，空批/暂停时也以此为休眠间隔（毫秒）
    pub receive_timeout_ms: u64,
    /// 批内并行处理的终态轮询间隔（毫秒）
    pub join_poll_ms: u64,
    /// 停机时等待运行循环退出的轮询间隔（毫秒）
    pub shutdown_poll_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            namespace: "pipeline".to_string(),
            name: "processor".to_string(),
            batch_size: 32,
            receive_timeout_ms: 1000,
            join_poll_ms: 100,
            shutdown_poll_ms: 500,
        }
    }
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// 应用配置，TOML 文件 + PIPELINE__ 前缀环境变量分层加载
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub processor: ProcessorConfig,
    pub logging: LogConfig,
}

impl AppConfig {
    /// 加载配置：默认值 <- 可选TOML文件 <- 环境变量覆盖
    pub fn load(config_path: Option<&str>) -> PipelineResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("PIPELINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| PipelineError::Configuration(format!("构建配置失败: {e}")))?;

        let config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| PipelineError::Configuration(format!("解析配置失败: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.scheduler.max_pool_size == 0 {
            return Err(PipelineError::Configuration(
                "scheduler.max_pool_size 必须大于 0".to_string(),
            ));
        }
        if self.processor.batch_size == 0 {
            return Err(PipelineError::Configuration(
                "processor.batch_size 必须大于 0".to_string(),
            ));
        }
        if self.processor.name.is_empty() || self.processor.namespace.is_empty() {
            return Err(PipelineError::Configuration(
                "processor.namespace/name 不能为空".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.queue_capacity(), 16);
    }

    #[test]
    fn test_explicit_queue_capacity_wins() {
        let config = SchedulerConfig {
            max_queue_capacity: 7,
            ..Default::default()
        };
        assert_eq!(config.queue_capacity(), 7);
    }

    #[test]
    fn test_validation_rejects_zero_pool() {
        let mut config = AppConfig::default();
        config.scheduler.max_pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[scheduler]
max_pool_size = 2

[processor]
namespace = "replicator"
name = "orders"
batch_size = 5
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.scheduler.max_pool_size, 2);
        assert_eq!(config.processor.namespace, "replicator");
        assert_eq!(config.processor.batch_size, 5);
        // 未指定的字段落回默认值
        assert_eq!(config.processor.receive_timeout_ms, 1000);
    }
}
