use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat};
use crate::errors::{PipelineError, PipelineResult};

/// 初始化全局日志订阅器
///
/// RUST_LOG 环境变量优先于配置中的级别。重复初始化返回错误而不是 panic，
/// 便于测试场景下多次调用。
pub fn init_logging(config: &LogConfig) -> PipelineResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };

    result.map_err(|e| PipelineError::Configuration(format!("初始化日志失败: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_not_reentrant() {
        let config = LogConfig::default();
        let _ = init_logging(&config);
        // 全局订阅器已存在，再次初始化必须报错而不是 panic
        assert!(init_logging(&config).is_err());
    }
}
