use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use pipeline_core::{PipelineError, PipelineResult};

/// 流水线指标采集器
///
/// 指标名称与调度器/处理器内联上报的名称一致，这里持有句柄便于
/// 组件外部补充上报，并提供Prometheus导出安装入口。
pub struct MetricsCollector {
    messages_processed: Counter,
    message_errors: Counter,
    batches_received: Counter,
    batches_committed: Counter,
    batch_size: Histogram,
    batch_duration: Histogram,
    tasks_added: Counter,
    tasks_submitted: Counter,
    in_flight: Gauge,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages_processed: counter!("pipeline.messages.processed"),
            message_errors: counter!("pipeline.messages.errors"),
            batches_received: counter!("pipeline.batches.received"),
            batches_committed: counter!("pipeline.batches.committed"),
            batch_size: histogram!("pipeline.batch.size"),
            batch_duration: histogram!("pipeline.batch.duration.seconds"),
            tasks_added: counter!("pipeline.scheduler.tasks.added"),
            tasks_submitted: counter!("pipeline.scheduler.tasks.submitted"),
            in_flight: gauge!("pipeline.scheduler.in_flight"),
        }
    }

    /// 安装全局Prometheus记录器，返回抓取句柄
    pub fn install_prometheus() -> PipelineResult<PrometheusHandle> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| PipelineError::Configuration(format!("安装指标记录器失败: {e}")))?;
        info!("Prometheus指标记录器已安装");
        Ok(handle)
    }

    pub fn record_message_processed(&self) {
        self.messages_processed.increment(1);
    }

    pub fn record_message_error(&self) {
        self.message_errors.increment(1);
    }

    pub fn record_batch(&self, size: usize, duration_seconds: f64) {
        self.batches_received.increment(1);
        self.batch_size.record(size as f64);
        self.batch_duration.record(duration_seconds);
    }

    pub fn record_batch_committed(&self) {
        self.batches_committed.increment(1);
    }

    pub fn record_task_added(&self) {
        self.tasks_added.increment(1);
    }

    pub fn record_task_submitted(&self) {
        self.tasks_submitted.increment(1);
    }

    pub fn update_in_flight(&self, count: f64) {
        self.in_flight.set(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_records_without_recorder() {
        // 未安装全局记录器时上报是无操作，不应panic
        let collector = MetricsCollector::new();
        collector.record_message_processed();
        collector.record_batch(5, 0.12);
        collector.update_in_flight(2.0);
    }
}
