use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use pipeline_core::{
    MessageEnvelope, PipelineError, PipelineResult, ProcessState, SchedulerConfig,
};
use pipeline_scheduler::{OncePolicy, ScheduledTask, TaskExecutor, TaskScheduler};

use crate::processor::{BatchContext, BatchExecutor, MessageHandler};

/// 把一条消息的处理包装成调度器任务
struct EnvelopeExecutor {
    handler: Arc<dyn MessageHandler>,
    envelope: MessageEnvelope,
    state: ProcessState,
}

#[async_trait]
impl TaskExecutor for EnvelopeExecutor {
    async fn execute(&self) -> PipelineResult<serde_json::Value> {
        self.handler.process(&self.envelope, &self.state).await?;
        Ok(serde_json::Value::Null)
    }
}

/// 并行批处理：批内消息扇出到专用单工作位调度器，
/// 全部任务响应到达终态后再统一确认与提交。
///
/// 每个以错误终止的任务先经过 check_error 钩子检视，钩子返回错误即把
/// 该错误提升为批次级失败（提交不会发生）；否则按消息级错误处理，
/// 确认并转发错误通道。
pub struct ParallelBatchExecutor {
    join_poll: Duration,
}

impl ParallelBatchExecutor {
    pub fn new(join_poll: Duration) -> Self {
        Self { join_poll }
    }
}

impl Default for ParallelBatchExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[async_trait]
impl BatchExecutor for ParallelBatchExecutor {
    async fn handle_batch(
        &self,
        batch: &[MessageEnvelope],
        state: &ProcessState,
        ctx: &BatchContext,
    ) -> PipelineResult<()> {
        // 专用单工作位调度器，仅为本批次服务
        let scheduler_config = SchedulerConfig {
            max_pool_size: 1,
            ..Default::default()
        };
        let scheduler =
            TaskScheduler::with_policy(scheduler_config, Arc::new(OncePolicy));

        let mut tasks = Vec::with_capacity(batch.len());
        for envelope in batch {
            let task = Arc::new(ScheduledTask::new(
                "batch-message",
                Arc::new(EnvelopeExecutor {
                    handler: Arc::clone(&ctx.handler),
                    envelope: envelope.clone(),
                    state: state.clone(),
                }),
            ));
            scheduler.add(Arc::clone(&task))?;
            tasks.push((task, envelope));
        }
        scheduler.start()?;

        // 阻塞到每个消息任务的响应到达终态
        while !tasks.iter().all(|(task, _)| task.last_finished().is_some()) {
            tokio::time::sleep(self.join_poll).await;
        }
        scheduler.stop().await;

        let mut escalated: Option<PipelineError> = None;
        for (task, envelope) in &tasks {
            let response = task.response().unwrap_or_default();
            match response.error {
                Some(cause) => {
                    if let Err(e) = ctx.handler.check_error(envelope, &cause) {
                        error!(
                            "消息 {} 的错误被提升为批次级失败: {}",
                            envelope.id, e
                        );
                        escalated = Some(e);
                        continue;
                    }
                    ctx.ack_and_forward(envelope, &cause).await;
                }
                None => {
                    ctx.ack_success(envelope).await?;
                }
            }
        }
        if let Some(e) = escalated {
            return Err(e);
        }

        let deleted = ctx.receiver.commit().await?;
        debug!("并行批次提交完成，删除 {} 条消息", deleted);
        Ok(())
    }
}
