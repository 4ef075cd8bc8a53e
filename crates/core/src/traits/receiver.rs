use std::time::Duration;

use async_trait::async_trait;

use crate::errors::PipelineResult;
use crate::models::{MessageEnvelope, Offset};

/// 偏移跟踪的批量消息接收抽象
///
/// 两个偏移通道：read offset 随取批推进，committed offset 仅在处理+确认
/// 成功后推进。不变式 committed <= read 由实现方强制。
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// 绑定底层队列并恢复持久化的偏移状态。
    /// 启动时 committed < read 表示存在重发风险：回退 read 到 committed，
    /// 宁可重发不可丢失。
    async fn init(&self) -> PipelineResult<()>;

    /// 取下一批消息，至多 batch_size 条，受 timeout 约束；推进 read offset。
    /// 偏移持久化时机由实现决定：具备偏移存储的实现取批后立即写入，
    /// 通道作用域的实现仅在内存中跟踪。
    async fn next_batch(&self, timeout: Duration) -> PipelineResult<Vec<MessageEnvelope>>;

    /// 确认一条消息。commit=true 时立即删除底层消息并推进 committed；
    /// commit=false 时仅标记缓冲记录，由 commit() 批量删除。
    async fn ack(&self, message_id: &str, commit: bool) -> PipelineResult<()>;

    /// 批量删除已确认未删除的消息，推进并持久化 committed offset，
    /// 返回删除条数。没有新确认时是严格的无操作。
    async fn commit(&self) -> PipelineResult<usize>;

    /// 重定位到指定偏移。底层不支持重定位的实现返回 SeekUnsupported。
    async fn seek(&self, offset: Offset) -> PipelineResult<()>;

    /// 当前内存中的 read offset
    async fn current_offset(&self) -> PipelineResult<Offset>;

    /// 关闭接收端
    async fn close(&self) -> PipelineResult<()>;
}

/// 消息发送抽象（含错误通道转发）
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, envelope: MessageEnvelope) -> PipelineResult<()>;

    async fn close(&self) -> PipelineResult<()>;
}
