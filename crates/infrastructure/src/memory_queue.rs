use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use pipeline_core::{
    MessageEnvelope, MessageReceiver, MessageSender, Offset, OffsetStore, PipelineError,
    PipelineResult, ProcessState,
};

/// 接收端偏移状态在存储中使用的命名空间
const OFFSET_NAMESPACE: &str = "receiver-offsets";
/// 单轮 commit 的批量删除上限
const COMMIT_BATCH_LIMIT: usize = 10;

const READ_CHANNEL: &str = "read";
const COMMITTED_CHANNEL: &str = "committed";

/// 内存队列配置
#[derive(Debug, Clone)]
pub struct MemoryQueueConfig {
    pub queue: String,
    pub batch_size: usize,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            batch_size: 32,
        }
    }
}

/// 取批后的消息跟踪记录
struct Tracked {
    sequence: i64,
    acked: bool,
}

struct QueueInner {
    /// 未删除的消息，按单调递增的序列号排序
    messages: BTreeMap<i64, MessageEnvelope>,
    next_sequence: i64,
    read_offset: Offset,
    committed_offset: Offset,
    /// 按消息 id 跟踪已取出未删除的消息
    tracked: HashMap<String, Tracked>,
    closed: bool,
}

/// 内存消息队列，同时实现接收端与发送端
///
/// 偏移语义与持久化队列一致：read 随取批推进，committed 仅在确认删除
/// 后推进，两者都写入偏移存储。消息在被删除前一直保留，seek 回退后
/// 可以重新投递。克隆共享同一份底层队列。
#[derive(Clone)]
pub struct MemoryQueue {
    config: MemoryQueueConfig,
    store: Arc<dyn OffsetStore>,
    instance: String,
    inner: Arc<Mutex<QueueInner>>,
    arrival: Arc<Notify>,
    close_count: Arc<AtomicUsize>,
}

impl MemoryQueue {
    pub fn new(config: MemoryQueueConfig, store: Arc<dyn OffsetStore>) -> Self {
        let instance = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            config,
            store,
            instance,
            inner: Arc::new(Mutex::new(QueueInner {
                messages: BTreeMap::new(),
                next_sequence: 0,
                read_offset: Offset::default(),
                committed_offset: Offset::default(),
                tracked: HashMap::new(),
                closed: false,
            })),
            arrival: Arc::new(Notify::new()),
            close_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// close 被调用的次数，仅用于观测
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn offset_name(&self, channel: &str) -> String {
        format!("{}.{}", self.config.queue, channel)
    }

    async fn load_or_create_offset(&self, channel: &str) -> PipelineResult<Offset> {
        let name = self.offset_name(channel);
        match self.store.get(OFFSET_NAMESPACE, &name).await? {
            Some(state) => Ok(state.offset),
            None => {
                let state = ProcessState::new(OFFSET_NAMESPACE, &name, &self.instance);
                let created = self.store.create(&state).await?;
                Ok(created.offset)
            }
        }
    }

    async fn persist_offset(&self, channel: &str, offset: Offset) -> PipelineResult<()> {
        let name = self.offset_name(channel);
        let mut state = self
            .store
            .get(OFFSET_NAMESPACE, &name)
            .await?
            .ok_or_else(|| PipelineError::StateNotFound {
                namespace: OFFSET_NAMESPACE.to_string(),
                name: name.clone(),
            })?;
        state.advance(offset, &self.instance);
        self.store.update(&state).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageReceiver for MemoryQueue {
    async fn init(&self) -> PipelineResult<()> {
        let mut read = self.load_or_create_offset(READ_CHANNEL).await?;
        let committed = self.load_or_create_offset(COMMITTED_CHANNEL).await?;

        // committed 落后于 read 说明上次运行有已读未确认的消息，
        // 回退 read 重发这些消息，宁可重发不可丢失
        if committed < read {
            warn!(
                queue = %self.config.queue,
                read = %read,
                committed = %committed,
                "read偏移超前于committed偏移，回退后将重发消息"
            );
            self.persist_offset(READ_CHANNEL, committed).await?;
            read = committed;
        }

        let mut inner = self.inner.lock().await;
        inner.read_offset = read;
        inner.committed_offset = committed;
        info!(queue = %self.config.queue, offset = %read, "接收端初始化完成");
        Ok(())
    }

    async fn next_batch(&self, timeout: Duration) -> PipelineResult<Vec<MessageEnvelope>> {
        let deadline = Instant::now() + timeout;
        loop {
            let batch = {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(PipelineError::MessageQueue("接收端已关闭".to_string()));
                }
                let from = inner.read_offset.value();
                let batch: Vec<MessageEnvelope> = inner
                    .messages
                    .range(from + 1..)
                    .take(self.config.batch_size)
                    .map(|(_, envelope)| envelope.clone())
                    .collect();
                if let Some(last) = batch.last() {
                    inner.read_offset = Offset(last.sequence);
                    for envelope in &batch {
                        inner.tracked.insert(
                            envelope.id.clone(),
                            Tracked {
                                sequence: envelope.sequence,
                                acked: false,
                            },
                        );
                    }
                }
                batch
            };

            if !batch.is_empty() {
                let read = Offset(batch[batch.len() - 1].sequence);
                self.persist_offset(READ_CHANNEL, read).await?;
                debug!(queue = %self.config.queue, count = batch.len(), read = %read, "取批完成");
                return Ok(batch);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(remaining, self.arrival.notified()).await;
        }
    }

    async fn ack(&self, message_id: &str, commit: bool) -> PipelineResult<()> {
        if !commit {
            let mut inner = self.inner.lock().await;
            let tracked = inner.tracked.get_mut(message_id).ok_or_else(|| {
                PipelineError::MessageQueue(format!("确认了未跟踪的消息: {message_id}"))
            })?;
            tracked.acked = true;
            return Ok(());
        }

        let committed = {
            let mut inner = self.inner.lock().await;
            let sequence = inner
                .tracked
                .get(message_id)
                .map(|t| t.sequence)
                .ok_or_else(|| {
                    PipelineError::MessageQueue(format!("确认了未跟踪的消息: {message_id}"))
                })?;
            // 立即提交同样受 committed <= read 约束，seek 回退后的越界确认被拒绝
            if sequence > inner.read_offset.value() {
                return Err(PipelineError::OffsetOrder {
                    committed: sequence,
                    read: inner.read_offset.value(),
                });
            }
            inner.tracked.remove(message_id);
            inner.messages.remove(&sequence);
            if sequence > inner.committed_offset.value() {
                inner.committed_offset = Offset(sequence);
            }
            inner.committed_offset
        };
        self.persist_offset(COMMITTED_CHANNEL, committed).await?;
        Ok(())
    }

    async fn commit(&self) -> PipelineResult<usize> {
        let (deleted, committed) = {
            let mut inner = self.inner.lock().await;
            let mut acked: Vec<(String, i64)> = inner
                .tracked
                .iter()
                .filter(|(_, t)| t.acked)
                .map(|(id, t)| (id.clone(), t.sequence))
                .collect();
            if acked.is_empty() {
                // 没有新确认的消息，严格无操作
                return Ok(0);
            }
            acked.sort_by_key(|(_, sequence)| *sequence);

            let highest = acked[acked.len() - 1].1;
            if highest > inner.read_offset.value() {
                return Err(PipelineError::OffsetOrder {
                    committed: highest,
                    read: inner.read_offset.value(),
                });
            }

            for chunk in acked.chunks(COMMIT_BATCH_LIMIT) {
                for (id, sequence) in chunk {
                    inner.messages.remove(sequence);
                    inner.tracked.remove(id);
                }
                debug!(queue = %self.config.queue, count = chunk.len(), "批量删除已确认消息");
            }
            if highest > inner.committed_offset.value() {
                inner.committed_offset = Offset(highest);
            }
            (acked.len(), inner.committed_offset)
        };

        self.persist_offset(COMMITTED_CHANNEL, committed).await?;
        debug!(queue = %self.config.queue, committed = %committed, "committed偏移已推进");
        Ok(deleted)
    }

    async fn seek(&self, offset: Offset) -> PipelineResult<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.read_offset = offset;
            // 已取出未确认的记录作废，消息会重新投递；
            // 已确认待删除的记录保留给下一次 commit
            inner
                .tracked
                .retain(|_, tracked| tracked.acked || tracked.sequence <= offset.value());
        }
        self.persist_offset(READ_CHANNEL, offset).await?;
        info!(queue = %self.config.queue, offset = %offset, "read偏移已重定位");
        Ok(())
    }

    async fn current_offset(&self) -> PipelineResult<Offset> {
        let inner = self.inner.lock().await;
        Ok(inner.read_offset)
    }

    async fn close(&self) -> PipelineResult<()> {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.arrival.notify_waiters();
        info!(queue = %self.config.queue, "接收端已关闭");
        Ok(())
    }
}

#[async_trait]
impl MessageSender for MemoryQueue {
    async fn send(&self, mut envelope: MessageEnvelope) -> PipelineResult<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(PipelineError::MessageQueue("发送端已关闭".to_string()));
            }
            inner.next_sequence += 1;
            envelope.sequence = inner.next_sequence;
            inner.messages.insert(envelope.sequence, envelope);
        }
        self.arrival.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> PipelineResult<()> {
        MessageReceiver::close(self).await
    }
}
