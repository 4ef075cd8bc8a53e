use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};

use pipeline_core::{
    LockService, MessageEnvelope, MessageReceiver, MessageSender, OffsetStore, PipelineError,
    PipelineResult, ProcessState, ProcessorConfig, ProcessorState,
};

/// 用户消息处理逻辑与批次钩子
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// 处理单条消息。消息级错误（InvalidMessage/MessageProcessing）被隔离：
    /// 消息仍被确认并转发错误通道，批次继续；其他错误中止处理器。
    async fn process(&self, envelope: &MessageEnvelope, state: &ProcessState)
        -> PipelineResult<()>;

    /// 批次开始钩子
    async fn batch_start(&self, _batch: &[MessageEnvelope]) -> PipelineResult<()> {
        Ok(())
    }

    /// 批次结束钩子
    async fn batch_end(&self, _batch: &[MessageEnvelope]) -> PipelineResult<()> {
        Ok(())
    }

    /// 并行批处理变体的错误检视钩子：对每个以错误终止的消息任务调用，
    /// 返回 Err 可将特定错误提升为批次级失败（如致命错误）。
    fn check_error(&self, _envelope: &MessageEnvelope, _error: &str) -> PipelineResult<()> {
        Ok(())
    }
}

/// 批处理执行上下文：批次执行策略可见的协作方
#[derive(Clone)]
pub struct BatchContext {
    pub receiver: Arc<dyn MessageReceiver>,
    pub error_sink: Arc<dyn MessageSender>,
    pub handler: Arc<dyn MessageHandler>,
    pub config: ProcessorConfig,
}

impl BatchContext {
    /// 确认处理成功的消息（延迟提交）
    pub async fn ack_success(&self, envelope: &MessageEnvelope) -> PipelineResult<()> {
        self.receiver.ack(&envelope.id, false).await?;
        counter!("pipeline.messages.processed").increment(1);
        Ok(())
    }

    /// 确认毒消息并将原始消息转发错误通道（id/correlation/mode 轮换）。
    /// 转发失败只记录日志，不阻止随后的提交。
    pub async fn ack_and_forward(&self, envelope: &MessageEnvelope, cause: &str) {
        if let Err(e) = self.receiver.ack(&envelope.id, false).await {
            error!("确认错误消息失败: {} - {}", envelope.id, e);
        }
        counter!("pipeline.messages.errors").increment(1);

        let forward = envelope.clone().into_error_envelope();
        debug!("转发错误消息: {} (原因: {})", forward.id, cause);
        if let Err(e) = self.error_sink.send(forward).await {
            error!("转发错误通道失败: {} - {}", envelope.id, e);
        }
    }
}

/// 批次执行策略
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn handle_batch(
        &self,
        batch: &[MessageEnvelope],
        state: &ProcessState,
        ctx: &BatchContext,
    ) -> PipelineResult<()>;
}

/// 顺序批处理：逐条处理，批末统一提交
pub struct SequentialBatchExecutor;

#[async_trait]
impl BatchExecutor for SequentialBatchExecutor {
    async fn handle_batch(
        &self,
        batch: &[MessageEnvelope],
        state: &ProcessState,
        ctx: &BatchContext,
    ) -> PipelineResult<()> {
        for envelope in batch {
            match ctx.handler.process(envelope, state).await {
                Ok(()) => {
                    ctx.ack_success(envelope).await?;
                }
                Err(e) if e.is_message_level() => {
                    // 毒消息不阻塞队列：确认后转发错误通道，批次继续
                    ctx.ack_and_forward(envelope, &e.to_string()).await;
                }
                Err(e) => return Err(e),
            }
        }

        // 无条件提交：即使错误通道转发失败，已确认消息也必须真正删除
        let deleted = ctx.receiver.commit().await?;
        counter!("pipeline.batches.committed").increment(1);
        debug!("批次提交完成，删除 {} 条消息", deleted);
        Ok(())
    }
}

/// 消息处理器构建器
pub struct MessageProcessorBuilder {
    config: ProcessorConfig,
    receiver: Option<Arc<dyn MessageReceiver>>,
    error_sink: Option<Arc<dyn MessageSender>>,
    offset_store: Option<Arc<dyn OffsetStore>>,
    lock_service: Option<Arc<dyn LockService>>,
    handler: Option<Arc<dyn MessageHandler>>,
    batch_executor: Arc<dyn BatchExecutor>,
}

impl MessageProcessorBuilder {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            receiver: None,
            error_sink: None,
            offset_store: None,
            lock_service: None,
            handler: None,
            batch_executor: Arc::new(SequentialBatchExecutor),
        }
    }

    pub fn receiver(mut self, receiver: Arc<dyn MessageReceiver>) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn error_sink(mut self, error_sink: Arc<dyn MessageSender>) -> Self {
        self.error_sink = Some(error_sink);
        self
    }

    pub fn offset_store(mut self, offset_store: Arc<dyn OffsetStore>) -> Self {
        self.offset_store = Some(offset_store);
        self
    }

    pub fn lock_service(mut self, lock_service: Arc<dyn LockService>) -> Self {
        self.lock_service = Some(lock_service);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// 替换批次执行策略（默认顺序执行）
    pub fn batch_executor(mut self, batch_executor: Arc<dyn BatchExecutor>) -> Self {
        self.batch_executor = batch_executor;
        self
    }

    pub fn build(self) -> PipelineResult<MessageProcessor> {
        let missing = |what: &str| {
            PipelineError::Configuration(format!("消息处理器缺少必需的协作方: {what}"))
        };
        Ok(MessageProcessor {
            receiver: self.receiver.ok_or_else(|| missing("receiver"))?,
            error_sink: self.error_sink.ok_or_else(|| missing("error_sink"))?,
            offset_store: self.offset_store.ok_or_else(|| missing("offset_store"))?,
            lock_service: self.lock_service.ok_or_else(|| missing("lock_service"))?,
            handler: self.handler.ok_or_else(|| missing("handler"))?,
            batch_executor: self.batch_executor,
            config: self.config,
            instance: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
            state: Arc::new(Mutex::new(ProcessorState::Initialized)),
            cycle_lock: Arc::new(tokio::sync::Mutex::new(())),
            in_loop: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// 批量取-处理-提交循环的消息处理器
///
/// 状态机: Initialized -> Running -> {Paused, Stopped, Error}。
/// Paused 暂停取批（睡眠轮询）但不关闭接收端；Stopped 触发优雅排空。
/// 每个实例的批次循环被内部锁串行化，任意时刻至多一个批次在处理。
pub struct MessageProcessor {
    receiver: Arc<dyn MessageReceiver>,
    error_sink: Arc<dyn MessageSender>,
    offset_store: Arc<dyn OffsetStore>,
    lock_service: Arc<dyn LockService>,
    handler: Arc<dyn MessageHandler>,
    batch_executor: Arc<dyn BatchExecutor>,
    config: ProcessorConfig,
    instance: String,
    state: Arc<Mutex<ProcessorState>>,
    /// 串行化批次周期，同时防止手工恢复与运行循环竞争偏移更新
    cycle_lock: Arc<tokio::sync::Mutex<()>>,
    in_loop: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for MessageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("config", &self.config)
            .field("instance", &self.instance)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl MessageProcessor {
    pub fn builder(config: ProcessorConfig) -> MessageProcessorBuilder {
        MessageProcessorBuilder::new(config)
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ProcessorState) {
        *self.state.lock().unwrap() = state;
    }

    fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.config.receive_timeout_ms)
    }

    /// 初始化：创建或恢复持久化处理状态，再初始化接收端
    pub async fn init(&self) -> PipelineResult<()> {
        let _ns_guard = self.lock_service.lock(&self.config.namespace).await?;

        match self
            .offset_store
            .get(&self.config.namespace, &self.config.name)
            .await?
        {
            Some(state) => {
                info!(
                    "恢复处理状态: {} offset={} 上次更新于 {}",
                    state.key(),
                    state.offset,
                    state.time_updated
                );
            }
            None => {
                let state = ProcessState::new(
                    &self.config.namespace,
                    &self.config.name,
                    &self.instance,
                );
                self.offset_store.create(&state).await?;
                info!("创建处理状态: {}", state.key());
            }
        }

        self.receiver.init().await?;
        Ok(())
    }

    /// 暂停取批；接收端保持打开
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ProcessorState::Running {
            *state = ProcessorState::Paused;
            info!("处理器已暂停: {}", self.config.name);
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ProcessorState::Paused {
            *state = ProcessorState::Running;
            info!("处理器已恢复: {}", self.config.name);
        }
    }

    /// 请求停止，返回当前状态
    pub fn stop(&self) -> ProcessorState {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, ProcessorState::Running | ProcessorState::Paused) {
            *state = ProcessorState::Stopped;
            info!("处理器转入停止状态: {}", self.config.name);
        }
        *state
    }

    /// 主消费循环，设计为在宿主的后台任务上运行；错误不越过此边界抛出，
    /// 而是转入 Error 状态并写入持久化处理状态供外部检视。
    pub async fn run(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ProcessorState::Initialized {
                warn!("处理器无法从 {:?} 状态启动", *state);
                return;
            }
            *state = ProcessorState::Running;
        }
        self.in_loop.store(true, Ordering::SeqCst);
        info!("处理器开始运行: {}/{}", self.config.namespace, self.config.name);

        while self.state().is_available() {
            if self.state() == ProcessorState::Paused {
                tokio::time::sleep(self.receive_timeout()).await;
                continue;
            }
            if let Err(e) = self.run_once().await {
                error!("批次循环遇到不可恢复错误: {}", e);
                self.set_state(ProcessorState::Error);
                self.persist_error(&e).await;
                break;
            }
        }

        self.in_loop.store(false, Ordering::SeqCst);
        info!(
            "处理器运行循环退出: {} 终态 {:?}",
            self.config.name,
            self.state()
        );
    }

    /// 单个批次周期：崩溃恢复重定位 -> 取批 -> 钩子/持久化 -> 批处理 -> 持久化
    pub async fn run_once(&self) -> PipelineResult<usize> {
        let _cycle = self.cycle_lock.lock().await;
        let _guard = self
            .lock_service
            .lock_keyed(&self.config.namespace, &self.config.name)
            .await?;

        let mut process_state = self
            .offset_store
            .get(&self.config.namespace, &self.config.name)
            .await?
            .ok_or_else(|| PipelineError::StateNotFound {
                namespace: self.config.namespace.clone(),
                name: self.config.name.clone(),
            })?;

        // 崩溃恢复：持久化偏移与接收端在线偏移不一致时，显式重定位
        let live_offset = self.receiver.current_offset().await?;
        if live_offset != process_state.offset {
            warn!(
                "偏移不一致，重定位接收端: durable={} live={}",
                process_state.offset, live_offset
            );
            self.receiver.seek(process_state.offset).await?;
        }

        let batch = self.receiver.next_batch(self.receive_timeout()).await?;
        if batch.is_empty() {
            drop(_guard);
            drop(_cycle);
            tokio::time::sleep(self.receive_timeout()).await;
            return Ok(0);
        }

        let start = std::time::Instant::now();
        counter!("pipeline.batches.received").increment(1);
        histogram!("pipeline.batch.size").record(batch.len() as f64);

        let ctx = BatchContext {
            receiver: Arc::clone(&self.receiver),
            error_sink: Arc::clone(&self.error_sink),
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
        };

        self.handler.batch_start(&batch).await?;
        // 批前只刷新版本戳占据状态记录，偏移在批次提交后才推进；
        // 中途崩溃时持久化偏移仍指向上一个已提交批次的末尾
        process_state.advance(process_state.offset, &self.instance);
        process_state = self.offset_store.update(&process_state).await?;

        self.batch_executor
            .handle_batch(&batch, &process_state, &ctx)
            .await?;

        process_state.advance(self.receiver.current_offset().await?, &self.instance);
        self.handler.batch_end(&batch).await?;
        self.offset_store.update(&process_state).await?;

        histogram!("pipeline.batch.duration.seconds").record(start.elapsed().as_secs_f64());
        Ok(batch.len())
    }

    /// 将失败原因写入持久化处理状态供操作员检视，尽力而为
    async fn persist_error(&self, error: &PipelineError) {
        let stored = self
            .offset_store
            .get(&self.config.namespace, &self.config.name)
            .await;
        if let Ok(Some(mut state)) = stored {
            state.record_error(error.to_string());
            if let Err(e) = self.offset_store.update(&state).await {
                error!("持久化处理器错误信息失败: {}", e);
            }
        }
    }

    /// 关闭处理器：等待运行循环观察到停止标志退出后，
    /// 恰好一次地关闭接收端与错误通道。
    pub async fn close(&self) -> PipelineResult<()> {
        if matches!(
            self.state(),
            ProcessorState::Running | ProcessorState::Paused
        ) {
            self.stop();
        }

        let poll = Duration::from_millis(self.config.shutdown_poll_ms);
        while self.in_loop.load(Ordering::SeqCst) {
            debug!("等待处理循环退出: {}", self.config.name);
            tokio::time::sleep(poll).await;
        }

        if !self.closed.swap(true, Ordering::SeqCst) {
            self.receiver.close().await?;
            self.error_sink.close().await?;
            info!("处理器已关闭: {}", self.config.name);
        }
        Ok(())
    }
}

impl Clone for MessageProcessor {
    fn clone(&self) -> Self {
        Self {
            receiver: Arc::clone(&self.receiver),
            error_sink: Arc::clone(&self.error_sink),
            offset_store: Arc::clone(&self.offset_store),
            lock_service: Arc::clone(&self.lock_service),
            handler: Arc::clone(&self.handler),
            batch_executor: Arc::clone(&self.batch_executor),
            config: self.config.clone(),
            instance: self.instance.clone(),
            state: Arc::clone(&self.state),
            cycle_lock: Arc::clone(&self.cycle_lock),
            in_loop: Arc::clone(&self.in_loop),
            closed: Arc::clone(&self.closed),
        }
    }
}
