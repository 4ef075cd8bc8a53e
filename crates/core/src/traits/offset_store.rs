use async_trait::async_trait;

use crate::errors::PipelineResult;
use crate::models::ProcessState;

/// 分布式锁守卫，释放即解锁
pub type LockGuard = tokio::sync::OwnedMutexGuard<()>;

/// 偏移/处理状态的持久化存储抽象
///
/// create/update 执行乐观并发校验：存储副本的 time_updated 比调用方内存
/// 副本新时拒绝写入（StateConflict），持久化数据不被破坏。
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// 读取处理状态，不存在时返回 None
    async fn get(&self, namespace: &str, name: &str) -> PipelineResult<Option<ProcessState>>;

    /// 创建处理状态，已存在时返回 StateExists
    async fn create(&self, state: &ProcessState) -> PipelineResult<ProcessState>;

    /// 更新处理状态，返回刷新版本戳后的副本
    async fn update(&self, state: &ProcessState) -> PipelineResult<ProcessState>;
}

/// 按 (namespace) 与 (namespace, name) 粒度串行化读-改-写的锁服务
#[async_trait]
pub trait LockService: Send + Sync {
    /// 获取命名空间级别的锁
    async fn lock(&self, namespace: &str) -> PipelineResult<LockGuard>;

    /// 获取 (namespace, name) 级别的锁
    async fn lock_keyed(&self, namespace: &str, name: &str) -> PipelineResult<LockGuard>;
}
