use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use pipeline_core::{OffsetStore, PipelineError, PipelineResult, ProcessState};

/// 内存版偏移存储，用于测试和嵌入式场景
///
/// 与持久化实现执行相同的乐观并发校验，保证调用方在两种存储之间
/// 行为一致。
#[derive(Default)]
pub struct MemoryOffsetStore {
    states: RwLock<HashMap<String, ProcessState>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn get(&self, namespace: &str, name: &str) -> PipelineResult<Option<ProcessState>> {
        let states = self.states.read().await;
        Ok(states.get(&Self::key(namespace, name)).cloned())
    }

    async fn create(&self, state: &ProcessState) -> PipelineResult<ProcessState> {
        let mut states = self.states.write().await;
        let key = state.key();
        if states.contains_key(&key) {
            return Err(PipelineError::StateExists {
                namespace: state.namespace.clone(),
                name: state.name.clone(),
            });
        }
        states.insert(key, state.clone());
        debug!("创建处理状态: {}", state.key());
        Ok(state.clone())
    }

    async fn update(&self, state: &ProcessState) -> PipelineResult<ProcessState> {
        let mut states = self.states.write().await;
        let key = state.key();
        let stored = states
            .get(&key)
            .ok_or_else(|| PipelineError::StateNotFound {
                namespace: state.namespace.clone(),
                name: state.name.clone(),
            })?;
        state.check_not_stale(stored.time_updated)?;

        let mut refreshed = state.clone();
        refreshed.time_updated = Utc::now();
        states.insert(key, refreshed.clone());
        Ok(refreshed)
    }
}
