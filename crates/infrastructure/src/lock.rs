use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::Mutex;

use pipeline_core::{LockGuard, LockService, PipelineError, PipelineResult};

/// 进程内命名锁服务
///
/// 同一命名空间（或 namespace/name 组合）的读-改-写在单进程内串行化。
/// 锁对象按需创建并常驻，守卫释放即解锁。
#[derive(Default)]
pub struct LocalLockService {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalLockService {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> PipelineResult<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| PipelineError::LockUnavailable(format!("锁注册表不可用: {e}")))?;
        Ok(locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }
}

#[async_trait]
impl LockService for LocalLockService {
    async fn lock(&self, namespace: &str) -> PipelineResult<LockGuard> {
        let entry = self.entry(namespace)?;
        Ok(entry.lock_owned().await)
    }

    async fn lock_keyed(&self, namespace: &str, name: &str) -> PipelineResult<LockGuard> {
        let entry = self.entry(&format!("{namespace}/{name}"))?;
        Ok(entry.lock_owned().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_namespace_serializes() {
        let service = Arc::new(LocalLockService::new());
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let service = service.clone();
            let peak = peak.clone();
            let active = active.clone();
            handles.push(tokio::spawn(async move {
                let _guard = service.lock("replicator").await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_independent() {
        let service = LocalLockService::new();
        let _a = service.lock_keyed("replicator", "orders").await.unwrap();
        // 不同键不互斥，立即可得
        let _b = service.lock_keyed("replicator", "payments").await.unwrap();
        let _c = service.lock("other").await.unwrap();
    }

    #[tokio::test]
    async fn test_guard_release_unlocks() {
        let service = LocalLockService::new();
        {
            let _guard = service.lock("replicator").await.unwrap();
        }
        // 守卫释放后可以再次获取
        let _again = service.lock("replicator").await.unwrap();
    }
}
