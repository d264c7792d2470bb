//! 工作池：同层节点的并发上限
//!
//! 每层新建一个池，许可数 = min(层大小, max_workers)；节点持有许可期间执行工具。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::PlanError;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// 为一层节点建池
    pub fn for_layer(layer_size: usize, max_workers: usize) -> Self {
        Self::new(layer_size.min(max_workers.max(1)))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 获取执行许可
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, PlanError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PlanError::Fatal("worker pool closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_layer_pool_is_capped() {
        assert_eq!(WorkerPool::for_layer(3, 8).size(), 3);
        assert_eq!(WorkerPool::for_layer(12, 8).size(), 8);
        assert_eq!(WorkerPool::for_layer(0, 8).size(), 1);
    }

    #[tokio::test]
    async fn test_permits_are_returned() {
        let pool = WorkerPool::new(2);
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(blocked.is_err());
        drop(a);
        let freed = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(matches!(freed, Ok(Ok(_))));
    }
}
