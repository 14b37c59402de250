//! 工作者实例池
//!
//! 每个工作者类型一组固定容量的实例。租用走公平信号量（先到先得），
//! 池空时阻塞等待，超过配置的等待上限返回 PoolExhausted。租约（WorkerLease）
//! 在 Drop 时把实例放回池子并释放许可。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};

use crate::error::CoordError;
use crate::worker::Worker;

type IdleQueue = Arc<Mutex<VecDeque<Arc<dyn Worker>>>>;

/// 单个类型的池：许可数 == 空闲实例数
struct PoolCell {
    semaphore: Arc<Semaphore>,
    idle: IdleQueue,
    capacity: usize,
}

/// 工作者实例池
pub struct WorkerPool {
    acquire_timeout: Duration,
    cells: RwLock<HashMap<String, PoolCell>>,
}

impl WorkerPool {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            acquire_timeout,
            cells: RwLock::new(HashMap::new()),
        }
    }

    /// 登记一个类型的实例集合；重复登记覆盖旧池
    pub async fn register(&self, worker_type: impl Into<String>, instances: Vec<Arc<dyn Worker>>) {
        let worker_type = worker_type.into();
        let capacity = instances.len();
        for instance in &instances {
            if instance.worker_type() != worker_type {
                tracing::warn!(
                    pool = %worker_type,
                    instance = %instance.worker_type(),
                    "Instance declares a different worker type than its pool"
                );
            }
        }
        let cell = PoolCell {
            semaphore: Arc::new(Semaphore::new(capacity)),
            idle: Arc::new(Mutex::new(instances.into_iter().collect())),
            capacity,
        };
        tracing::debug!(worker_type = %worker_type, capacity, "Registered worker pool");
        self.cells.write().await.insert(worker_type, cell);
    }

    /// 租用一个实例。池空时排队等待，先到先得；等待超时返回 PoolExhausted。
    pub async fn acquire(&self, worker_type: &str) -> Result<WorkerLease, CoordError> {
        let (semaphore, idle) = {
            let cells = self.cells.read().await;
            let cell = cells
                .get(worker_type)
                .ok_or_else(|| CoordError::UnknownWorkerType(worker_type.to_string()))?;
            (cell.semaphore.clone(), cell.idle.clone())
        };

        let permit = tokio::time::timeout(self.acquire_timeout, semaphore.acquire_owned())
            .await
            .map_err(|_| CoordError::PoolExhausted(worker_type.to_string()))?
            .map_err(|_| CoordError::PoolExhausted(worker_type.to_string()))?;

        // 持有许可即保证队列非空
        let worker = idle
            .lock()
            .map_err(|_| CoordError::Unclassified("pool mutex poisoned".to_string()))?
            .pop_front()
            .ok_or_else(|| CoordError::Unclassified("pool bookkeeping out of sync".to_string()))?;

        Ok(WorkerLease {
            worker: Some(worker),
            idle,
            _permit: permit,
        })
    }

    /// 某类型当前空闲实例数
    pub async fn available(&self, worker_type: &str) -> usize {
        self.cells
            .read()
            .await
            .get(worker_type)
            .map(|c| c.semaphore.available_permits())
            .unwrap_or(0)
    }

    /// 某类型的池容量
    pub async fn capacity(&self, worker_type: &str) -> usize {
        self.cells
            .read()
            .await
            .get(worker_type)
            .map(|c| c.capacity)
            .unwrap_or(0)
    }
}

/// 实例租约：Drop 时归还实例、释放许可
pub struct WorkerLease {
    worker: Option<Arc<dyn Worker>>,
    idle: IdleQueue,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease").finish_non_exhaustive()
    }
}

impl WorkerLease {
    pub fn worker(&self) -> &Arc<dyn Worker> {
        // new 之后 worker 始终是 Some，仅在 Drop 里取走
        self.worker.as_ref().unwrap()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Ok(mut idle) = self.idle.lock() {
                idle.push_back(worker);
            }
        }
        // _permit 随后释放，许可数与空闲数保持一致
    }
}
