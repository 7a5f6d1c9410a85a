//! # Spill Scheduler & Workers
//!
//! A bounded FIFO queue of migration tasks drained by a fixed worker
//! pool. Workers call the payload manager's spill primitive; a task
//! failure is logged and never stops the pool. Shutdown closes the
//! queue, rejects new tasks, and drains whatever is already in flight.
//!
//! The workers hold only a non-owning handle to the manager (a shared
//! `Arc`), so the manager never learns about the pool that drives it.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::{Error, PayloadId, Result, Tier};
use crate::manager::PayloadManager;

/// A scheduled migration request, typically a demotion under pressure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillTask {
    pub id: PayloadId,
    pub target_tier: Tier,
    pub fsync: bool,
    pub wait_for_leases: bool,
}

impl SpillTask {
    pub fn demote(id: PayloadId, target_tier: Tier) -> Self {
        Self {
            id,
            target_tier,
            fsync: true,
            wait_for_leases: false,
        }
    }
}

/// Producer half of the bounded task queue.
pub struct SpillScheduler {
    sender: Mutex<Option<mpsc::Sender<SpillTask>>>,
}

impl SpillScheduler {
    fn new(sender: mpsc::Sender<SpillTask>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Enqueue a task. `Busy` when the queue is full, `InvalidState`
    /// after shutdown.
    pub fn enqueue(&self, task: SpillTask) -> Result<()> {
        let guard = self.sender.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| Error::InvalidState("spill scheduler is shut down".to_string()))?;
        sender.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(task) => {
                Error::Busy(format!("spill queue full, dropping task for {}", task.id))
            }
            mpsc::error::TrySendError::Closed(_) => {
                Error::InvalidState("spill scheduler is shut down".to_string())
            }
        })
    }

    /// Close the queue. Already-enqueued tasks still drain.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// Fixed pool of workers draining the queue into the manager.
pub struct SpillWorkerPool {
    scheduler: Arc<SpillScheduler>,
    handles: Vec<JoinHandle<()>>,
}

impl SpillWorkerPool {
    /// Spawn `workers` workers over a queue of `queue_depth` slots.
    pub fn start(
        manager: Arc<PayloadManager>,
        workers: usize,
        queue_depth: usize,
    ) -> (Arc<SpillScheduler>, SpillWorkerPool) {
        let (sender, receiver) = mpsc::channel::<SpillTask>(queue_depth.max(1));
        let scheduler = Arc::new(SpillScheduler::new(sender));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let mut handles = Vec::with_capacity(workers.max(1));
        for worker_index in 0..workers.max(1) {
            let manager = manager.clone();
            let receiver = receiver.clone();
            handles.push(tokio::spawn(async move {
                Self::run_worker(worker_index, manager, receiver).await;
            }));
        }

        let pool = SpillWorkerPool {
            scheduler: scheduler.clone(),
            handles,
        };
        (scheduler, pool)
    }

    async fn run_worker(
        worker_index: usize,
        manager: Arc<PayloadManager>,
        receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<SpillTask>>>,
    ) {
        tracing::debug!(worker_index, "spill worker started");
        loop {
            // hold the receiver lock only for the dequeue itself
            let task = {
                let mut rx = receiver.lock().await;
                rx.recv().await
            };
            let Some(task) = task else { break };

            match manager
                .execute_spill(task.id, task.target_tier, task.fsync, task.wait_for_leases)
                .await
            {
                Ok(descriptor) => {
                    tracing::debug!(worker_index, id = %task.id, tier = %descriptor.tier,
                        "spill task finished");
                }
                Err(e) => {
                    // failures never stop the pool
                    tracing::warn!(worker_index, id = %task.id, target = %task.target_tier,
                        error = %e, "spill task failed");
                }
            }
        }
        tracing::debug!(worker_index, "spill worker stopped");
    }

    /// Stop accepting tasks, drain the queue, and join the workers.
    pub async fn shutdown(self) {
        self.scheduler.shutdown();
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("spill worker pool drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{LineageIndex, MetadataCache};
    use crate::core::Tier;
    use crate::lease::LeaseManager;
    use crate::repository::MemoryRepository;
    use crate::storage::{DiskBackend, RamBackend, StorageBackend, TierRouter};
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> (Arc<PayloadManager>, Arc<RamBackend>, Arc<DiskBackend>) {
        let ram = Arc::new(RamBackend::new(1024 * 1024));
        let disk = Arc::new(DiskBackend::new(dir.path()).unwrap());
        let router = Arc::new(TierRouter::new(vec![
            ram.clone() as Arc<dyn StorageBackend>,
            disk.clone() as Arc<dyn StorageBackend>,
        ]));
        let manager = Arc::new(PayloadManager::new(
            Arc::new(MemoryRepository::new()),
            router,
            Arc::new(LeaseManager::new(1_000, 60_000)),
            Arc::new(MetadataCache::new()),
            Arc::new(LineageIndex::new()),
        ));
        (manager, ram, disk)
    }

    #[tokio::test]
    async fn test_worker_executes_enqueued_spill() {
        let dir = TempDir::new().unwrap();
        let (manager, ram, disk) = manager(&dir);
        let (scheduler, pool) = SpillWorkerPool::start(manager.clone(), 2, 16);

        let descriptor = manager.allocate(4, Tier::Ram, None, None).await.unwrap();
        ram.region(&descriptor.id)
            .unwrap()
            .write_at(0, b"data")
            .unwrap();
        manager.commit(descriptor.id).await.unwrap();

        scheduler
            .enqueue(SpillTask::demote(descriptor.id, Tier::Disk))
            .unwrap();

        // drain through shutdown, then inspect
        pool.shutdown().await;
        assert!(disk.exists(&descriptor.id).await);
        assert!(!ram.exists(&descriptor.id).await);
    }

    #[tokio::test]
    async fn test_failed_task_does_not_stop_pool() {
        let dir = TempDir::new().unwrap();
        let (manager, ram, disk) = manager(&dir);
        let (scheduler, pool) = SpillWorkerPool::start(manager.clone(), 1, 16);

        // unknown payload: the task fails, the pool keeps going
        scheduler
            .enqueue(SpillTask::demote(PayloadId::generate(), Tier::Disk))
            .unwrap();

        let descriptor = manager.allocate(2, Tier::Ram, None, None).await.unwrap();
        ram.region(&descriptor.id)
            .unwrap()
            .write_at(0, b"ok")
            .unwrap();
        manager.commit(descriptor.id).await.unwrap();
        scheduler
            .enqueue(SpillTask::demote(descriptor.id, Tier::Disk))
            .unwrap();

        pool.shutdown().await;
        assert!(disk.exists(&descriptor.id).await);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (manager, _ram, _disk) = manager(&dir);
        let (scheduler, pool) = SpillWorkerPool::start(manager, 1, 4);

        pool.shutdown().await;
        assert!(scheduler.is_shut_down());
        let err = scheduler
            .enqueue(SpillTask::demote(PayloadId::generate(), Tier::Disk))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_full_queue_reports_busy() {
        // one slot, nobody draining
        let (sender, _receiver) = mpsc::channel::<SpillTask>(1);
        let scheduler = SpillScheduler::new(sender);

        scheduler
            .enqueue(SpillTask::demote(PayloadId::generate(), Tier::Disk))
            .unwrap();
        let err = scheduler
            .enqueue(SpillTask::demote(PayloadId::generate(), Tier::Disk))
            .unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
    }
}
