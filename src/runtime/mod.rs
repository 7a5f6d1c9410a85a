//! # Node Runtime
//!
//! Builds the dependency graph out of configuration and owns component
//! lifecycles: repository, tier backends, lease manager, catalog caches,
//! payload manager, spill pool, tiering controller, and stream manager.
//! Shutdown stops the controller first (no new pressure work), then
//! drains the spill pool, so in-flight migrations finish cleanly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{LineageIndex, MetadataCache};
use crate::config::RuntimeConfig;
use crate::core::{Result, Tier};
use crate::lease::LeaseManager;
use crate::manager::PayloadManager;
use crate::repository::{MemoryRepository, PostgresRepository, Repository, SqliteRepository};
use crate::service::ServiceContext;
use crate::spill::{SpillScheduler, SpillWorkerPool};
use crate::storage::{
    DiskBackend, GpuBackend, GpuContext, ObjectBackend, RamBackend, StorageBackend, TierRouter,
};
use crate::stream::StreamManager;
use crate::tiering::{LruTieringPolicy, TieringController, TieringControllerHandle};

/// A fully wired node.
pub struct Node {
    manager: Arc<PayloadManager>,
    streams: Arc<StreamManager>,
    scheduler: Arc<SpillScheduler>,
    pool: Option<SpillWorkerPool>,
    controller: Option<TieringControllerHandle>,
}

impl Node {
    /// Build every component from configuration and hydrate caches.
    pub async fn build(config: &RuntimeConfig) -> Result<Node> {
        let repository = build_repository(config).await?;
        let router = Arc::new(TierRouter::new(build_backends(config)?));
        let leases = Arc::new(LeaseManager::new(
            config.leases.default_ms,
            config.leases.max_ms,
        ));
        let manager = Arc::new(PayloadManager::new(
            repository.clone(),
            router,
            leases,
            Arc::new(MetadataCache::new()),
            Arc::new(LineageIndex::new()),
        ));
        manager.hydrate_caches().await?;

        let streams = Arc::new(StreamManager::new(repository));

        let (scheduler, pool) = SpillWorkerPool::start(
            manager.clone(),
            config.spill.workers,
            config.spill.queue_depth,
        );

        let mut limits = HashMap::new();
        limits.insert(Tier::Ram, config.storage.ram.capacity_bytes);
        limits.insert(Tier::Disk, config.storage.disk.capacity_bytes);
        if config.gpu_enabled() {
            limits.insert(Tier::Gpu, config.storage.gpu.capacity_bytes);
        }
        let controller = TieringController::new(
            manager.clone(),
            scheduler.clone(),
            Arc::new(LruTieringPolicy),
            limits,
            Duration::from_millis(config.tiering.interval_ms.max(10)),
        )
        .start();

        Ok(Node {
            manager,
            streams,
            scheduler,
            pool: Some(pool),
            controller: Some(controller),
        })
    }

    pub fn context(&self) -> ServiceContext {
        ServiceContext::new(self.manager.clone(), self.streams.clone())
    }

    pub fn manager(&self) -> &Arc<PayloadManager> {
        &self.manager
    }

    pub fn scheduler(&self) -> &Arc<SpillScheduler> {
        &self.scheduler
    }

    /// Stop background machinery: controller first, then drain the pool.
    pub async fn shutdown(mut self) {
        if let Some(controller) = self.controller.take() {
            controller.stop().await;
        }
        if let Some(pool) = self.pool.take() {
            pool.shutdown().await;
        }
        if let Ok(ctx) = GpuContext::get() {
            ctx.shutdown();
        }
        tracing::info!("node shut down");
    }
}

async fn build_repository(config: &RuntimeConfig) -> Result<Arc<dyn Repository>> {
    if let Some(pg) = &config.database.postgres {
        tracing::info!("repository backend: postgres");
        return Ok(Arc::new(
            PostgresRepository::connect(&pg.url, pg.max_connections).await?,
        ));
    }
    if let Some(sqlite) = &config.database.sqlite {
        tracing::info!(path = %sqlite.path.display(), "repository backend: sqlite");
        return Ok(Arc::new(SqliteRepository::open(&sqlite.path).await?));
    }
    tracing::info!("repository backend: memory");
    Ok(Arc::new(MemoryRepository::new()))
}

fn build_backends(config: &RuntimeConfig) -> Result<Vec<Arc<dyn StorageBackend>>> {
    let mut backends: Vec<Arc<dyn StorageBackend>> = vec![
        Arc::new(RamBackend::new(config.storage.ram.capacity_bytes)),
        Arc::new(DiskBackend::new(&config.storage.disk.root_path)?),
    ];
    if config.gpu_enabled() {
        let context = GpuContext::init(&config.storage.gpu.devices)?;
        backends.push(Arc::new(GpuBackend::new(
            context,
            config.storage.gpu.capacity_bytes,
        )));
    }
    if let Some(object) = &config.storage.object {
        backends.push(Arc::new(ObjectBackend::new(object.endpoint.clone())));
    }
    Ok(backends)
}
