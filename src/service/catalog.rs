//! Catalog service: payload lifecycle, metadata, lineage, tiering verbs.

use serde::{Deserialize, Serialize};

use crate::core::{
    Error, EvictionPolicy, PayloadDescriptor, PayloadId, Result, Tier,
};
use crate::manager::{LineageParent, MetadataUpdateMode};
use crate::repository::LineageEdgeRecord;

use super::ServiceContext;

/// Allocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub size_bytes: u64,
    #[serde(default = "default_tier")]
    pub preferred_tier: Tier,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub persist: bool,
    #[serde(default)]
    pub eviction_policy: Option<EvictionPolicy>,
}

fn default_tier() -> Tier {
    Tier::Ram
}

/// Metadata replace/merge request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataUpdateRequest {
    pub id: PayloadId,
    pub mode: MetadataUpdateMode,
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Append-only metadata history event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEventRequest {
    pub id: PayloadId,
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEventResponse {
    pub event_time_ms: u64,
}

/// Lineage registration for one child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageRequest {
    pub child: PayloadId,
    pub parents: Vec<LineageParent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageResponse {
    pub edges: Vec<LineageEdgeRecord>,
}

/// Batched spill request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpillRequest {
    pub ids: Vec<PayloadId>,
    #[serde(default)]
    pub wait_for_leases: bool,
    #[serde(default)]
    pub fsync: bool,
}

/// Per-id spill outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpillOutcome {
    pub id: PayloadId,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload lifecycle and catalog surface.
#[derive(Clone)]
pub struct CatalogService {
    ctx: ServiceContext,
}

impl CatalogService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub async fn allocate(&self, request: AllocateRequest) -> Result<PayloadDescriptor> {
        if request.size_bytes == 0 {
            return Err(Error::InvalidArgument("size_bytes must be positive".to_string()));
        }
        let policy = request.eviction_policy.or(if request.persist {
            Some(EvictionPolicy::RequireDurable)
        } else {
            None
        });
        self.ctx
            .manager
            .allocate(request.size_bytes, request.preferred_tier, request.ttl_ms, policy)
            .await
    }

    pub async fn commit(&self, id: PayloadId) -> Result<PayloadDescriptor> {
        self.ctx.manager.commit(id).await
    }

    pub async fn delete(&self, id: PayloadId, force: bool) -> Result<()> {
        self.ctx.manager.delete(id, force).await
    }

    pub async fn update_metadata(&self, request: MetadataUpdateRequest) -> Result<()> {
        self.ctx
            .manager
            .update_metadata(request.id, request.mode, request.metadata, request.actor)
            .await?;
        Ok(())
    }

    pub async fn append_metadata_event(
        &self,
        request: MetadataEventRequest,
    ) -> Result<MetadataEventResponse> {
        let event_time_ms = self
            .ctx
            .manager
            .append_metadata_event(request.id, request.metadata, request.source, request.version)
            .await?;
        Ok(MetadataEventResponse { event_time_ms })
    }

    pub async fn add_lineage(&self, request: LineageRequest) -> Result<()> {
        self.ctx.manager.add_lineage(request.child, request.parents).await
    }

    pub async fn get_lineage(
        &self,
        id: PayloadId,
        upstream: bool,
        max_depth: u32,
    ) -> Result<LineageResponse> {
        let edges = self.ctx.manager.get_lineage(id, upstream, max_depth).await?;
        Ok(LineageResponse { edges })
    }

    pub async fn promote(&self, id: PayloadId, target_tier: Tier) -> Result<PayloadDescriptor> {
        self.ctx.manager.promote(id, target_tier).await
    }

    /// Demote each payload one tier down, reporting per-id outcomes.
    pub async fn spill(&self, request: SpillRequest) -> Result<Vec<SpillOutcome>> {
        let mut outcomes = Vec::with_capacity(request.ids.len());
        for id in request.ids {
            let outcome = match self.ctx.manager.resolve_snapshot(id).await {
                Err(e) => SpillOutcome {
                    id,
                    ok: false,
                    tier: None,
                    error: Some(e.to_string()),
                },
                Ok(descriptor) => match descriptor.tier.next_slower() {
                    None => SpillOutcome {
                        id,
                        ok: false,
                        tier: Some(descriptor.tier),
                        error: Some("already on the slowest tier".to_string()),
                    },
                    Some(target) => match self
                        .ctx
                        .manager
                        .execute_spill(id, target, request.fsync, request.wait_for_leases)
                        .await
                    {
                        Ok(moved) => SpillOutcome {
                            id,
                            ok: true,
                            tier: Some(moved.tier),
                            error: None,
                        },
                        Err(e) => SpillOutcome {
                            id,
                            ok: false,
                            tier: Some(descriptor.tier),
                            error: Some(e.to_string()),
                        },
                    },
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{LineageIndex, MetadataCache};
    use crate::lease::LeaseManager;
    use crate::manager::PayloadManager;
    use crate::repository::MemoryRepository;
    use crate::storage::{DiskBackend, RamBackend, StorageBackend, TierRouter};
    use crate::stream::StreamManager;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> (CatalogService, Arc<RamBackend>) {
        let ram = Arc::new(RamBackend::new(1024 * 1024));
        let disk = Arc::new(DiskBackend::new(dir.path()).unwrap());
        let router = Arc::new(TierRouter::new(vec![
            ram.clone() as Arc<dyn StorageBackend>,
            disk as Arc<dyn StorageBackend>,
        ]));
        let repository = Arc::new(MemoryRepository::new());
        let manager = Arc::new(PayloadManager::new(
            repository.clone(),
            router,
            Arc::new(LeaseManager::new(1_000, 60_000)),
            Arc::new(MetadataCache::new()),
            Arc::new(LineageIndex::new()),
        ));
        let streams = Arc::new(StreamManager::new(repository));
        (
            CatalogService::new(ServiceContext::new(manager, streams)),
            ram,
        )
    }

    #[tokio::test]
    async fn test_zero_size_allocation_rejected() {
        let dir = TempDir::new().unwrap();
        let (service, _ram) = service(&dir);
        let err = service
            .allocate(AllocateRequest {
                size_bytes: 0,
                preferred_tier: Tier::Ram,
                ttl_ms: None,
                persist: false,
                eviction_policy: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_persist_flag_implies_durable_policy() {
        let dir = TempDir::new().unwrap();
        let (service, _ram) = service(&dir);
        let descriptor = service
            .allocate(AllocateRequest {
                size_bytes: 4,
                preferred_tier: Tier::Ram,
                ttl_ms: None,
                persist: true,
                eviction_policy: None,
            })
            .await
            .unwrap();
        assert_eq!(descriptor.eviction_policy, Some(EvictionPolicy::RequireDurable));
    }

    #[tokio::test]
    async fn test_spill_reports_per_id_outcomes() {
        let dir = TempDir::new().unwrap();
        let (service, ram) = service(&dir);

        let descriptor = service
            .allocate(AllocateRequest {
                size_bytes: 4,
                preferred_tier: Tier::Ram,
                ttl_ms: None,
                persist: false,
                eviction_policy: None,
            })
            .await
            .unwrap();
        ram.region(&descriptor.id)
            .unwrap()
            .write_at(0, b"data")
            .unwrap();
        service.commit(descriptor.id).await.unwrap();

        let missing = PayloadId::generate();
        let outcomes = service
            .spill(SpillRequest {
                ids: vec![descriptor.id, missing],
                wait_for_leases: false,
                fsync: true,
            })
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].ok);
        assert_eq!(outcomes[0].tier, Some(Tier::Disk));
        assert!(!outcomes[1].ok);
        assert!(outcomes[1].error.as_deref().unwrap_or("").contains("not found"));
    }
}
