//! # Payload Manager
//!
//! The lifecycle authority. This is the only writer of payload rows and
//! the only component allowed to move bytes between tiers. Every
//! mutation runs under that payload's own mutex from a sharded lock map,
//! and the repository commit inside the critical section is the
//! linearization point observers agree on.
//!
//! Migration ordering, preserved by every path that moves bytes:
//! destination write happens before the repository commit, which happens
//! before the source bytes are removed. A crash in the middle leaves
//! redundant or stale bytes, never a dangling descriptor; the startup
//! sweep reclaims leftovers.

use dashmap::DashMap;
use lru::LruCache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::catalog::{merge_metadata, LineageIndex, MetadataCache};
use crate::core::{
    now_ms, Error, EvictionPolicy, PayloadDescriptor, PayloadId, PayloadState, PromotionPolicy,
    Result, Tier,
};
use crate::lease::{Lease, LeaseManager};
use crate::repository::{
    begin_with_retry, LineageEdgeRecord, MetadataEventRecord, MetadataRecord, PayloadRecord,
    Repository, RepositoryTx,
};
use crate::storage::TierRouter;

/// How long a lease-respecting spill will wait for leases to drain.
const SPILL_LEASE_WAIT: Duration = Duration::from_secs(10);

/// Poll interval while waiting out leases.
const SPILL_LEASE_POLL: Duration = Duration::from_millis(50);

/// Metadata update modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataUpdateMode {
    Replace,
    Merge,
}

/// One parent reference in an `add_lineage` call.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LineageParent {
    pub parent: PayloadId,
    pub operation: String,
    pub role: String,
    #[serde(default)]
    pub parameters: String,
}

/// Occupancy census row handed to the tiering policy.
#[derive(Debug, Clone)]
pub struct CensusEntry {
    pub id: PayloadId,
    pub tier: Tier,
    pub state: PayloadState,
    pub size_bytes: u64,
    pub last_access_ms: u64,
    pub leased: bool,
}

/// Per-tier counts and byte totals.
#[derive(Debug, Clone, Default)]
pub struct TierStats {
    pub payloads: HashMap<Tier, u64>,
    pub bytes: HashMap<Tier, u64>,
}

/// Central coordinator over repository, storage, leases, and catalog.
pub struct PayloadManager {
    repository: Arc<dyn Repository>,
    router: Arc<TierRouter>,
    leases: Arc<LeaseManager>,
    metadata_cache: Arc<MetadataCache>,
    lineage_index: Arc<LineageIndex>,
    /// Per-payload mutation locks; the entry is removed on delete.
    locks: DashMap<PayloadId, Arc<Mutex<()>>>,
    /// Advisory eviction policies, runtime state only.
    policies: DashMap<PayloadId, EvictionPolicy>,
    /// Recency order plus last-access clock for the eviction policy.
    access_log: parking_lot::Mutex<LruCache<PayloadId, u64>>,
}

impl PayloadManager {
    pub fn new(
        repository: Arc<dyn Repository>,
        router: Arc<TierRouter>,
        leases: Arc<LeaseManager>,
        metadata_cache: Arc<MetadataCache>,
        lineage_index: Arc<LineageIndex>,
    ) -> Self {
        Self {
            repository,
            router,
            leases,
            metadata_cache,
            lineage_index,
            locks: DashMap::new(),
            policies: DashMap::new(),
            access_log: parking_lot::Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn router(&self) -> &Arc<TierRouter> {
        &self.router
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    fn lock_for(&self, id: &PayloadId) -> Arc<Mutex<()>> {
        self.locks
            .entry(*id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn touch(&self, id: &PayloadId) {
        self.access_log.lock().put(*id, now_ms());
    }

    fn descriptor_for(&self, record: &PayloadRecord) -> Result<PayloadDescriptor> {
        let backend = self.router.backend(record.tier)?;
        Ok(PayloadDescriptor {
            id: record.id,
            tier: record.tier,
            state: record.state,
            size_bytes: record.size_bytes,
            version: record.version,
            expires_at_ms: record.expires_at_ms,
            location: backend.location(&record.id, record.size_bytes),
            eviction_policy: self.policies.get(&record.id).map(|p| *p),
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create a payload in `Allocated` state with a writable region in
    /// the chosen tier. `ResourceExhausted` when the tier cannot hold it.
    #[tracing::instrument(skip(self))]
    pub async fn allocate(
        &self,
        size_bytes: u64,
        preferred_tier: Tier,
        ttl_ms: Option<u64>,
        eviction_policy: Option<EvictionPolicy>,
    ) -> Result<PayloadDescriptor> {
        let id = PayloadId::generate();
        let tier = self.router.allocation_tier(preferred_tier)?;
        let backend = self.router.backend(tier)?;
        let location = backend.allocate(&id, size_bytes).await?;

        let record = PayloadRecord {
            id,
            tier,
            state: PayloadState::Allocated,
            size_bytes,
            version: 1,
            expires_at_ms: ttl_ms.map(|ttl| now_ms() + ttl),
        };

        let mut tx = begin_with_retry(self.repository.as_ref()).await?;
        if let Err(e) = async {
            tx.insert_payload(&record).await?;
            tx.commit().await
        }
        .await
        {
            // reclaim the region the row never came to describe
            let _ = backend.remove(&id).await;
            return Err(e);
        }

        if let Some(policy) = eviction_policy {
            self.policies.insert(id, policy);
        }
        self.touch(&id);
        tracing::info!(%id, %tier, size_bytes, "payload allocated");

        Ok(PayloadDescriptor {
            id,
            tier,
            state: record.state,
            size_bytes,
            version: record.version,
            expires_at_ms: record.expires_at_ms,
            location,
            eviction_policy,
        })
    }

    /// Make the payload visible to readers. Legal only from `Allocated`.
    #[tracing::instrument(skip(self))]
    pub async fn commit(&self, id: PayloadId) -> Result<PayloadDescriptor> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        let mut tx = begin_with_retry(self.repository.as_ref()).await?;
        let mut record = tx
            .get_payload(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("payload {}", id)))?;
        if record.state != PayloadState::Allocated {
            return Err(Error::InvalidState(format!(
                "commit requires allocated state, payload {} is {}",
                id, record.state
            )));
        }
        record.state = PayloadState::Active;
        record.version += 1;
        tx.update_payload(&record).await?;
        tx.commit().await?;

        self.touch(&id);
        tracing::info!(%id, version = record.version, "payload committed");
        self.descriptor_for(&record)
    }

    /// Advisory lookup. The placement may change immediately after
    /// return; callers needing stability take a lease instead.
    pub async fn resolve_snapshot(&self, id: PayloadId) -> Result<PayloadDescriptor> {
        let mut tx = self.repository.begin().await?;
        let record = tx
            .get_payload(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("payload {}", id)))?;
        tx.rollback().await?;
        self.touch(&id);
        self.descriptor_for(&record)
    }

    /// Acquire a placement-stable read lease, promoting first when the
    /// payload sits below `min_tier`.
    #[tracing::instrument(skip(self))]
    pub async fn acquire_read_lease(
        &self,
        id: PayloadId,
        min_tier: Tier,
        promotion: PromotionPolicy,
        min_duration_ms: u64,
    ) -> Result<Lease> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        let mut tx = begin_with_retry(self.repository.as_ref()).await?;
        let mut record = tx
            .get_payload(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("payload {}", id)))?;
        tx.rollback().await?;

        if !record.state.is_readable() {
            return Err(Error::InvalidState(format!(
                "payload {} is {} and not readable",
                id, record.state
            )));
        }

        if record.tier.slower_than(min_tier) {
            if promotion == PromotionPolicy::Pinned {
                return Err(Error::InvalidState(format!(
                    "payload {} pinned in {} below required {}",
                    id, record.tier, min_tier
                )));
            }
            self.migrate_locked(&mut record, min_tier, false).await?;
        }

        // readable means the bytes really are where the row says
        let backend = self.router.backend(record.tier)?;
        if !backend.exists(&id).await {
            return Err(Error::Corruption(format!(
                "payload {} missing from tier {}",
                id, record.tier
            )));
        }

        let descriptor = self.descriptor_for(&record)?;
        self.touch(&id);
        let lease = self.leases.acquire(descriptor, min_duration_ms);
        tracing::debug!(%id, lease_id = %lease.lease_id, "read lease issued");
        Ok(lease)
    }

    /// Best-effort release; unknown lease ids are ignored.
    pub fn release_lease(&self, lease_id: &str) {
        self.leases.release(lease_id);
    }

    /// Move the payload to `target_tier`. No-op (and no version bump)
    /// when it already resides there.
    #[tracing::instrument(skip(self))]
    pub async fn promote(&self, id: PayloadId, target_tier: Tier) -> Result<PayloadDescriptor> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        let mut tx = self.repository.begin().await?;
        let mut record = tx
            .get_payload(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("payload {}", id)))?;
        tx.rollback().await?;

        if !record.state.is_readable() {
            return Err(Error::InvalidState(format!(
                "payload {} is {} and cannot migrate",
                id, record.state
            )));
        }

        self.migrate_locked(&mut record, target_tier, false).await?;
        self.touch(&id);
        self.descriptor_for(&record)
    }

    /// Migration primitive used by the spill workers. Honors leases:
    /// with `wait_for_leases` it waits (bounded) for the pin to drain,
    /// otherwise an active lease is an immediate conflict.
    #[tracing::instrument(skip(self))]
    pub async fn execute_spill(
        &self,
        id: PayloadId,
        target_tier: Tier,
        fsync: bool,
        wait_for_leases: bool,
    ) -> Result<PayloadDescriptor> {
        if wait_for_leases {
            let deadline = tokio::time::Instant::now() + SPILL_LEASE_WAIT;
            while self.leases.has_active(&id) {
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::LeaseConflict(format!(
                        "payload {} still leased after bounded wait",
                        id
                    )));
                }
                tokio::time::sleep(SPILL_LEASE_POLL).await;
            }
        }

        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        // re-check under the lock; a lease cannot appear while we hold it
        if self.leases.has_active(&id) {
            return Err(Error::LeaseConflict(format!("payload {} is leased", id)));
        }

        let mut tx = self.repository.begin().await?;
        let mut record = tx
            .get_payload(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("payload {}", id)))?;
        tx.rollback().await?;

        if !record.state.is_readable() {
            return Err(Error::InvalidState(format!(
                "payload {} is {} and cannot spill",
                id, record.state
            )));
        }

        self.migrate_locked(&mut record, target_tier, fsync).await?;
        self.descriptor_for(&record)
    }

    /// The migration core. Caller holds the per-payload lock.
    ///
    /// Ordering: destination write, then repository commit, then source
    /// remove. Failure before the commit leaves the prior tier intact;
    /// failure after it leaves stale source bytes for the startup sweep.
    async fn migrate_locked(
        &self,
        record: &mut PayloadRecord,
        target: Tier,
        fsync: bool,
    ) -> Result<()> {
        if record.tier == target {
            return Ok(());
        }
        let source = record.tier;
        let src_backend = self.router.backend(source)?;
        let dst_backend = self.router.backend(target)?;

        let bytes = src_backend.read(&record.id).await?;
        dst_backend
            .write(&record.id, bytes.as_slice(), fsync || target.is_durable())
            .await?;
        drop(bytes);

        let commit_result = async {
            let mut tx = begin_with_retry(self.repository.as_ref()).await?;
            let stored = tx
                .get_payload(&record.id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("payload {}", record.id)))?;
            let mut updated = stored;
            updated.tier = target;
            updated.version += 1;
            let demands_durability = self
                .policies
                .get(&record.id)
                .map(|p| p.demands_durability())
                .unwrap_or(false);
            if target.is_durable() && demands_durability {
                updated.state = PayloadState::Durable;
            } else if !target.is_durable() && updated.state == PayloadState::Durable {
                updated.state = PayloadState::Active;
            }
            tx.update_payload(&updated).await?;
            tx.commit().await?;
            Ok::<PayloadRecord, Error>(updated)
        }
        .await;

        let updated = match commit_result {
            Ok(updated) => updated,
            Err(e) => {
                // the row still points at the source; drop the copy
                let _ = dst_backend.remove(&record.id).await;
                return Err(e);
            }
        };

        // source removal strictly after the commit
        if let Err(e) = src_backend.remove(&record.id).await {
            tracing::warn!(id = %record.id, %source, error = %e,
                "stale source bytes left behind, startup sweep will reclaim");
        }

        tracing::info!(id = %record.id, from = %source, to = %target,
            version = updated.version, "payload migrated");
        *record = updated;
        Ok(())
    }

    /// Delete a payload. Non-force fails on any active lease; force
    /// invalidates them first. Idempotent: deleting an absent id is Ok.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: PayloadId, force: bool) -> Result<()> {
        let lock = self.lock_for(&id);
        {
            let _guard = lock.lock().await;

            if !force && self.leases.has_active(&id) {
                return Err(Error::LeaseConflict(format!("payload {} is leased", id)));
            }
            if force {
                self.leases.invalidate_all(&id);
            }

            let mut tx = begin_with_retry(self.repository.as_ref()).await?;
            if tx.get_payload(&id).await?.is_some() {
                // bytes first; the row is the last thing to go
                for tier in self.router.residency(&id).await {
                    if let Ok(backend) = self.router.backend(tier) {
                        backend.remove(&id).await?;
                    }
                }
                tx.delete_payload(&id).await?;
                tx.commit().await?;
                tracing::info!(%id, force, "payload deleted");
            } else {
                tx.rollback().await?;
            }

            self.metadata_cache.remove(&id);
            self.lineage_index.remove_payload(&id);
            self.policies.remove(&id);
            self.access_log.lock().pop(&id);
        }
        // bound the lock map
        self.locks.remove(&id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Reload sizes and warm the metadata cache from the repository,
    /// then reclaim residency left on non-authoritative tiers by a crash
    /// mid-migration.
    pub async fn hydrate_caches(&self) -> Result<()> {
        let mut tx = self.repository.begin().await?;
        let records = tx.list_payloads().await?;
        tx.rollback().await?;

        for record in &records {
            if let Ok(backend) = self.router.backend(record.tier) {
                match backend.size(&record.id).await {
                    Ok(size) if size != record.size_bytes => {
                        let mut corrected = record.clone();
                        corrected.size_bytes = size;
                        corrected.version += 1;
                        let mut tx = begin_with_retry(self.repository.as_ref()).await?;
                        tx.update_payload(&corrected).await?;
                        tx.commit().await?;
                        tracing::warn!(id = %record.id, size, "size corrected from backend");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(id = %record.id, tier = %record.tier, error = %e,
                            "payload bytes missing from authoritative tier");
                    }
                }
            }

            let mut tx = self.repository.begin().await?;
            if let Some(meta) = tx.get_metadata(&record.id).await? {
                self.metadata_cache.put(meta);
            }
            tx.rollback().await?;

            self.touch(&record.id);
        }

        self.sweep_stale_residency(&records).await;
        tracing::info!(payloads = records.len(), "caches hydrated");
        Ok(())
    }

    /// Remove bytes from every tier other than the one the repository
    /// names. Safe because the repository commit is the migration
    /// linearization point: anything elsewhere is a leftover.
    async fn sweep_stale_residency(&self, records: &[PayloadRecord]) {
        for record in records {
            for tier in self.router.tiers() {
                if tier == record.tier {
                    continue;
                }
                let Ok(backend) = self.router.backend(tier) else {
                    continue;
                };
                if backend.exists(&record.id).await {
                    tracing::warn!(id = %record.id, stale = %tier, authoritative = %record.tier,
                        "reclaiming stale residency");
                    let _ = backend.remove(&record.id).await;
                }
            }
        }
    }

    /// Delete payloads whose TTL has passed. Leased payloads are left
    /// for a later tick. Returns the ids actually removed.
    pub async fn sweep_expired(&self) -> Result<Vec<PayloadId>> {
        let mut tx = self.repository.begin().await?;
        let records = tx.list_payloads().await?;
        tx.rollback().await?;

        let now = now_ms();
        let mut removed = Vec::new();
        for record in records {
            if !record.is_expired(now) {
                continue;
            }
            match self.delete(record.id, false).await {
                Ok(()) => removed.push(record.id),
                Err(Error::LeaseConflict(_)) => {
                    tracing::debug!(id = %record.id, "expired payload still leased");
                }
                Err(e) => {
                    tracing::warn!(id = %record.id, error = %e, "expired payload sweep failed");
                }
            }
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Metadata & lineage
    // ------------------------------------------------------------------

    /// Replace or merge the payload's metadata document.
    pub async fn update_metadata(
        &self,
        id: PayloadId,
        mode: MetadataUpdateMode,
        metadata: serde_json::Value,
        actor: Option<String>,
    ) -> Result<MetadataRecord> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        let mut tx = begin_with_retry(self.repository.as_ref()).await?;
        if tx.get_payload(&id).await?.is_none() {
            return Err(Error::NotFound(format!("payload {}", id)));
        }
        let current = tx.get_metadata(&id).await?;
        let json = match mode {
            MetadataUpdateMode::Replace => metadata,
            MetadataUpdateMode::Merge => match &current {
                Some(existing) => merge_metadata(&existing.json, &metadata),
                None => metadata,
            },
        };
        let record = MetadataRecord {
            id,
            json,
            schema: current.map(|c| c.schema).unwrap_or_default(),
            updated_at_ms: now_ms(),
        };
        tx.upsert_metadata(&record).await?;
        tx.commit().await?;

        self.metadata_cache.put(record.clone());
        tracing::debug!(%id, actor = actor.as_deref().unwrap_or("-"), "metadata updated");
        Ok(record)
    }

    /// Append to the payload's metadata history. Returns the event time.
    pub async fn append_metadata_event(
        &self,
        id: PayloadId,
        metadata: serde_json::Value,
        source: String,
        version: u64,
    ) -> Result<u64> {
        let mut tx = begin_with_retry(self.repository.as_ref()).await?;
        if tx.get_payload(&id).await?.is_none() {
            return Err(Error::NotFound(format!("payload {}", id)));
        }
        let event = MetadataEventRecord {
            payload_id: id,
            ts_ms: now_ms(),
            metadata,
            source,
            version,
        };
        tx.append_metadata_event(&event).await?;
        tx.commit().await?;
        Ok(event.ts_ms)
    }

    pub fn cached_metadata(&self, id: &PayloadId) -> Option<MetadataRecord> {
        self.metadata_cache.get(id)
    }

    /// Record lineage edges from each parent to `child`.
    pub async fn add_lineage(&self, child: PayloadId, parents: Vec<LineageParent>) -> Result<()> {
        if parents.is_empty() {
            return Err(Error::InvalidArgument("no parents given".to_string()));
        }
        let mut tx = begin_with_retry(self.repository.as_ref()).await?;
        if tx.get_payload(&child).await?.is_none() {
            return Err(Error::NotFound(format!("payload {}", child)));
        }
        let mut edges = Vec::with_capacity(parents.len());
        for parent in parents {
            let edge = LineageEdgeRecord {
                parent_id: parent.parent,
                child_id: child,
                operation: parent.operation,
                role: parent.role,
                parameters: parent.parameters,
                created_at_ms: now_ms(),
            };
            tx.insert_lineage(&edge).await?;
            edges.push(edge);
        }
        tx.commit().await?;

        for edge in &edges {
            self.lineage_index.record_edge(edge);
        }
        Ok(())
    }

    /// Walk the lineage graph from `id`. Cycle-safe; `max_depth == 0`
    /// means unbounded.
    pub async fn get_lineage(
        &self,
        id: PayloadId,
        upstream: bool,
        max_depth: u32,
    ) -> Result<Vec<LineageEdgeRecord>> {
        self.lineage_index
            .traverse(self.repository.as_ref(), id, upstream, max_depth)
            .await
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Occupancy census for the tiering policy.
    pub async fn census(&self) -> Result<Vec<CensusEntry>> {
        let mut tx = self.repository.begin().await?;
        let records = tx.list_payloads().await?;
        tx.rollback().await?;

        let mut access = self.access_log.lock();
        Ok(records
            .into_iter()
            .map(|record| CensusEntry {
                leased: self.leases.has_active(&record.id),
                last_access_ms: access.peek(&record.id).copied().unwrap_or(0),
                id: record.id,
                tier: record.tier,
                state: record.state,
                size_bytes: record.size_bytes,
            })
            .collect())
    }

    /// Per-tier payload counts and byte totals.
    pub async fn stats(&self) -> Result<TierStats> {
        let census = self.census().await?;
        let mut stats = TierStats::default();
        for entry in census {
            *stats.payloads.entry(entry.tier).or_default() += 1;
            *stats.bytes.entry(entry.tier).or_default() += entry.size_bytes;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use crate::storage::{DiskBackend, RamBackend, StorageBackend};
    use tempfile::TempDir;

    struct Fixture {
        manager: Arc<PayloadManager>,
        ram: Arc<RamBackend>,
        disk: Arc<DiskBackend>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
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
        Fixture {
            manager,
            ram,
            disk,
            _dir: dir,
        }
    }

    async fn allocate_and_fill(f: &Fixture, data: &[u8]) -> PayloadId {
        let descriptor = f
            .manager
            .allocate(data.len() as u64, Tier::Ram, None, None)
            .await
            .unwrap();
        f.ram
            .region(&descriptor.id)
            .unwrap()
            .write_at(0, data)
            .unwrap();
        descriptor.id
    }

    #[tokio::test]
    async fn test_lifecycle_versions_are_monotone() {
        let f = fixture();
        let id = allocate_and_fill(&f, b"abcd").await;

        let allocated = f.manager.resolve_snapshot(id).await.unwrap();
        assert_eq!(allocated.version, 1);
        assert_eq!(allocated.state, PayloadState::Allocated);

        let committed = f.manager.commit(id).await.unwrap();
        assert_eq!(committed.version, 2);
        assert_eq!(committed.state, PayloadState::Active);

        let promoted = f.manager.promote(id, Tier::Disk).await.unwrap();
        assert_eq!(promoted.version, 3);

        f.manager.delete(id, false).await.unwrap();
        assert!(matches!(
            f.manager.resolve_snapshot(id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_twice_is_invalid_state() {
        let f = fixture();
        let id = allocate_and_fill(&f, b"x").await;
        f.manager.commit(id).await.unwrap();
        assert!(matches!(
            f.manager.commit(id).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_lease_blocks_non_force_delete() {
        let f = fixture();
        let data: Vec<u8> = (0..64).map(|i| (i & 0xFF) as u8).collect();
        let id = allocate_and_fill(&f, &data).await;
        f.manager.commit(id).await.unwrap();

        let lease = f
            .manager
            .acquire_read_lease(id, Tier::Ram, PromotionPolicy::OnDemand, 10_000)
            .await
            .unwrap();
        assert_eq!(lease.descriptor.size_bytes, 64);

        let err = f.manager.delete(id, false).await.unwrap_err();
        assert!(matches!(err, Error::LeaseConflict(_)));

        f.manager.release_lease(&lease.lease_id);
        f.manager.delete(id, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_force_delete_overrides_leases() {
        let f = fixture();
        let id = allocate_and_fill(&f, b"pinned").await;
        f.manager.commit(id).await.unwrap();
        let _lease = f
            .manager
            .acquire_read_lease(id, Tier::Ram, PromotionPolicy::OnDemand, 60_000)
            .await
            .unwrap();

        f.manager.delete(id, true).await.unwrap();
        // idempotent second force delete
        f.manager.delete(id, true).await.unwrap();
        assert!(!f.manager.leases().has_active(&id));
    }

    #[tokio::test]
    async fn test_promote_preserves_bytes_and_clears_source() {
        let f = fixture();
        let data: Vec<u8> = (0..128).map(|i| (i & 0xFF) as u8).collect();
        let id = allocate_and_fill(&f, &data).await;
        f.manager.commit(id).await.unwrap();

        let descriptor = f.manager.promote(id, Tier::Disk).await.unwrap();
        assert_eq!(descriptor.tier, Tier::Disk);
        assert_eq!(descriptor.version, 3);

        assert!(!f.ram.exists(&id).await);
        assert_eq!(f.disk.read(&id).await.unwrap().as_slice(), data.as_slice());

        // promoting to the current tier is a no-op, no version bump
        let again = f.manager.promote(id, Tier::Disk).await.unwrap();
        assert_eq!(again.version, 3);
    }

    #[tokio::test]
    async fn test_lease_promotes_below_min_tier() {
        let f = fixture();
        let data = b"spilled".to_vec();
        let id = allocate_and_fill(&f, &data).await;
        f.manager.commit(id).await.unwrap();
        f.manager.promote(id, Tier::Disk).await.unwrap();

        let lease = f
            .manager
            .acquire_read_lease(id, Tier::Ram, PromotionPolicy::OnDemand, 5_000)
            .await
            .unwrap();
        assert_eq!(lease.descriptor.tier, Tier::Ram);
        assert_eq!(f.ram.read(&id).await.unwrap().as_slice(), data.as_slice());
        assert!(!f.disk.exists(&id).await);
    }

    #[tokio::test]
    async fn test_pinned_promotion_policy_fails_instead_of_moving() {
        let f = fixture();
        let id = allocate_and_fill(&f, b"stay").await;
        f.manager.commit(id).await.unwrap();
        f.manager.promote(id, Tier::Disk).await.unwrap();

        let err = f
            .manager
            .acquire_read_lease(id, Tier::Ram, PromotionPolicy::Pinned, 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(f.disk.exists(&id).await);
    }

    #[tokio::test]
    async fn test_spill_conflicts_with_lease() {
        let f = fixture();
        let id = allocate_and_fill(&f, b"busy").await;
        f.manager.commit(id).await.unwrap();
        let lease = f
            .manager
            .acquire_read_lease(id, Tier::Ram, PromotionPolicy::OnDemand, 60_000)
            .await
            .unwrap();

        let err = f
            .manager
            .execute_spill(id, Tier::Disk, true, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeaseConflict(_)));

        f.manager.release_lease(&lease.lease_id);
        let descriptor = f
            .manager
            .execute_spill(id, Tier::Disk, true, false)
            .await
            .unwrap();
        assert_eq!(descriptor.tier, Tier::Disk);
    }

    #[tokio::test]
    async fn test_spill_waits_out_leases() {
        let f = fixture();
        let id = allocate_and_fill(&f, b"drain").await;
        f.manager.commit(id).await.unwrap();
        let lease = f
            .manager
            .acquire_read_lease(id, Tier::Ram, PromotionPolicy::OnDemand, 1_000)
            .await
            .unwrap();

        let manager = f.manager.clone();
        let release_handle = tokio::spawn({
            let lease_id = lease.lease_id.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                manager.release_lease(&lease_id);
            }
        });

        let descriptor = f
            .manager
            .execute_spill(id, Tier::Disk, false, true)
            .await
            .unwrap();
        assert_eq!(descriptor.tier, Tier::Disk);
        release_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_ops_on_distinct_ids_make_progress() {
        let f = fixture();
        let a = allocate_and_fill(&f, b"aaaa").await;
        let b = allocate_and_fill(&f, b"bbbb").await;

        let (ra, rb) = tokio::join!(f.manager.commit(a), f.manager.commit(b));
        assert!(ra.is_ok());
        assert!(rb.is_ok());
    }

    #[tokio::test]
    async fn test_metadata_replace_and_merge() {
        let f = fixture();
        let id = allocate_and_fill(&f, b"m").await;
        f.manager.commit(id).await.unwrap();

        f.manager
            .update_metadata(
                id,
                MetadataUpdateMode::Replace,
                serde_json::json!({"a": 1}),
                None,
            )
            .await
            .unwrap();
        let merged = f
            .manager
            .update_metadata(
                id,
                MetadataUpdateMode::Merge,
                serde_json::json!({"b": 2}),
                Some("tester".into()),
            )
            .await
            .unwrap();
        assert_eq!(merged.json["a"], 1);
        assert_eq!(merged.json["b"], 2);
        assert_eq!(f.manager.cached_metadata(&id).unwrap().json["b"], 2);

        let ts = f
            .manager
            .append_metadata_event(id, serde_json::json!({"b": 2}), "tester".into(), 1)
            .await
            .unwrap();
        assert!(ts > 0);
    }

    #[tokio::test]
    async fn test_lineage_round_trip() {
        let f = fixture();
        let parent = allocate_and_fill(&f, b"p").await;
        let child = allocate_and_fill(&f, b"c").await;
        f.manager.commit(parent).await.unwrap();
        f.manager.commit(child).await.unwrap();

        f.manager
            .add_lineage(
                child,
                vec![LineageParent {
                    parent,
                    operation: "resample".into(),
                    role: "input".into(),
                    parameters: "{}".into(),
                }],
            )
            .await
            .unwrap();

        let upstream = f.manager.get_lineage(child, true, 0).await.unwrap();
        assert_eq!(upstream.len(), 1);
        assert_eq!(upstream[0].parent_id, parent);

        let downstream = f.manager.get_lineage(parent, false, 0).await.unwrap();
        assert_eq!(downstream.len(), 1);
    }

    #[tokio::test]
    async fn test_hydrate_sweeps_stale_residency() {
        let f = fixture();
        let data = b"redundant".to_vec();
        let id = allocate_and_fill(&f, &data).await;
        f.manager.commit(id).await.unwrap();
        f.manager.promote(id, Tier::Disk).await.unwrap();

        // simulate a crash that left bytes behind on the source tier
        f.ram.write(&id, &data, false).await.unwrap();
        assert!(f.ram.exists(&id).await);

        f.manager.hydrate_caches().await.unwrap();
        assert!(!f.ram.exists(&id).await);
        assert!(f.disk.exists(&id).await);

        // the payload stayed readable throughout
        let descriptor = f.manager.resolve_snapshot(id).await.unwrap();
        assert_eq!(descriptor.tier, Tier::Disk);
    }

    #[tokio::test]
    async fn test_ttl_sweep_removes_expired() {
        let f = fixture();
        let expired = f
            .manager
            .allocate(4, Tier::Ram, Some(0), None)
            .await
            .unwrap();
        let kept = f.manager.allocate(4, Tier::Ram, None, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = f.manager.sweep_expired().await.unwrap();
        assert_eq!(removed, vec![expired.id]);
        assert!(f.manager.resolve_snapshot(kept.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_durable_policy_marks_state() {
        let f = fixture();
        let descriptor = f
            .manager
            .allocate(4, Tier::Ram, None, Some(EvictionPolicy::RequireDurable))
            .await
            .unwrap();
        let id = descriptor.id;
        f.ram.region(&id).unwrap().write_at(0, b"dddd").unwrap();
        f.manager.commit(id).await.unwrap();

        let spilled = f.manager.promote(id, Tier::Disk).await.unwrap();
        assert_eq!(spilled.state, PayloadState::Durable);

        // returning to ram reverts the advisory state
        let back = f.manager.promote(id, Tier::Ram).await.unwrap();
        assert_eq!(back.state, PayloadState::Active);
    }

    #[tokio::test]
    async fn test_stats_counts_by_tier() {
        let f = fixture();
        let a = allocate_and_fill(&f, b"1234").await;
        let b = allocate_and_fill(&f, b"5678").await;
        f.manager.commit(a).await.unwrap();
        f.manager.commit(b).await.unwrap();
        f.manager.promote(b, Tier::Disk).await.unwrap();

        let stats = f.manager.stats().await.unwrap();
        assert_eq!(stats.payloads.get(&Tier::Ram), Some(&1));
        assert_eq!(stats.payloads.get(&Tier::Disk), Some(&1));
        assert_eq!(stats.bytes.get(&Tier::Ram), Some(&4));
    }
}
