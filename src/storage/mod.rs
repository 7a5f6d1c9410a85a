//! # Tier Storage Backends
//!
//! Uniform byte-store interface over heterogeneous media:
//! - Ram: POSIX shared-memory objects, mappable by external readers
//! - Disk: one file per payload, atomic tmp+rename writes, mmap reads
//! - Gpu: device buffers behind a process-singleton device context
//! - Object: stateless wrapper over a remote HTTP object endpoint
//!
//! Backends store bytes only; tier and state bookkeeping live in the
//! repository. Invariants every backend upholds:
//! - `read` after `write(id, b)` returns exactly `b`
//! - `read` after `remove` fails with `NotFound`
//! - `remove` is idempotent
//!
//! Only writable tiers (Ram, Gpu) support `allocate`; Disk and Object
//! return `Unsupported`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use crate::core::{Error, Location, PayloadId, Result, Tier};

pub mod disk;
pub mod gpu;
pub mod object;
pub mod ram;

pub use disk::DiskBackend;
pub use gpu::{GpuBackend, GpuContext};
pub use object::ObjectBackend;
pub use ram::{RamBackend, ShmRegion};

/// Read view of payload bytes. Variants keep their zero-copy source
/// mapping alive for as long as the buffer is held.
pub enum Buffer {
    /// Plain heap bytes (object downloads, device readbacks).
    Owned(Vec<u8>),
    /// Shared-memory region, alive while any reader holds it.
    Shared(Arc<ShmRegion>),
    /// Read-only file mapping.
    Mapped(Arc<memmap2::Mmap>),
}

impl Buffer {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Buffer::Owned(v) => v.as_slice(),
            Buffer::Shared(region) => region.as_slice(),
            Buffer::Mapped(map) => map,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Buffer::Owned(_) => "owned",
            Buffer::Shared(_) => "shared",
            Buffer::Mapped(_) => "mapped",
        };
        f.debug_struct("Buffer")
            .field("kind", &kind)
            .field("len", &self.len())
            .finish()
    }
}

/// Per-tier byte store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create a writable region of exactly `size_bytes` under `id` and
    /// return its placement. Producers fill the region through the
    /// placement (shared-memory name, device handle) before commit.
    /// Writable tiers only; others return `Unsupported`.
    async fn allocate(&self, id: &PayloadId, size_bytes: u64) -> Result<Location>;

    /// Read the full payload. Implementations use mmap or shared
    /// mappings where the medium allows.
    async fn read(&self, id: &PayloadId) -> Result<Buffer>;

    /// Length in bytes without materializing the contents. The default
    /// falls back to `read`; tiers with cheap metadata lookups override.
    async fn size(&self, id: &PayloadId) -> Result<u64> {
        Ok(self.read(id).await?.len() as u64)
    }

    /// Persist `data` under `id`, replacing any previous residency.
    /// `fsync` is honored where the medium distinguishes it.
    async fn write(&self, id: &PayloadId, data: &[u8], fsync: bool) -> Result<()>;

    /// Drop residency. Idempotent; absent ids are not an error.
    async fn remove(&self, id: &PayloadId) -> Result<()>;

    /// Whether bytes for `id` currently reside in this tier.
    async fn exists(&self, id: &PayloadId) -> bool {
        self.size(id).await.is_ok()
    }

    /// Placement descriptor for a payload of `length` bytes in this tier.
    fn location(&self, id: &PayloadId, length: u64) -> Location;

    fn tier_type(&self) -> Tier;
}

/// Dispatches storage calls to the backend configured for each tier.
pub struct TierRouter {
    backends: HashMap<Tier, Arc<dyn StorageBackend>>,
}

impl TierRouter {
    pub fn new(backends: Vec<Arc<dyn StorageBackend>>) -> Self {
        let backends = backends
            .into_iter()
            .map(|b| (b.tier_type(), b))
            .collect();
        Self { backends }
    }

    /// Backend for `tier`, or `Unsupported` when the tier is not
    /// configured on this node.
    pub fn backend(&self, tier: Tier) -> Result<&Arc<dyn StorageBackend>> {
        self.backends
            .get(&tier)
            .ok_or_else(|| Error::Unsupported(format!("tier {} is not configured", tier)))
    }

    pub fn has_tier(&self, tier: Tier) -> bool {
        self.backends.contains_key(&tier)
    }

    /// Configured tiers, fastest first.
    pub fn tiers(&self) -> Vec<Tier> {
        let mut tiers: Vec<Tier> = self.backends.keys().copied().collect();
        tiers.sort();
        tiers
    }

    /// Every tier currently holding bytes for `id`.
    pub async fn residency(&self, id: &PayloadId) -> Vec<Tier> {
        let mut resident = Vec::new();
        for tier in self.tiers() {
            if let Some(backend) = self.backends.get(&tier) {
                if backend.exists(id).await {
                    resident.push(tier);
                }
            }
        }
        resident
    }

    /// Pick the allocation tier: the preference when it allocates and is
    /// configured, otherwise Ram.
    pub fn allocation_tier(&self, preferred: Tier) -> Result<Tier> {
        if preferred.supports_allocation() && self.has_tier(preferred) {
            return Ok(preferred);
        }
        if self.has_tier(Tier::Ram) {
            return Ok(Tier::Ram);
        }
        Err(Error::Unsupported(
            "no allocation-capable tier configured".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn router_with_ram_and_disk(dir: &TempDir) -> TierRouter {
        let ram = Arc::new(RamBackend::new(1024 * 1024));
        let disk = Arc::new(DiskBackend::new(dir.path()).unwrap());
        TierRouter::new(vec![ram, disk])
    }

    #[test]
    fn test_allocation_tier_prefers_writable_request() {
        let dir = TempDir::new().unwrap();
        let router = router_with_ram_and_disk(&dir);
        assert_eq!(router.allocation_tier(Tier::Ram).unwrap(), Tier::Ram);
        // disk cannot allocate, falls back to ram
        assert_eq!(router.allocation_tier(Tier::Disk).unwrap(), Tier::Ram);
        // gpu not configured, falls back to ram
        assert_eq!(router.allocation_tier(Tier::Gpu).unwrap(), Tier::Ram);
    }

    #[test]
    fn test_unconfigured_tier_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let router = router_with_ram_and_disk(&dir);
        assert!(matches!(
            router.backend(Tier::Object),
            Err(Error::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_residency_tracks_writes() {
        let dir = TempDir::new().unwrap();
        let router = router_with_ram_and_disk(&dir);
        let id = PayloadId::generate();

        assert!(router.residency(&id).await.is_empty());

        router
            .backend(Tier::Disk)
            .unwrap()
            .write(&id, b"abc", false)
            .await
            .unwrap();
        assert_eq!(router.residency(&id).await, vec![Tier::Disk]);
    }
}
