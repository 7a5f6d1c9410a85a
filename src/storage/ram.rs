//! RAM tier backend.
//!
//! Every payload is a named POSIX shared-memory object, so external
//! readers can map it directly from the name carried in the placement
//! descriptor. The id-to-region map sits behind a read-write lock;
//! readers take a shared hold and keep the region alive through an `Arc`
//! even across a concurrent `remove`, which is what lets leases outlive
//! eviction races.

use async_trait::async_trait;
use parking_lot::RwLock;
use shared_memory::{Shmem, ShmemConf};
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{Error, Location, PayloadId, Result, Tier};

use super::{Buffer, StorageBackend};

/// A named shared-memory region.
///
/// The producer owns the only writable window between `allocate` and
/// commit; after commit the contents are immutable by contract, so the
/// raw-pointer accessors below stay sound.
pub struct ShmRegion {
    shmem: Shmem,
    name: String,
    len: usize,
}

// The OS mapping handle is safe to move and share; content races are
// excluded by the allocate-fill-commit protocol.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create a fresh zero-filled region of `len` bytes.
    fn create(name: &str, len: usize) -> Result<Self> {
        let shmem = ShmemConf::new()
            .size(len.max(1))
            .os_id(name)
            .create()
            .map_err(|e| Error::Io(format!("shm create {}: {}", name, e)))?;
        // zero-fill so freshly allocated payloads read deterministically
        unsafe {
            std::ptr::write_bytes(shmem.as_ptr(), 0, len);
        }
        Ok(Self {
            shmem,
            name: name.to_string(),
            len,
        })
    }

    /// Shared-memory object name external readers map by.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.shmem.as_ptr(), self.len) }
    }

    /// Write `data` at `offset`. Producer-side fill path.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .ok_or_else(|| Error::InvalidArgument("write range overflow".to_string()))?;
        if end > self.len {
            return Err(Error::InvalidArgument(format!(
                "write of {} bytes at {} exceeds region of {}",
                data.len(),
                offset,
                self.len
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.shmem.as_ptr().add(offset), data.len());
        }
        Ok(())
    }
}

impl std::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish()
    }
}

/// In-memory tier backend over named shared-memory regions.
pub struct RamBackend {
    regions: RwLock<HashMap<PayloadId, Arc<ShmRegion>>>,
    capacity_bytes: u64,
}

impl RamBackend {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            regions: RwLock::new(HashMap::new()),
            capacity_bytes,
        }
    }

    fn shm_name(id: &PayloadId) -> String {
        format!("stratum_{}", id.canonical().replace('-', ""))
    }

    fn used_bytes(&self) -> u64 {
        self.regions
            .read()
            .values()
            .map(|r| r.len() as u64)
            .sum()
    }

    /// Direct handle to a resident region. In-process producers use this
    /// to fill a freshly allocated payload.
    pub fn region(&self, id: &PayloadId) -> Result<Arc<ShmRegion>> {
        self.regions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("ram payload {}", id)))
    }

    fn insert_region(&self, id: &PayloadId, size: usize) -> Result<Arc<ShmRegion>> {
        if self.used_bytes() + size as u64 > self.capacity_bytes {
            return Err(Error::ResourceExhausted(format!(
                "ram tier full: {} + {} exceeds {}",
                self.used_bytes(),
                size,
                self.capacity_bytes
            )));
        }
        let region = Arc::new(ShmRegion::create(&Self::shm_name(id), size)?);
        self.regions.write().insert(*id, region.clone());
        Ok(region)
    }
}

#[async_trait]
impl StorageBackend for RamBackend {
    async fn allocate(&self, id: &PayloadId, size_bytes: u64) -> Result<Location> {
        let size = usize::try_from(size_bytes)
            .map_err(|_| Error::InvalidArgument(format!("size {} too large", size_bytes)))?;
        let region = self.insert_region(id, size)?;
        Ok(Location::Ram {
            shm_name: region.name().to_string(),
            length: size_bytes,
        })
    }

    async fn read(&self, id: &PayloadId) -> Result<Buffer> {
        Ok(Buffer::Shared(self.region(id)?))
    }

    async fn size(&self, id: &PayloadId) -> Result<u64> {
        Ok(self.region(id)?.len() as u64)
    }

    async fn write(&self, id: &PayloadId, data: &[u8], _fsync: bool) -> Result<()> {
        // copy into a fresh region and swap; readers holding the old
        // region keep a consistent view
        self.regions.write().remove(id);
        let region = self.insert_region(id, data.len())?;
        region.write_at(0, data)?;
        Ok(())
    }

    async fn remove(&self, id: &PayloadId) -> Result<()> {
        self.regions.write().remove(id);
        Ok(())
    }

    fn location(&self, id: &PayloadId, length: u64) -> Location {
        Location::Ram {
            shm_name: Self::shm_name(id),
            length,
        }
    }

    fn tier_type(&self) -> Tier {
        Tier::Ram
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_fill_read_round_trip() {
        let backend = RamBackend::new(1024);
        let id = PayloadId::generate();

        let location = backend.allocate(&id, 64).await.unwrap();
        assert!(matches!(location, Location::Ram { length: 64, .. }));

        let data: Vec<u8> = (0..64).map(|i| (i & 0xFF) as u8).collect();
        backend.region(&id).unwrap().write_at(0, &data).unwrap();

        let buffer = backend.read(&id).await.unwrap();
        assert_eq!(buffer.as_slice(), data.as_slice());
        assert_eq!(backend.size(&id).await.unwrap(), 64);
    }

    #[tokio::test]
    async fn test_write_then_read_matches() {
        let backend = RamBackend::new(1024);
        let id = PayloadId::generate();
        backend.write(&id, b"hello tier", false).await.unwrap();
        assert_eq!(backend.read(&id).await.unwrap().as_slice(), b"hello tier");
    }

    #[tokio::test]
    async fn test_read_after_remove_is_not_found() {
        let backend = RamBackend::new(1024);
        let id = PayloadId::generate();
        backend.write(&id, b"x", false).await.unwrap();
        backend.remove(&id).await.unwrap();
        assert!(matches!(
            backend.read(&id).await,
            Err(Error::NotFound(_))
        ));
        // idempotent
        backend.remove(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_survives_remove() {
        let backend = RamBackend::new(1024);
        let id = PayloadId::generate();
        backend.write(&id, b"pinned", false).await.unwrap();

        let held = backend.read(&id).await.unwrap();
        backend.remove(&id).await.unwrap();
        // the Arc keeps the mapping alive for the holder
        assert_eq!(held.as_slice(), b"pinned");
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let backend = RamBackend::new(100);
        let id = PayloadId::generate();
        let err = backend.allocate(&id, 200).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_region_bounds_checked() {
        let backend = RamBackend::new(1024);
        let id = PayloadId::generate();
        backend.allocate(&id, 8).await.unwrap();
        let region = backend.region(&id).unwrap();
        assert!(region.write_at(4, &[0; 8]).is_err());
        assert!(region.write_at(0, &[1; 8]).is_ok());
    }
}
