//! # Lease System
//!
//! Leases fence reads against concurrent migration and deletion. While a
//! payload has any active, unexpired lease its placement must not change
//! and it must not be deleted except under force. The table indexes
//! leases by lease id and by payload id; expired rows are treated as
//! inactive immediately and purged opportunistically on any access.
//!
//! Lease ids carry 128 bits of OS entropy and are unguessable.

use parking_lot::Mutex;
use rand::RngCore;
use std::collections::{HashMap, HashSet};

use crate::core::{now_ms, PayloadDescriptor, PayloadId};

/// A time-bounded placement pin with a stable descriptor snapshot.
#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: String,
    pub payload_id: PayloadId,
    /// Descriptor as of acquisition; stable for the lease lifetime.
    pub descriptor: PayloadDescriptor,
    pub expires_at_ms: u64,
}

impl Lease {
    pub fn is_active(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }
}

#[derive(Debug, Default)]
struct TableInner {
    by_lease: HashMap<String, Lease>,
    by_payload: HashMap<PayloadId, HashSet<String>>,
}

impl TableInner {
    /// Drop every expired row. Cheap enough to run on each access.
    fn purge_expired(&mut self, now_ms: u64) {
        let expired: Vec<String> = self
            .by_lease
            .values()
            .filter(|l| !l.is_active(now_ms))
            .map(|l| l.lease_id.clone())
            .collect();
        for lease_id in expired {
            self.remove(&lease_id);
        }
    }

    fn remove(&mut self, lease_id: &str) -> Option<Lease> {
        let lease = self.by_lease.remove(lease_id)?;
        if let Some(set) = self.by_payload.get_mut(&lease.payload_id) {
            set.remove(lease_id);
            if set.is_empty() {
                self.by_payload.remove(&lease.payload_id);
            }
        }
        Some(lease)
    }
}

/// In-memory lease index. All critical sections are short.
#[derive(Debug, Default)]
pub struct LeaseTable {
    inner: Mutex<TableInner>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, lease: Lease) {
        let mut inner = self.inner.lock();
        inner.purge_expired(now_ms());
        inner
            .by_payload
            .entry(lease.payload_id)
            .or_default()
            .insert(lease.lease_id.clone());
        inner.by_lease.insert(lease.lease_id.clone(), lease);
    }

    /// Remove by lease id. Missing ids are fine; release is best-effort.
    pub fn remove(&self, lease_id: &str) -> Option<Lease> {
        self.inner.lock().remove(lease_id)
    }

    /// Whether any unexpired lease pins `id`.
    pub fn has_active(&self, id: &PayloadId) -> bool {
        let mut inner = self.inner.lock();
        let now = now_ms();
        inner.purge_expired(now);
        inner
            .by_payload
            .get(id)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    /// Invalidate every lease for `id` (the force-delete path).
    pub fn remove_all(&self, id: &PayloadId) {
        let mut inner = self.inner.lock();
        if let Some(set) = inner.by_payload.remove(id) {
            for lease_id in set {
                inner.by_lease.remove(&lease_id);
            }
        }
    }

    pub fn get(&self, lease_id: &str) -> Option<Lease> {
        self.inner.lock().by_lease.get(lease_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.purge_expired(now_ms());
        inner.by_lease.len()
    }
}

/// Issues leases and owns the duration policy.
pub struct LeaseManager {
    table: LeaseTable,
    default_ms: u64,
    max_ms: u64,
}

impl LeaseManager {
    pub fn new(default_ms: u64, max_ms: u64) -> Self {
        Self {
            table: LeaseTable::new(),
            default_ms,
            max_ms: max_ms.max(default_ms),
        }
    }

    /// Register a lease over `descriptor`. The granted duration is at
    /// least the configured default and at most the configured maximum.
    pub fn acquire(&self, descriptor: PayloadDescriptor, min_duration_ms: u64) -> Lease {
        let duration = min_duration_ms.max(self.default_ms).min(self.max_ms);
        let lease = Lease {
            lease_id: Self::generate_lease_id(),
            payload_id: descriptor.id,
            descriptor,
            expires_at_ms: now_ms() + duration,
        };
        self.table.insert(lease.clone());
        lease
    }

    /// Best-effort release; unknown ids are not an error.
    pub fn release(&self, lease_id: &str) {
        if self.table.remove(lease_id).is_some() {
            tracing::debug!(lease_id, "lease released");
        }
    }

    pub fn has_active(&self, id: &PayloadId) -> bool {
        self.table.has_active(id)
    }

    pub fn invalidate_all(&self, id: &PayloadId) {
        self.table.remove_all(id);
    }

    pub fn active_count(&self) -> usize {
        self.table.active_count()
    }

    /// 128 bits of OS entropy, hex encoded.
    fn generate_lease_id() -> String {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Location, PayloadState, Tier};

    fn descriptor(id: PayloadId) -> PayloadDescriptor {
        PayloadDescriptor {
            id,
            tier: Tier::Ram,
            state: PayloadState::Active,
            size_bytes: 8,
            version: 2,
            expires_at_ms: None,
            location: Location::Ram {
                shm_name: "stratum_test".into(),
                length: 8,
            },
            eviction_policy: None,
        }
    }

    #[test]
    fn test_acquire_pins_payload() {
        let manager = LeaseManager::new(1000, 10_000);
        let id = PayloadId::generate();

        let lease = manager.acquire(descriptor(id), 0);
        assert!(manager.has_active(&id));
        assert_eq!(lease.lease_id.len(), 32);

        manager.release(&lease.lease_id);
        assert!(!manager.has_active(&id));
    }

    #[test]
    fn test_release_unknown_is_fine() {
        let manager = LeaseManager::new(1000, 10_000);
        manager.release("deadbeefdeadbeefdeadbeefdeadbeef");
    }

    #[test]
    fn test_duration_clamped_between_default_and_max() {
        let manager = LeaseManager::new(1000, 2000);
        let id = PayloadId::generate();
        let now = now_ms();

        let short = manager.acquire(descriptor(id), 10);
        assert!(short.expires_at_ms >= now + 1000);

        let long = manager.acquire(descriptor(id), 60_000);
        assert!(long.expires_at_ms <= now_ms() + 2000);
    }

    #[test]
    fn test_expired_leases_are_inactive() {
        let table = LeaseTable::new();
        let id = PayloadId::generate();
        table.insert(Lease {
            lease_id: "aa".repeat(16),
            payload_id: id,
            descriptor: descriptor(id),
            // already expired
            expires_at_ms: 1,
        });
        assert!(!table.has_active(&id));
        assert_eq!(table.active_count(), 0);
    }

    #[test]
    fn test_remove_all_invalidates_every_lease() {
        let manager = LeaseManager::new(1000, 10_000);
        let id = PayloadId::generate();
        let a = manager.acquire(descriptor(id), 0);
        let b = manager.acquire(descriptor(id), 0);
        assert_ne!(a.lease_id, b.lease_id);

        manager.invalidate_all(&id);
        assert!(!manager.has_active(&id));
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_lease_ids_are_unique() {
        let manager = LeaseManager::new(1000, 10_000);
        let id = PayloadId::generate();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            assert!(seen.insert(manager.acquire(descriptor(id), 0).lease_id));
        }
    }
}
