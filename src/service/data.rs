//! Data service: the consumer read path.

use serde::{Deserialize, Serialize};

use crate::core::{PayloadDescriptor, PayloadId, PromotionPolicy, Result, Tier};

use super::ServiceContext;

/// Read-lease request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireLeaseRequest {
    pub id: PayloadId,
    #[serde(default = "default_min_tier")]
    pub min_tier: Tier,
    #[serde(default)]
    pub promotion_policy: PromotionPolicy,
    #[serde(default)]
    pub min_lease_duration_ms: u64,
}

fn default_min_tier() -> Tier {
    Tier::Object
}

/// Read-lease grant: a stable descriptor plus the pin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireLeaseResponse {
    pub descriptor: PayloadDescriptor,
    pub lease_id: String,
    pub expires_at_ms: u64,
}

/// Consumer-facing resolve/lease/release surface.
#[derive(Clone)]
pub struct DataService {
    ctx: ServiceContext,
}

impl DataService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Advisory placement snapshot; may be stale the moment it returns.
    pub async fn resolve_snapshot(&self, id: PayloadId) -> Result<PayloadDescriptor> {
        self.ctx.manager.resolve_snapshot(id).await
    }

    /// Placement-stable read lease, promoting first if needed.
    pub async fn acquire_read_lease(
        &self,
        request: AcquireLeaseRequest,
    ) -> Result<AcquireLeaseResponse> {
        let lease = self
            .ctx
            .manager
            .acquire_read_lease(
                request.id,
                request.min_tier,
                request.promotion_policy,
                request.min_lease_duration_ms,
            )
            .await?;
        Ok(AcquireLeaseResponse {
            descriptor: lease.descriptor,
            lease_id: lease.lease_id,
            expires_at_ms: lease.expires_at_ms,
        })
    }

    /// Best-effort release; unknown ids are not an error.
    pub fn release_lease(&self, lease_id: &str) {
        self.ctx.manager.release_lease(lease_id);
    }
}
