//! Admin service: node-level introspection.

use serde::{Deserialize, Serialize};

use crate::core::{Result, Tier};

use super::ServiceContext;

/// Per-tier occupancy summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsResponse {
    pub payloads_gpu: u64,
    pub payloads_ram: u64,
    pub payloads_disk: u64,
    pub payloads_object: u64,
    pub bytes_gpu: u64,
    pub bytes_ram: u64,
    pub bytes_disk: u64,
    pub bytes_object: u64,
    pub active_leases: u64,
}

/// Node introspection surface.
#[derive(Clone)]
pub struct AdminService {
    ctx: ServiceContext,
}

impl AdminService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub async fn stats(&self) -> Result<StatsResponse> {
        let stats = self.ctx.manager.stats().await?;
        let count = |tier: Tier| stats.payloads.get(&tier).copied().unwrap_or(0);
        let bytes = |tier: Tier| stats.bytes.get(&tier).copied().unwrap_or(0);
        Ok(StatsResponse {
            payloads_gpu: count(Tier::Gpu),
            payloads_ram: count(Tier::Ram),
            payloads_disk: count(Tier::Disk),
            payloads_object: count(Tier::Object),
            bytes_gpu: bytes(Tier::Gpu),
            bytes_ram: bytes(Tier::Ram),
            bytes_disk: bytes(Tier::Disk),
            bytes_object: bytes(Tier::Object),
            active_leases: self.ctx.manager.leases().active_count() as u64,
        })
    }
}
