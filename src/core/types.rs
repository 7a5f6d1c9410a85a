//! Shared domain types: tiers, lifecycle states, placement descriptors,
//! and the advisory policies carried alongside them.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{Error, Result};
use super::id::PayloadId;

/// Storage tier, ordered fastest first. Lower ordinal = faster and
/// costlier medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Gpu = 0,
    Ram = 1,
    Disk = 2,
    Object = 3,
}

impl Tier {
    /// All tiers, fastest first.
    pub const ALL: [Tier; 4] = [Tier::Gpu, Tier::Ram, Tier::Disk, Tier::Object];

    /// Whether producers can allocate writable regions in this tier.
    pub fn supports_allocation(&self) -> bool {
        matches!(self, Tier::Gpu | Tier::Ram)
    }

    /// Whether bytes in this tier survive a process restart.
    pub fn is_durable(&self) -> bool {
        matches!(self, Tier::Disk | Tier::Object)
    }

    /// The next slower tier, if any. Spill targets come from here.
    pub fn next_slower(&self) -> Option<Tier> {
        match self {
            Tier::Gpu => Some(Tier::Ram),
            Tier::Ram => Some(Tier::Disk),
            Tier::Disk => Some(Tier::Object),
            Tier::Object => None,
        }
    }

    /// True when `self` is strictly slower than `other`.
    pub fn slower_than(&self, other: Tier) -> bool {
        (*self as u8) > (other as u8)
    }

    pub fn from_ordinal(v: u8) -> Result<Tier> {
        match v {
            0 => Ok(Tier::Gpu),
            1 => Ok(Tier::Ram),
            2 => Ok(Tier::Disk),
            3 => Ok(Tier::Object),
            other => Err(Error::InvalidArgument(format!("unknown tier ordinal {}", other))),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Gpu => "gpu",
            Tier::Ram => "ram",
            Tier::Disk => "disk",
            Tier::Object => "object",
        };
        write!(f, "{}", name)
    }
}

/// Payload lifecycle state.
///
/// `Allocated -> Active -> (Durable)`, with `Deleted` terminal. Tier
/// changes preserve `Active`; `Durable` is advisory for readers and only
/// set when the payload sits on a durable tier and its policy demands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadState {
    Allocated = 0,
    Active = 1,
    Durable = 2,
    Deleted = 3,
}

impl PayloadState {
    /// Whether readers may take leases in this state.
    pub fn is_readable(&self) -> bool {
        matches!(self, PayloadState::Active | PayloadState::Durable)
    }

    pub fn from_ordinal(v: u8) -> Result<PayloadState> {
        match v {
            0 => Ok(PayloadState::Allocated),
            1 => Ok(PayloadState::Active),
            2 => Ok(PayloadState::Durable),
            3 => Ok(PayloadState::Deleted),
            other => Err(Error::InvalidArgument(format!("unknown state ordinal {}", other))),
        }
    }
}

impl fmt::Display for PayloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadState::Allocated => "allocated",
            PayloadState::Active => "active",
            PayloadState::Durable => "durable",
            PayloadState::Deleted => "deleted",
        };
        write!(f, "{}", name)
    }
}

/// Advisory eviction policy attached to a payload at allocation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Plain LRU candidate; tier changes keep the state `Active`.
    #[default]
    Standard,
    /// Landing on a durable tier marks the payload `Durable`.
    RequireDurable,
}

impl EvictionPolicy {
    pub fn demands_durability(&self) -> bool {
        matches!(self, EvictionPolicy::RequireDurable)
    }
}

/// Promotion behavior requested alongside a read lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionPolicy {
    /// Promote synchronously when the payload sits below the minimum tier.
    #[default]
    OnDemand,
    /// Never move the payload; fail the tier requirement instead.
    Pinned,
}

/// Per-tier placement descriptor. Computed from the current tier plus
/// backend state, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum Location {
    /// POSIX shared-memory object readable by external processes.
    Ram { shm_name: String, length: u64 },
    /// File region on the local disk root.
    Disk { path: String, offset: u64, length: u64 },
    /// Device allocation plus an opaque cross-process handle token.
    Gpu { device_id: u32, ipc_handle: String, length: u64 },
    /// Remote object URI.
    Object { uri: String, length: u64 },
}

impl Location {
    pub fn tier(&self) -> Tier {
        match self {
            Location::Ram { .. } => Tier::Ram,
            Location::Disk { .. } => Tier::Disk,
            Location::Gpu { .. } => Tier::Gpu,
            Location::Object { .. } => Tier::Object,
        }
    }

    pub fn length(&self) -> u64 {
        match self {
            Location::Ram { length, .. }
            | Location::Disk { length, .. }
            | Location::Gpu { length, .. }
            | Location::Object { length, .. } => *length,
        }
    }
}

/// Canonical public view of a payload: record fields plus the active
/// placement. This is what every manager operation returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadDescriptor {
    pub id: PayloadId,
    pub tier: Tier,
    pub state: PayloadState,
    pub size_bytes: u64,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    pub location: Location,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eviction_policy: Option<EvictionPolicy>,
}
