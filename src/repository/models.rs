//! Persistent entity records.
//!
//! These structs are the rows the repository stores; the database is the
//! source of truth for payload state, metadata, lineage, and stream
//! contents. Placement locations are never persisted; they are recomputed
//! from the current tier plus backend state.

use serde::{Deserialize, Serialize};

use crate::core::{PayloadId, PayloadState, Tier};

/// Authoritative payload row.
///
/// `version` is a strictly monotone counter bumped on every successful
/// mutation; readers use it for optimistic reasoning and lease fencing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadRecord {
    pub id: PayloadId,
    pub tier: Tier,
    pub state: PayloadState,
    pub size_bytes: u64,
    pub version: u64,
    /// Optional expiration; `None` means the payload never expires.
    pub expires_at_ms: Option<u64>,
}

impl PayloadRecord {
    /// Whether the record has an expiry in the past.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at_ms, Some(at) if at <= now_ms)
    }
}

/// Current metadata snapshot, one row per payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub id: PayloadId,
    /// Opaque JSON document supplied by producers.
    pub json: serde_json::Value,
    /// Producer-declared schema label; not interpreted by the core.
    pub schema: String,
    pub updated_at_ms: u64,
}

/// Append-only metadata history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEventRecord {
    pub payload_id: PayloadId,
    pub ts_ms: u64,
    pub metadata: serde_json::Value,
    pub source: String,
    pub version: u64,
}

/// Directed lineage edge, parent to child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEdgeRecord {
    pub parent_id: PayloadId,
    pub child_id: PayloadId,
    pub operation: String,
    pub role: String,
    /// Opaque operation parameters.
    pub parameters: String,
    pub created_at_ms: u64,
}

/// Named append-only stream. `(namespace, name)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    /// Assigned by the repository at creation.
    pub stream_id: u64,
    pub namespace: String,
    pub name: String,
    /// Keep at most this many newest entries; `None` disables the bound.
    pub retention_max_entries: Option<u64>,
    /// Drop entries older than this many seconds; `None` disables.
    pub retention_max_age_sec: Option<u64>,
    pub created_at_ms: u64,
}

/// One appended stream entry. Offsets are dense and strictly increasing
/// per stream, assigned by the repository at append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntryRecord {
    pub stream_id: u64,
    pub offset: u64,
    pub payload_uuid: PayloadId,
    pub event_time_ms: Option<u64>,
    pub append_time_ms: u64,
    pub duration_ns: Option<u64>,
    /// Opaque tag blob, uninterpreted.
    pub tags: String,
}

/// Consumer-group checkpoint, keyed by `(stream_id, consumer_group)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerOffsetRecord {
    pub stream_id: u64,
    pub consumer_group: String,
    pub offset: u64,
    pub updated_at_ms: u64,
}
