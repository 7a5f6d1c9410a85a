//! Foundational types shared by every subsystem: payload identifiers,
//! tier and lifecycle enumerations, placement descriptors, and the
//! portable error taxonomy.

pub mod error;
pub mod id;
pub mod types;

pub use error::{Error, Result};
pub use id::PayloadId;
pub use types::{
    EvictionPolicy, Location, PayloadDescriptor, PayloadState, PromotionPolicy, Tier,
};

/// Milliseconds since the Unix epoch, the timestamp convention used by
/// every persistent record.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
