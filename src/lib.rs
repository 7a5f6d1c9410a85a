//! # STRATUM - Tiered Payload Manager
//!
//! A single-node service mediating access to large binary payloads kept
//! across a tier hierarchy: GPU device memory, host RAM, local disk, and
//! a remote object store. Producers allocate, fill, and commit payloads;
//! consumers acquire leased, placement-stable references and read bytes
//! in place; background machinery migrates payloads between tiers under
//! capacity pressure.
//!
//! ## Architecture
//!
//! - `core`: ids, tiers, lifecycle states, descriptors, error taxonomy
//! - `config`: TOML-backed runtime configuration
//! - `repository`: transactional store of payload rows, metadata,
//!   lineage, streams (memory, SQLite, Postgres backends)
//! - `storage`: per-tier byte stores (shared memory, mmap files, GPU
//!   buffers, remote objects) behind one interface
//! - `lease`: read-lease table fencing placement against migration
//! - `catalog`: write-through metadata and lineage indices
//! - `manager`: the payload lifecycle authority
//! - `spill`: bounded migration queue and worker pool
//! - `tiering`: pressure evaluation and eviction policy
//! - `stream`: named append-only logs with consumer offsets
//! - `service`: transport-independent service surfaces
//! - `api`: JSON-over-HTTP frontend
//! - `observability`: tracing and OTLP export lifecycle
//! - `runtime`: node assembly and shutdown ordering

#![warn(clippy::all)]

pub mod api;
pub mod catalog;
pub mod config;
pub mod core;
pub mod lease;
pub mod manager;
pub mod observability;
pub mod repository;
pub mod runtime;
pub mod service;
pub mod spill;
pub mod storage;
pub mod stream;
pub mod tiering;

// Re-export commonly used types
pub use crate::core::{
    Error, EvictionPolicy, Location, PayloadDescriptor, PayloadId, PayloadState,
    PromotionPolicy, Result, Tier,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
