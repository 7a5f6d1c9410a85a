//! # Persistent Repository
//!
//! Transactional ACID store of payload rows, metadata, lineage edges,
//! streams, stream entries, and consumer offsets.
//!
//! Backends:
//! - Memory: copy-on-write snapshot per transaction, no durability
//! - SQLite: embedded file database, transactions serialized
//! - Postgres: external relational database, concurrent transactions
//!
//! ## Transaction contract
//!
//! - `begin()` returns an exclusive handle; all reads and writes go
//!   through it
//! - reads inside a transaction observe its own prior writes
//! - writes become visible to other transactions only after `commit()`
//! - a handle dropped without commit is a rollback
//!
//! ## Cascade semantics
//!
//! Deleting a payload removes its metadata row, its metadata events, and
//! every lineage edge touching it. Deleting a stream removes its entries
//! and consumer offsets. Cascades run inside the same transaction as the
//! parent delete.
//!
//! Backends translate native errors into the portable taxonomy at this
//! boundary; nothing above sees a native database error.

use async_trait::async_trait;
use std::time::Duration;

use crate::core::{PayloadId, Result};

pub mod memory;
pub mod models;
pub mod postgres;
pub mod schema;
pub mod sqlite;

pub use memory::MemoryRepository;
pub use models::{
    ConsumerOffsetRecord, LineageEdgeRecord, MetadataEventRecord, MetadataRecord, PayloadRecord,
    StreamEntryRecord, StreamRecord,
};
pub use postgres::PostgresRepository;
pub use sqlite::SqliteRepository;

/// Attempts made on a transient `Busy` before giving up.
const BUSY_RETRIES: u32 = 3;

/// Backoff between `Busy` retries.
const BUSY_BACKOFF: Duration = Duration::from_millis(20);

/// Repository factory seam. One instance per node.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Open a transaction. The handle is exclusive; backends that cannot
    /// run transactions in parallel serialize callers here.
    async fn begin(&self) -> Result<Box<dyn RepositoryTx>>;

    /// Capability flag: whether two transactions may be open at once.
    /// Callers must not assume parallelism unless this returns true.
    fn supports_concurrent_transactions(&self) -> bool {
        false
    }
}

/// One open transaction. All entity operations live here so that every
/// write is transactional by construction.
#[async_trait]
pub trait RepositoryTx: Send {
    // ---- payload lifecycle ----

    async fn insert_payload(&mut self, record: &PayloadRecord) -> Result<()>;
    async fn get_payload(&mut self, id: &PayloadId) -> Result<Option<PayloadRecord>>;
    async fn list_payloads(&mut self) -> Result<Vec<PayloadRecord>>;
    /// Replace the row by id. `NotFound` when absent.
    async fn update_payload(&mut self, record: &PayloadRecord) -> Result<()>;
    /// Remove the row and cascade to metadata, events, and lineage.
    /// Idempotent.
    async fn delete_payload(&mut self, id: &PayloadId) -> Result<()>;

    // ---- metadata ----

    async fn upsert_metadata(&mut self, record: &MetadataRecord) -> Result<()>;
    async fn get_metadata(&mut self, id: &PayloadId) -> Result<Option<MetadataRecord>>;
    async fn append_metadata_event(&mut self, record: &MetadataEventRecord) -> Result<()>;
    async fn get_metadata_events(&mut self, id: &PayloadId) -> Result<Vec<MetadataEventRecord>>;

    // ---- lineage ----

    async fn insert_lineage(&mut self, edge: &LineageEdgeRecord) -> Result<()>;
    async fn get_parents(&mut self, id: &PayloadId) -> Result<Vec<LineageEdgeRecord>>;
    async fn get_children(&mut self, id: &PayloadId) -> Result<Vec<LineageEdgeRecord>>;

    // ---- streams ----

    /// Insert a stream and assign `record.stream_id`. `AlreadyExists` on
    /// a `(namespace, name)` collision.
    async fn create_stream(&mut self, record: &mut StreamRecord) -> Result<()>;
    async fn get_stream_by_name(&mut self, namespace: &str, name: &str)
        -> Result<Option<StreamRecord>>;
    async fn get_stream_by_id(&mut self, stream_id: u64) -> Result<Option<StreamRecord>>;
    async fn delete_stream_by_name(&mut self, namespace: &str, name: &str) -> Result<()>;
    /// Remove the stream and cascade to entries and consumer offsets.
    async fn delete_stream_by_id(&mut self, stream_id: u64) -> Result<()>;

    // ---- stream entries ----

    /// Append entries, assigning dense offsets contiguous with the
    /// stream's current maximum (starting at 0 for a fresh stream). The
    /// assigned offsets are written back into `entries`.
    async fn append_entries(
        &mut self,
        stream_id: u64,
        entries: &mut [StreamEntryRecord],
    ) -> Result<()>;
    async fn read_entries(
        &mut self,
        stream_id: u64,
        start_offset: u64,
        max_entries: Option<u64>,
        min_append_time_ms: Option<u64>,
    ) -> Result<Vec<StreamEntryRecord>>;
    async fn read_entry_range(
        &mut self,
        stream_id: u64,
        start_offset: u64,
        end_offset_inclusive: u64,
    ) -> Result<Vec<StreamEntryRecord>>;
    async fn max_offset(&mut self, stream_id: u64) -> Result<Option<u64>>;
    /// Drop oldest-offset entries so at most `keep_newest` remain.
    /// Returns the number removed. Remaining offsets keep their values.
    async fn trim_to_max_count(&mut self, stream_id: u64, keep_newest: u64) -> Result<u64>;
    /// Drop entries appended before `min_append_time_ms`. Returns the
    /// number removed.
    async fn delete_entries_older_than(
        &mut self,
        stream_id: u64,
        min_append_time_ms: u64,
    ) -> Result<u64>;

    // ---- consumer offsets ----

    /// Write-wins upsert of the checkpoint row.
    async fn commit_consumer_offset(&mut self, record: &ConsumerOffsetRecord) -> Result<()>;
    async fn get_consumer_offset(
        &mut self,
        stream_id: u64,
        consumer_group: &str,
    ) -> Result<Option<ConsumerOffsetRecord>>;

    // ---- lifecycle ----

    /// Make every write in this transaction visible atomically.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Explicit rollback. Dropping the handle has the same effect.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Open a transaction, retrying a bounded number of times when the
/// backend reports a transient `Busy`. This is the only silent retry in
/// the system.
pub async fn begin_with_retry(repo: &dyn Repository) -> Result<Box<dyn RepositoryTx>> {
    let mut attempt = 0;
    loop {
        match repo.begin().await {
            Ok(tx) => return Ok(tx),
            Err(e) if e.is_transient() && attempt < BUSY_RETRIES => {
                attempt += 1;
                tracing::debug!(attempt, "repository busy, backing off");
                tokio::time::sleep(BUSY_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}
