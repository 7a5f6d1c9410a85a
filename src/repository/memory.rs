//! In-memory repository backend.
//!
//! A transaction takes an exclusive hold on the committed state, clones
//! it into a working copy, applies reads and writes against the copy, and
//! swaps it back on commit. Dropping the handle discards the copy, which
//! is exactly rollback. Simple, correct, and the reference backend for
//! the conformance suite; durability is explicitly not offered.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::core::{Error, PayloadId, Result};

use super::models::{
    ConsumerOffsetRecord, LineageEdgeRecord, MetadataEventRecord, MetadataRecord, PayloadRecord,
    StreamEntryRecord, StreamRecord,
};
use super::{Repository, RepositoryTx};

/// Whole-database state. Cloned per transaction.
#[derive(Debug, Clone, Default)]
struct MemoryState {
    payloads: HashMap<PayloadId, PayloadRecord>,
    metadata: HashMap<PayloadId, MetadataRecord>,
    metadata_events: Vec<MetadataEventRecord>,
    lineage: Vec<LineageEdgeRecord>,
    streams: HashMap<u64, StreamRecord>,
    /// `(namespace, name)` uniqueness index.
    stream_names: HashMap<(String, String), u64>,
    /// Ordered by `(stream_id, offset)` so range scans are trivial.
    entries: BTreeMap<(u64, u64), StreamEntryRecord>,
    consumer_offsets: HashMap<(u64, String), ConsumerOffsetRecord>,
    next_stream_id: u64,
}

/// Non-durable repository backend.
pub struct MemoryRepository {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                next_stream_id: 1,
                ..MemoryState::default()
            })),
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn begin(&self) -> Result<Box<dyn RepositoryTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    fn supports_concurrent_transactions(&self) -> bool {
        false
    }
}

/// Transaction = exclusive hold + working copy.
struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl RepositoryTx for MemoryTx {
    async fn insert_payload(&mut self, record: &PayloadRecord) -> Result<()> {
        if self.working.payloads.contains_key(&record.id) {
            return Err(Error::AlreadyExists(format!("payload {}", record.id)));
        }
        self.working.payloads.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_payload(&mut self, id: &PayloadId) -> Result<Option<PayloadRecord>> {
        Ok(self.working.payloads.get(id).cloned())
    }

    async fn list_payloads(&mut self) -> Result<Vec<PayloadRecord>> {
        let mut all: Vec<_> = self.working.payloads.values().cloned().collect();
        all.sort_by_key(|r| r.id);
        Ok(all)
    }

    async fn update_payload(&mut self, record: &PayloadRecord) -> Result<()> {
        match self.working.payloads.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("payload {}", record.id))),
        }
    }

    async fn delete_payload(&mut self, id: &PayloadId) -> Result<()> {
        self.working.payloads.remove(id);
        self.working.metadata.remove(id);
        self.working.metadata_events.retain(|e| e.payload_id != *id);
        self.working
            .lineage
            .retain(|e| e.parent_id != *id && e.child_id != *id);
        Ok(())
    }

    async fn upsert_metadata(&mut self, record: &MetadataRecord) -> Result<()> {
        self.working.metadata.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_metadata(&mut self, id: &PayloadId) -> Result<Option<MetadataRecord>> {
        Ok(self.working.metadata.get(id).cloned())
    }

    async fn append_metadata_event(&mut self, record: &MetadataEventRecord) -> Result<()> {
        self.working.metadata_events.push(record.clone());
        Ok(())
    }

    async fn get_metadata_events(&mut self, id: &PayloadId) -> Result<Vec<MetadataEventRecord>> {
        Ok(self
            .working
            .metadata_events
            .iter()
            .filter(|e| e.payload_id == *id)
            .cloned()
            .collect())
    }

    async fn insert_lineage(&mut self, edge: &LineageEdgeRecord) -> Result<()> {
        self.working.lineage.push(edge.clone());
        Ok(())
    }

    async fn get_parents(&mut self, id: &PayloadId) -> Result<Vec<LineageEdgeRecord>> {
        Ok(self
            .working
            .lineage
            .iter()
            .filter(|e| e.child_id == *id)
            .cloned()
            .collect())
    }

    async fn get_children(&mut self, id: &PayloadId) -> Result<Vec<LineageEdgeRecord>> {
        Ok(self
            .working
            .lineage
            .iter()
            .filter(|e| e.parent_id == *id)
            .cloned()
            .collect())
    }

    async fn create_stream(&mut self, record: &mut StreamRecord) -> Result<()> {
        let key = (record.namespace.clone(), record.name.clone());
        if self.working.stream_names.contains_key(&key) {
            return Err(Error::AlreadyExists(format!(
                "stream {}/{}",
                record.namespace, record.name
            )));
        }
        record.stream_id = self.working.next_stream_id;
        self.working.next_stream_id += 1;
        self.working.stream_names.insert(key, record.stream_id);
        self.working.streams.insert(record.stream_id, record.clone());
        Ok(())
    }

    async fn get_stream_by_name(
        &mut self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StreamRecord>> {
        let key = (namespace.to_string(), name.to_string());
        Ok(self
            .working
            .stream_names
            .get(&key)
            .and_then(|id| self.working.streams.get(id))
            .cloned())
    }

    async fn get_stream_by_id(&mut self, stream_id: u64) -> Result<Option<StreamRecord>> {
        Ok(self.working.streams.get(&stream_id).cloned())
    }

    async fn delete_stream_by_name(&mut self, namespace: &str, name: &str) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        if let Some(id) = self.working.stream_names.get(&key).copied() {
            self.delete_stream_by_id(id).await?;
        }
        Ok(())
    }

    async fn delete_stream_by_id(&mut self, stream_id: u64) -> Result<()> {
        if let Some(stream) = self.working.streams.remove(&stream_id) {
            self.working
                .stream_names
                .remove(&(stream.namespace, stream.name));
        }
        let range: Vec<(u64, u64)> = self
            .working
            .entries
            .range((stream_id, 0)..=(stream_id, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in range {
            self.working.entries.remove(&key);
        }
        self.working
            .consumer_offsets
            .retain(|(sid, _), _| *sid != stream_id);
        Ok(())
    }

    async fn append_entries(
        &mut self,
        stream_id: u64,
        entries: &mut [StreamEntryRecord],
    ) -> Result<()> {
        if !self.working.streams.contains_key(&stream_id) {
            return Err(Error::NotFound(format!("stream {}", stream_id)));
        }
        let mut next = self
            .max_offset(stream_id)
            .await?
            .map(|m| m + 1)
            .unwrap_or(0);
        for entry in entries.iter_mut() {
            entry.stream_id = stream_id;
            entry.offset = next;
            self.working.entries.insert((stream_id, next), entry.clone());
            next += 1;
        }
        Ok(())
    }

    async fn read_entries(
        &mut self,
        stream_id: u64,
        start_offset: u64,
        max_entries: Option<u64>,
        min_append_time_ms: Option<u64>,
    ) -> Result<Vec<StreamEntryRecord>> {
        if !self.working.streams.contains_key(&stream_id) {
            return Err(Error::NotFound(format!("stream {}", stream_id)));
        }
        let limit = max_entries.unwrap_or(u64::MAX) as usize;
        Ok(self
            .working
            .entries
            .range((stream_id, start_offset)..=(stream_id, u64::MAX))
            .map(|(_, e)| e)
            .filter(|e| min_append_time_ms.map_or(true, |t| e.append_time_ms >= t))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn read_entry_range(
        &mut self,
        stream_id: u64,
        start_offset: u64,
        end_offset_inclusive: u64,
    ) -> Result<Vec<StreamEntryRecord>> {
        if !self.working.streams.contains_key(&stream_id) {
            return Err(Error::NotFound(format!("stream {}", stream_id)));
        }
        Ok(self
            .working
            .entries
            .range((stream_id, start_offset)..=(stream_id, end_offset_inclusive))
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn max_offset(&mut self, stream_id: u64) -> Result<Option<u64>> {
        Ok(self
            .working
            .entries
            .range((stream_id, 0)..=(stream_id, u64::MAX))
            .next_back()
            .map(|((_, offset), _)| *offset))
    }

    async fn trim_to_max_count(&mut self, stream_id: u64, keep_newest: u64) -> Result<u64> {
        let keys: Vec<(u64, u64)> = self
            .working
            .entries
            .range((stream_id, 0)..=(stream_id, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        if keys.len() as u64 <= keep_newest {
            return Ok(0);
        }
        let drop_count = keys.len() as u64 - keep_newest;
        for key in keys.into_iter().take(drop_count as usize) {
            self.working.entries.remove(&key);
        }
        Ok(drop_count)
    }

    async fn delete_entries_older_than(
        &mut self,
        stream_id: u64,
        min_append_time_ms: u64,
    ) -> Result<u64> {
        let keys: Vec<(u64, u64)> = self
            .working
            .entries
            .range((stream_id, 0)..=(stream_id, u64::MAX))
            .filter(|(_, e)| e.append_time_ms < min_append_time_ms)
            .map(|(k, _)| *k)
            .collect();
        let removed = keys.len() as u64;
        for key in keys {
            self.working.entries.remove(&key);
        }
        Ok(removed)
    }

    async fn commit_consumer_offset(&mut self, record: &ConsumerOffsetRecord) -> Result<()> {
        self.working
            .consumer_offsets
            .insert((record.stream_id, record.consumer_group.clone()), record.clone());
        Ok(())
    }

    async fn get_consumer_offset(
        &mut self,
        stream_id: u64,
        consumer_group: &str,
    ) -> Result<Option<ConsumerOffsetRecord>> {
        Ok(self
            .working
            .consumer_offsets
            .get(&(stream_id, consumer_group.to_string()))
            .cloned())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        *self.guard = self.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        // dropping the working copy is the rollback
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PayloadState, Tier};

    fn payload(id: PayloadId) -> PayloadRecord {
        PayloadRecord {
            id,
            tier: Tier::Ram,
            state: PayloadState::Allocated,
            size_bytes: 64,
            version: 1,
            expires_at_ms: None,
        }
    }

    fn entry(payload_uuid: PayloadId, append_time_ms: u64) -> StreamEntryRecord {
        StreamEntryRecord {
            stream_id: 0,
            offset: 0,
            payload_uuid,
            event_time_ms: None,
            append_time_ms,
            duration_ns: None,
            tags: String::new(),
        }
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let repo = MemoryRepository::new();
        let id = PayloadId::generate();

        let mut tx = repo.begin().await.unwrap();
        tx.insert_payload(&payload(id)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = repo.begin().await.unwrap();
        assert!(tx.get_payload(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_drop_is_rollback() {
        let repo = MemoryRepository::new();
        let id = PayloadId::generate();

        {
            let mut tx = repo.begin().await.unwrap();
            tx.insert_payload(&payload(id)).await.unwrap();
            // dropped without commit
        }

        let mut tx = repo.begin().await.unwrap();
        assert!(tx.get_payload(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let repo = MemoryRepository::new();
        let id = PayloadId::generate();

        let mut tx = repo.begin().await.unwrap();
        tx.insert_payload(&payload(id)).await.unwrap();
        assert!(tx.get_payload(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let repo = MemoryRepository::new();
        let id = PayloadId::generate();

        let mut tx = repo.begin().await.unwrap();
        tx.insert_payload(&payload(id)).await.unwrap();
        let err = tx.insert_payload(&payload(id)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_delete_payload_cascades() {
        let repo = MemoryRepository::new();
        let id = PayloadId::generate();
        let other = PayloadId::generate();

        let mut tx = repo.begin().await.unwrap();
        tx.insert_payload(&payload(id)).await.unwrap();
        tx.insert_payload(&payload(other)).await.unwrap();
        tx.upsert_metadata(&MetadataRecord {
            id,
            json: serde_json::json!({"k": 1}),
            schema: "s".into(),
            updated_at_ms: 1,
        })
        .await
        .unwrap();
        tx.insert_lineage(&LineageEdgeRecord {
            parent_id: id,
            child_id: other,
            operation: "derive".into(),
            role: "input".into(),
            parameters: String::new(),
            created_at_ms: 1,
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut tx = repo.begin().await.unwrap();
        tx.delete_payload(&id).await.unwrap();
        assert!(tx.get_metadata(&id).await.unwrap().is_none());
        assert!(tx.get_parents(&other).await.unwrap().is_empty());
        // idempotent
        tx.delete_payload(&id).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_ids_assigned_and_names_unique() {
        let repo = MemoryRepository::new();

        let mut tx = repo.begin().await.unwrap();
        let mut a = StreamRecord {
            stream_id: 0,
            namespace: "ns".into(),
            name: "a".into(),
            retention_max_entries: None,
            retention_max_age_sec: None,
            created_at_ms: 0,
        };
        let mut b = a.clone();
        b.name = "b".into();
        tx.create_stream(&mut a).await.unwrap();
        tx.create_stream(&mut b).await.unwrap();
        assert_ne!(a.stream_id, 0);
        assert_ne!(a.stream_id, b.stream_id);

        let mut dup = a.clone();
        let err = tx.create_stream(&mut dup).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_append_assigns_dense_offsets() {
        let repo = MemoryRepository::new();
        let mut tx = repo.begin().await.unwrap();
        let mut stream = StreamRecord {
            stream_id: 0,
            namespace: "ns".into(),
            name: "s".into(),
            retention_max_entries: None,
            retention_max_age_sec: None,
            created_at_ms: 0,
        };
        tx.create_stream(&mut stream).await.unwrap();

        let mut first = [entry(PayloadId::generate(), 10)];
        tx.append_entries(stream.stream_id, &mut first).await.unwrap();
        assert_eq!(first[0].offset, 0);

        let mut batch = [entry(PayloadId::generate(), 11), entry(PayloadId::generate(), 12)];
        tx.append_entries(stream.stream_id, &mut batch).await.unwrap();
        assert_eq!(batch[0].offset, 1);
        assert_eq!(batch[1].offset, 2);
        assert_eq!(tx.max_offset(stream.stream_id).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_trim_keeps_newest_offsets_intact() {
        let repo = MemoryRepository::new();
        let mut tx = repo.begin().await.unwrap();
        let mut stream = StreamRecord {
            stream_id: 0,
            namespace: "ns".into(),
            name: "s".into(),
            retention_max_entries: None,
            retention_max_age_sec: None,
            created_at_ms: 0,
        };
        tx.create_stream(&mut stream).await.unwrap();

        for t in 0..4u64 {
            let mut batch = [entry(PayloadId::generate(), t)];
            tx.append_entries(stream.stream_id, &mut batch).await.unwrap();
        }

        let removed = tx.trim_to_max_count(stream.stream_id, 2).await.unwrap();
        assert_eq!(removed, 2);
        let rest = tx
            .read_entries(stream.stream_id, 0, None, None)
            .await
            .unwrap();
        let offsets: Vec<u64> = rest.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_age_retention() {
        let repo = MemoryRepository::new();
        let mut tx = repo.begin().await.unwrap();
        let mut stream = StreamRecord {
            stream_id: 0,
            namespace: "ns".into(),
            name: "s".into(),
            retention_max_entries: None,
            retention_max_age_sec: None,
            created_at_ms: 0,
        };
        tx.create_stream(&mut stream).await.unwrap();
        for t in [100u64, 200, 300] {
            let mut batch = [entry(PayloadId::generate(), t)];
            tx.append_entries(stream.stream_id, &mut batch).await.unwrap();
        }

        let removed = tx
            .delete_entries_older_than(stream.stream_id, 250)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        let rest = tx
            .read_entries(stream.stream_id, 0, None, None)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].append_time_ms, 300);
    }

    #[tokio::test]
    async fn test_consumer_offset_write_wins() {
        let repo = MemoryRepository::new();
        let mut tx = repo.begin().await.unwrap();
        let record = ConsumerOffsetRecord {
            stream_id: 7,
            consumer_group: "g".into(),
            offset: 5,
            updated_at_ms: 1,
        };
        tx.commit_consumer_offset(&record).await.unwrap();
        // lower offset still wins: write-wins, not max-wins
        let older = ConsumerOffsetRecord { offset: 2, ..record.clone() };
        tx.commit_consumer_offset(&older).await.unwrap();
        let got = tx.get_consumer_offset(7, "g").await.unwrap().unwrap();
        assert_eq!(got.offset, 2);
    }

    #[tokio::test]
    async fn test_delete_stream_cascades() {
        let repo = MemoryRepository::new();
        let mut tx = repo.begin().await.unwrap();
        let mut stream = StreamRecord {
            stream_id: 0,
            namespace: "ns".into(),
            name: "s".into(),
            retention_max_entries: None,
            retention_max_age_sec: None,
            created_at_ms: 0,
        };
        tx.create_stream(&mut stream).await.unwrap();
        let mut batch = [entry(PayloadId::generate(), 1)];
        tx.append_entries(stream.stream_id, &mut batch).await.unwrap();
        tx.commit_consumer_offset(&ConsumerOffsetRecord {
            stream_id: stream.stream_id,
            consumer_group: "g".into(),
            offset: 0,
            updated_at_ms: 1,
        })
        .await
        .unwrap();

        tx.delete_stream_by_id(stream.stream_id).await.unwrap();
        assert!(tx
            .get_stream_by_id(stream.stream_id)
            .await
            .unwrap()
            .is_none());
        assert!(tx
            .get_consumer_offset(stream.stream_id, "g")
            .await
            .unwrap()
            .is_none());
        let err = tx
            .read_entries(stream.stream_id, 0, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
