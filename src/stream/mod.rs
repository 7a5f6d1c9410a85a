//! # Stream Subsystem
//!
//! Named append-only logs of payload references. All durable state lives
//! in the repository; this layer adds per-stream append serialization,
//! retention enforcement inside the append transaction, consumer-group
//! checkpoints, and a long-poll subscription.
//!
//! Concurrency scope: appends to one stream serialize on that stream's
//! own lock; operations on distinct streams never contend here. An
//! operation racing a delete observes `NotFound`, never a zombie row.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::core::{now_ms, Error, PayloadId, Result};
use crate::repository::{
    begin_with_retry, ConsumerOffsetRecord, Repository, RepositoryTx, StreamEntryRecord,
    StreamRecord,
};

/// Offsets assigned by one append call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AppendResult {
    pub first_offset: u64,
    pub last_offset: u64,
}

/// One item handed to `append`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AppendItem {
    pub payload_uuid: PayloadId,
    #[serde(default)]
    pub event_time_ms: Option<u64>,
    #[serde(default)]
    pub duration_ns: Option<u64>,
    #[serde(default)]
    pub tags: String,
}

/// Append-only stream coordinator.
pub struct StreamManager {
    repository: Arc<dyn Repository>,
    /// Per-stream append locks, keyed by stream id.
    append_locks: DashMap<u64, Arc<Mutex<()>>>,
    /// Wakes long-poll subscribers on append and on delete.
    notifiers: DashMap<u64, Arc<Notify>>,
}

impl StreamManager {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            repository,
            append_locks: DashMap::new(),
            notifiers: DashMap::new(),
        }
    }

    fn append_lock(&self, stream_id: u64) -> Arc<Mutex<()>> {
        self.append_locks
            .entry(stream_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn notifier(&self, stream_id: u64) -> Arc<Notify> {
        self.notifiers
            .entry(stream_id)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Create a stream. `(namespace, name)` must be new.
    pub async fn create_stream(
        &self,
        namespace: &str,
        name: &str,
        retention_max_entries: Option<u64>,
        retention_max_age_sec: Option<u64>,
    ) -> Result<StreamRecord> {
        if namespace.is_empty() || name.is_empty() {
            return Err(Error::InvalidArgument(
                "stream namespace and name are required".to_string(),
            ));
        }
        let mut record = StreamRecord {
            stream_id: 0,
            namespace: namespace.to_string(),
            name: name.to_string(),
            retention_max_entries,
            retention_max_age_sec,
            created_at_ms: now_ms(),
        };
        let mut tx = begin_with_retry(self.repository.as_ref()).await?;
        tx.create_stream(&mut record).await?;
        tx.commit().await?;
        tracing::info!(namespace, name, stream_id = record.stream_id, "stream created");
        Ok(record)
    }

    /// Delete a stream and everything under it. Readers and appenders
    /// racing this observe `NotFound`; subscribers terminate.
    pub async fn delete_stream(&self, namespace: &str, name: &str) -> Result<()> {
        let stream = self.resolve(namespace, name).await?;
        let lock = self.append_lock(stream.stream_id);
        {
            let _guard = lock.lock().await;
            let mut tx = begin_with_retry(self.repository.as_ref()).await?;
            tx.delete_stream_by_id(stream.stream_id).await?;
            tx.commit().await?;
        }
        // wake subscribers so they observe the deletion and end
        if let Some((_, notify)) = self.notifiers.remove(&stream.stream_id) {
            notify.notify_waiters();
        }
        self.append_locks.remove(&stream.stream_id);
        tracing::info!(namespace, name, stream_id = stream.stream_id, "stream deleted");
        Ok(())
    }

    /// Look up a stream by name.
    pub async fn resolve(&self, namespace: &str, name: &str) -> Result<StreamRecord> {
        let mut tx = self.repository.begin().await?;
        let stream = tx.get_stream_by_name(namespace, name).await?;
        tx.rollback().await?;
        stream.ok_or_else(|| Error::NotFound(format!("stream {}/{}", namespace, name)))
    }

    /// Append items, assigning dense contiguous offsets, and apply the
    /// stream's retention inside the same transaction.
    pub async fn append(
        &self,
        namespace: &str,
        name: &str,
        items: Vec<AppendItem>,
    ) -> Result<AppendResult> {
        if items.is_empty() {
            return Err(Error::InvalidArgument("append of zero items".to_string()));
        }
        let stream = self.resolve(namespace, name).await?;
        let lock = self.append_lock(stream.stream_id);
        let _guard = lock.lock().await;

        let mut tx = begin_with_retry(self.repository.as_ref()).await?;
        // the stream may have been deleted while we waited for the lock
        let stream = tx
            .get_stream_by_id(stream.stream_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("stream {}/{}", namespace, name)))?;

        let append_time_ms = now_ms();
        let mut entries: Vec<StreamEntryRecord> = items
            .into_iter()
            .map(|item| StreamEntryRecord {
                stream_id: stream.stream_id,
                offset: 0,
                payload_uuid: item.payload_uuid,
                event_time_ms: item.event_time_ms,
                append_time_ms,
                duration_ns: item.duration_ns,
                tags: item.tags,
            })
            .collect();
        tx.append_entries(stream.stream_id, &mut entries).await?;

        if let Some(keep) = stream.retention_max_entries {
            tx.trim_to_max_count(stream.stream_id, keep).await?;
        }
        if let Some(max_age_sec) = stream.retention_max_age_sec {
            let cutoff = append_time_ms.saturating_sub(max_age_sec * 1000);
            tx.delete_entries_older_than(stream.stream_id, cutoff).await?;
        }
        tx.commit().await?;

        self.notifier(stream.stream_id).notify_waiters();

        let first_offset = entries.first().map(|e| e.offset).unwrap_or(0);
        let last_offset = entries.last().map(|e| e.offset).unwrap_or(0);
        tracing::debug!(namespace, name, first_offset, last_offset, "entries appended");
        Ok(AppendResult {
            first_offset,
            last_offset,
        })
    }

    /// Ordered read from `start_offset`.
    pub async fn read(
        &self,
        namespace: &str,
        name: &str,
        start_offset: u64,
        max_entries: Option<u64>,
        min_append_time_ms: Option<u64>,
    ) -> Result<Vec<StreamEntryRecord>> {
        let stream = self.resolve(namespace, name).await?;
        let mut tx = self.repository.begin().await?;
        let entries = tx
            .read_entries(stream.stream_id, start_offset, max_entries, min_append_time_ms)
            .await?;
        tx.rollback().await?;
        Ok(entries)
    }

    /// Ordered read of the inclusive offset range.
    pub async fn get_range(
        &self,
        namespace: &str,
        name: &str,
        start_offset: u64,
        end_offset_inclusive: u64,
    ) -> Result<Vec<StreamEntryRecord>> {
        let stream = self.resolve(namespace, name).await?;
        let mut tx = self.repository.begin().await?;
        let entries = tx
            .read_entry_range(stream.stream_id, start_offset, end_offset_inclusive)
            .await?;
        tx.rollback().await?;
        Ok(entries)
    }

    /// Write-wins checkpoint update for a consumer group.
    pub async fn commit_offset(
        &self,
        namespace: &str,
        name: &str,
        consumer_group: &str,
        offset: u64,
    ) -> Result<()> {
        if consumer_group.is_empty() {
            return Err(Error::InvalidArgument("consumer group is required".to_string()));
        }
        let stream = self.resolve(namespace, name).await?;
        let mut tx = begin_with_retry(self.repository.as_ref()).await?;
        tx.commit_consumer_offset(&ConsumerOffsetRecord {
            stream_id: stream.stream_id,
            consumer_group: consumer_group.to_string(),
            offset,
            updated_at_ms: now_ms(),
        })
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Committed offset for a group; 0 when the group has no checkpoint.
    pub async fn get_committed(
        &self,
        namespace: &str,
        name: &str,
        consumer_group: &str,
    ) -> Result<u64> {
        let stream = self.resolve(namespace, name).await?;
        let mut tx = self.repository.begin().await?;
        let row = tx
            .get_consumer_offset(stream.stream_id, consumer_group)
            .await?;
        tx.rollback().await?;
        Ok(row.map(|r| r.offset).unwrap_or(0))
    }

    /// Long-poll subscription from `start_offset`. At most `max_inflight`
    /// entries are buffered; the feed suspends when the log is drained
    /// and resumes on append. Dropping the receiver cancels the feed;
    /// stream deletion ends it without error.
    pub async fn subscribe(
        self: &Arc<Self>,
        namespace: &str,
        name: &str,
        start_offset: u64,
        max_inflight: usize,
    ) -> Result<mpsc::Receiver<StreamEntryRecord>> {
        let stream = self.resolve(namespace, name).await?;
        let (sender, receiver) = mpsc::channel(max_inflight.max(1));
        let manager = self.clone();
        let stream_id = stream.stream_id;

        tokio::spawn(async move {
            let mut cursor = start_offset;
            loop {
                let notify = manager.notifier(stream_id);
                let notified = notify.notified();
                tokio::pin!(notified);
                // register before the read so an append racing the empty
                // check still wakes us
                notified.as_mut().enable();

                let batch = {
                    let mut tx = match manager.repository.begin().await {
                        Ok(tx) => tx,
                        Err(e) => {
                            tracing::warn!(stream_id, error = %e, "subscription read failed");
                            break;
                        }
                    };
                    let result = tx
                        .read_entries(stream_id, cursor, Some(64), None)
                        .await;
                    let _ = tx.rollback().await;
                    result
                };

                match batch {
                    // stream gone: terminate quietly
                    Err(Error::NotFound(_)) => break,
                    Err(e) => {
                        tracing::warn!(stream_id, error = %e, "subscription read failed");
                        break;
                    }
                    Ok(entries) if entries.is_empty() => {
                        // drained: wait for the next append or the
                        // delete wakeup
                        notified.await;
                    }
                    Ok(entries) => {
                        for entry in entries {
                            cursor = entry.offset + 1;
                            if sender.send(entry).await.is_err() {
                                // receiver dropped: cancelled
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(receiver)
    }
}
