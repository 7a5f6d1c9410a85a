//! Postgres repository backend.
//!
//! External relational backend. Unlike SQLite, transactions may run
//! concurrently; each one rides its own pooled connection. Schema is
//! bootstrapped on connect and versioned in `payload_schema_migrations`.

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::core::{now_ms, Error, PayloadId, PayloadState, Result, Tier};

use super::models::{
    ConsumerOffsetRecord, LineageEdgeRecord, MetadataEventRecord, MetadataRecord, PayloadRecord,
    StreamEntryRecord, StreamRecord,
};
use super::schema::{POSTGRES_SCHEMA, SCHEMA_VERSION};
use super::{Repository, RepositoryTx};

/// Durable relational repository backend.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Connect and bootstrap the schema.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;

        for statement in POSTGRES_SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        sqlx::query(
            "INSERT INTO payload_schema_migrations(version, applied_at_ms)
             VALUES($1, $2) ON CONFLICT (version) DO NOTHING",
        )
        .bind(SCHEMA_VERSION)
        .bind(now_ms() as i64)
        .execute(&pool)
        .await?;

        tracing::debug!("postgres repository schema ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn begin(&self) -> Result<Box<dyn RepositoryTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTx { tx }))
    }

    fn supports_concurrent_transactions(&self) -> bool {
        true
    }
}

struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::InvalidArgument(format!("{} {} exceeds supported range", field, value)))
}

fn opt_to_i64(value: Option<u64>, field: &str) -> Result<Option<i64>> {
    value.map(|v| to_i64(v, field)).transpose()
}

fn row_to_payload(row: &PgRow) -> Result<PayloadRecord> {
    let id: String = row.try_get("id")?;
    let tier: i32 = row.try_get("tier")?;
    let state: i32 = row.try_get("state")?;
    let size_bytes: i64 = row.try_get("size_bytes")?;
    let version: i64 = row.try_get("version")?;
    let expires_at_ms: Option<i64> = row.try_get("expires_at_ms")?;
    Ok(PayloadRecord {
        id: PayloadId::parse(&id).map_err(|e| Error::Corruption(e.to_string()))?,
        tier: Tier::from_ordinal(tier as u8).map_err(|e| Error::Corruption(e.to_string()))?,
        state: PayloadState::from_ordinal(state as u8)
            .map_err(|e| Error::Corruption(e.to_string()))?,
        size_bytes: size_bytes.max(0) as u64,
        version: version.max(0) as u64,
        expires_at_ms: expires_at_ms.map(|v| v.max(0) as u64),
    })
}

fn row_to_stream(row: &PgRow) -> Result<StreamRecord> {
    Ok(StreamRecord {
        stream_id: row.try_get::<i64, _>("stream_id")?.max(0) as u64,
        namespace: row.try_get("namespace")?,
        name: row.try_get("name")?,
        retention_max_entries: row
            .try_get::<Option<i64>, _>("retention_max_entries")?
            .map(|v| v.max(0) as u64),
        retention_max_age_sec: row
            .try_get::<Option<i64>, _>("retention_max_age_sec")?
            .map(|v| v.max(0) as u64),
        created_at_ms: row.try_get::<i64, _>("created_at_ms")?.max(0) as u64,
    })
}

fn row_to_entry(row: &PgRow) -> Result<StreamEntryRecord> {
    let payload_uuid: String = row.try_get("payload_uuid")?;
    Ok(StreamEntryRecord {
        stream_id: row.try_get::<i64, _>("stream_id")?.max(0) as u64,
        offset: row.try_get::<i64, _>("entry_offset")?.max(0) as u64,
        payload_uuid: PayloadId::parse(&payload_uuid)
            .map_err(|e| Error::Corruption(e.to_string()))?,
        event_time_ms: row
            .try_get::<Option<i64>, _>("event_time_ms")?
            .map(|v| v.max(0) as u64),
        append_time_ms: row.try_get::<i64, _>("append_time_ms")?.max(0) as u64,
        duration_ns: row
            .try_get::<Option<i64>, _>("duration_ns")?
            .map(|v| v.max(0) as u64),
        tags: row.try_get("tags")?,
    })
}

fn row_to_edge(row: &PgRow) -> Result<LineageEdgeRecord> {
    let parent_id: String = row.try_get("parent_id")?;
    let child_id: String = row.try_get("child_id")?;
    Ok(LineageEdgeRecord {
        parent_id: PayloadId::parse(&parent_id).map_err(|e| Error::Corruption(e.to_string()))?,
        child_id: PayloadId::parse(&child_id).map_err(|e| Error::Corruption(e.to_string()))?,
        operation: row.try_get("operation")?,
        role: row.try_get("role")?,
        parameters: row.try_get("parameters")?,
        created_at_ms: row.try_get::<i64, _>("created_at_ms")?.max(0) as u64,
    })
}

impl PostgresTx {
    async fn require_stream(&mut self, stream_id: u64) -> Result<()> {
        let row = sqlx::query("SELECT 1 FROM streams WHERE stream_id = $1")
            .bind(to_i64(stream_id, "stream_id")?)
            .fetch_optional(&mut *self.tx)
            .await?;
        if row.is_some() {
            Ok(())
        } else {
            Err(Error::NotFound(format!("stream {}", stream_id)))
        }
    }
}

#[async_trait]
impl RepositoryTx for PostgresTx {
    async fn insert_payload(&mut self, record: &PayloadRecord) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO payload(id, tier, state, size_bytes, version, expires_at_ms)
             VALUES($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.id.canonical())
        .bind(record.tier as i32)
        .bind(record.state as i32)
        .bind(to_i64(record.size_bytes, "size_bytes")?)
        .bind(to_i64(record.version, "version")?)
        .bind(opt_to_i64(record.expires_at_ms, "expires_at_ms")?)
        .execute(&mut *self.tx)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let translated: Error = e.into();
                if matches!(translated, Error::AlreadyExists(_)) {
                    Err(Error::AlreadyExists(format!("payload {}", record.id)))
                } else {
                    Err(translated)
                }
            }
        }
    }

    async fn get_payload(&mut self, id: &PayloadId) -> Result<Option<PayloadRecord>> {
        let row = sqlx::query(
            "SELECT id, tier, state, size_bytes, version, expires_at_ms
             FROM payload WHERE id = $1",
        )
        .bind(id.canonical())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(row_to_payload).transpose()
    }

    async fn list_payloads(&mut self) -> Result<Vec<PayloadRecord>> {
        let rows = sqlx::query(
            "SELECT id, tier, state, size_bytes, version, expires_at_ms
             FROM payload ORDER BY id",
        )
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(row_to_payload).collect()
    }

    async fn update_payload(&mut self, record: &PayloadRecord) -> Result<()> {
        let result = sqlx::query(
            "UPDATE payload SET tier = $1, state = $2, size_bytes = $3, version = $4, expires_at_ms = $5
             WHERE id = $6",
        )
        .bind(record.tier as i32)
        .bind(record.state as i32)
        .bind(to_i64(record.size_bytes, "size_bytes")?)
        .bind(to_i64(record.version, "version")?)
        .bind(opt_to_i64(record.expires_at_ms, "expires_at_ms")?)
        .bind(record.id.canonical())
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("payload {}", record.id)));
        }
        Ok(())
    }

    async fn delete_payload(&mut self, id: &PayloadId) -> Result<()> {
        let key = id.canonical();
        sqlx::query("DELETE FROM payload_metadata WHERE id = $1")
            .bind(&key)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM payload_metadata_events WHERE payload_id = $1")
            .bind(&key)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM payload_lineage WHERE parent_id = $1 OR child_id = $1")
            .bind(&key)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM payload WHERE id = $1")
            .bind(&key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn upsert_metadata(&mut self, record: &MetadataRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO payload_metadata(id, json, schema, updated_at_ms)
             VALUES($1, $2, $3, $4)
             ON CONFLICT(id) DO UPDATE SET
               json = excluded.json,
               schema = excluded.schema,
               updated_at_ms = excluded.updated_at_ms",
        )
        .bind(record.id.canonical())
        .bind(record.json.to_string())
        .bind(&record.schema)
        .bind(to_i64(record.updated_at_ms, "updated_at_ms")?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_metadata(&mut self, id: &PayloadId) -> Result<Option<MetadataRecord>> {
        let row = sqlx::query(
            "SELECT id, json, schema, updated_at_ms FROM payload_metadata WHERE id = $1",
        )
        .bind(id.canonical())
        .fetch_optional(&mut *self.tx)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let json_text: String = row.try_get("json")?;
                Ok(Some(MetadataRecord {
                    id: *id,
                    json: serde_json::from_str(&json_text)
                        .map_err(|e| Error::Corruption(format!("metadata json: {}", e)))?,
                    schema: row.try_get("schema")?,
                    updated_at_ms: row.try_get::<i64, _>("updated_at_ms")?.max(0) as u64,
                }))
            }
        }
    }

    async fn append_metadata_event(&mut self, record: &MetadataEventRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO payload_metadata_events(payload_id, ts_ms, metadata, source, version)
             VALUES($1, $2, $3, $4, $5)",
        )
        .bind(record.payload_id.canonical())
        .bind(to_i64(record.ts_ms, "ts_ms")?)
        .bind(record.metadata.to_string())
        .bind(&record.source)
        .bind(to_i64(record.version, "version")?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_metadata_events(&mut self, id: &PayloadId) -> Result<Vec<MetadataEventRecord>> {
        let rows = sqlx::query(
            "SELECT payload_id, ts_ms, metadata, source, version
             FROM payload_metadata_events WHERE payload_id = $1 ORDER BY ts_ms",
        )
        .bind(id.canonical())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| {
                let metadata_text: String = row.try_get("metadata")?;
                Ok(MetadataEventRecord {
                    payload_id: *id,
                    ts_ms: row.try_get::<i64, _>("ts_ms")?.max(0) as u64,
                    metadata: serde_json::from_str(&metadata_text)
                        .map_err(|e| Error::Corruption(format!("event json: {}", e)))?,
                    source: row.try_get("source")?,
                    version: row.try_get::<i64, _>("version")?.max(0) as u64,
                })
            })
            .collect()
    }

    async fn insert_lineage(&mut self, edge: &LineageEdgeRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO payload_lineage(parent_id, child_id, operation, role, parameters, created_at_ms)
             VALUES($1, $2, $3, $4, $5, $6)",
        )
        .bind(edge.parent_id.canonical())
        .bind(edge.child_id.canonical())
        .bind(&edge.operation)
        .bind(&edge.role)
        .bind(&edge.parameters)
        .bind(to_i64(edge.created_at_ms, "created_at_ms")?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_parents(&mut self, id: &PayloadId) -> Result<Vec<LineageEdgeRecord>> {
        let rows = sqlx::query(
            "SELECT parent_id, child_id, operation, role, parameters, created_at_ms
             FROM payload_lineage WHERE child_id = $1",
        )
        .bind(id.canonical())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(row_to_edge).collect()
    }

    async fn get_children(&mut self, id: &PayloadId) -> Result<Vec<LineageEdgeRecord>> {
        let rows = sqlx::query(
            "SELECT parent_id, child_id, operation, role, parameters, created_at_ms
             FROM payload_lineage WHERE parent_id = $1",
        )
        .bind(id.canonical())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(row_to_edge).collect()
    }

    async fn create_stream(&mut self, record: &mut StreamRecord) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO streams(namespace, name, retention_max_entries, retention_max_age_sec, created_at_ms)
             VALUES($1, $2, $3, $4, $5) RETURNING stream_id",
        )
        .bind(&record.namespace)
        .bind(&record.name)
        .bind(opt_to_i64(record.retention_max_entries, "retention_max_entries")?)
        .bind(opt_to_i64(record.retention_max_age_sec, "retention_max_age_sec")?)
        .bind(to_i64(record.created_at_ms, "created_at_ms")?)
        .fetch_one(&mut *self.tx)
        .await;
        match result {
            Ok(row) => {
                record.stream_id = row.try_get::<i64, _>("stream_id")?.max(0) as u64;
                Ok(())
            }
            Err(e) => {
                let translated: Error = e.into();
                if matches!(translated, Error::AlreadyExists(_)) {
                    Err(Error::AlreadyExists(format!(
                        "stream {}/{}",
                        record.namespace, record.name
                    )))
                } else {
                    Err(translated)
                }
            }
        }
    }

    async fn get_stream_by_name(
        &mut self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StreamRecord>> {
        let row = sqlx::query(
            "SELECT stream_id, namespace, name, retention_max_entries, retention_max_age_sec, created_at_ms
             FROM streams WHERE namespace = $1 AND name = $2",
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(row_to_stream).transpose()
    }

    async fn get_stream_by_id(&mut self, stream_id: u64) -> Result<Option<StreamRecord>> {
        let row = sqlx::query(
            "SELECT stream_id, namespace, name, retention_max_entries, retention_max_age_sec, created_at_ms
             FROM streams WHERE stream_id = $1",
        )
        .bind(to_i64(stream_id, "stream_id")?)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(row_to_stream).transpose()
    }

    async fn delete_stream_by_name(&mut self, namespace: &str, name: &str) -> Result<()> {
        if let Some(stream) = self.get_stream_by_name(namespace, name).await? {
            self.delete_stream_by_id(stream.stream_id).await?;
        }
        Ok(())
    }

    async fn delete_stream_by_id(&mut self, stream_id: u64) -> Result<()> {
        let sid = to_i64(stream_id, "stream_id")?;
        sqlx::query("DELETE FROM stream_entries WHERE stream_id = $1")
            .bind(sid)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM stream_consumer_offsets WHERE stream_id = $1")
            .bind(sid)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM streams WHERE stream_id = $1")
            .bind(sid)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn append_entries(
        &mut self,
        stream_id: u64,
        entries: &mut [StreamEntryRecord],
    ) -> Result<()> {
        self.require_stream(stream_id).await?;
        let sid = to_i64(stream_id, "stream_id")?;
        let row = sqlx::query(
            "SELECT MAX(entry_offset) AS max_offset FROM stream_entries WHERE stream_id = $1",
        )
        .bind(sid)
        .fetch_one(&mut *self.tx)
        .await?;
        let max: Option<i64> = row.try_get("max_offset")?;
        let mut next = max.map(|m| m + 1).unwrap_or(0);

        for entry in entries.iter_mut() {
            entry.stream_id = stream_id;
            entry.offset = next.max(0) as u64;
            sqlx::query(
                "INSERT INTO stream_entries(stream_id, entry_offset, payload_uuid, event_time_ms, append_time_ms, duration_ns, tags)
                 VALUES($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(sid)
            .bind(next)
            .bind(entry.payload_uuid.canonical())
            .bind(opt_to_i64(entry.event_time_ms, "event_time_ms")?)
            .bind(to_i64(entry.append_time_ms, "append_time_ms")?)
            .bind(opt_to_i64(entry.duration_ns, "duration_ns")?)
            .bind(&entry.tags)
            .execute(&mut *self.tx)
            .await?;
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
        self.require_stream(stream_id).await?;
        let limit = max_entries
            .map(|m| to_i64(m, "max_entries"))
            .transpose()?
            .unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT stream_id, entry_offset, payload_uuid, event_time_ms, append_time_ms, duration_ns, tags
             FROM stream_entries
             WHERE stream_id = $1 AND entry_offset >= $2 AND append_time_ms >= $3
             ORDER BY entry_offset LIMIT $4",
        )
        .bind(to_i64(stream_id, "stream_id")?)
        .bind(to_i64(start_offset, "start_offset")?)
        .bind(to_i64(min_append_time_ms.unwrap_or(0), "min_append_time_ms")?)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn read_entry_range(
        &mut self,
        stream_id: u64,
        start_offset: u64,
        end_offset_inclusive: u64,
    ) -> Result<Vec<StreamEntryRecord>> {
        self.require_stream(stream_id).await?;
        let rows = sqlx::query(
            "SELECT stream_id, entry_offset, payload_uuid, event_time_ms, append_time_ms, duration_ns, tags
             FROM stream_entries
             WHERE stream_id = $1 AND entry_offset >= $2 AND entry_offset <= $3
             ORDER BY entry_offset",
        )
        .bind(to_i64(stream_id, "stream_id")?)
        .bind(to_i64(start_offset, "start_offset")?)
        .bind(to_i64(end_offset_inclusive, "end_offset")?)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn max_offset(&mut self, stream_id: u64) -> Result<Option<u64>> {
        let row = sqlx::query(
            "SELECT MAX(entry_offset) AS max_offset FROM stream_entries WHERE stream_id = $1",
        )
        .bind(to_i64(stream_id, "stream_id")?)
        .fetch_one(&mut *self.tx)
        .await?;
        let max: Option<i64> = row.try_get("max_offset")?;
        Ok(max.map(|m| m.max(0) as u64))
    }

    async fn trim_to_max_count(&mut self, stream_id: u64, keep_newest: u64) -> Result<u64> {
        let sid = to_i64(stream_id, "stream_id")?;
        let result = sqlx::query(
            "DELETE FROM stream_entries
             WHERE stream_id = $1 AND entry_offset NOT IN (
                 SELECT entry_offset FROM stream_entries
                 WHERE stream_id = $1 ORDER BY entry_offset DESC LIMIT $2)",
        )
        .bind(sid)
        .bind(to_i64(keep_newest, "keep_newest")?)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_entries_older_than(
        &mut self,
        stream_id: u64,
        min_append_time_ms: u64,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM stream_entries WHERE stream_id = $1 AND append_time_ms < $2",
        )
        .bind(to_i64(stream_id, "stream_id")?)
        .bind(to_i64(min_append_time_ms, "min_append_time_ms")?)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit_consumer_offset(&mut self, record: &ConsumerOffsetRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO stream_consumer_offsets(stream_id, consumer_group, committed_offset, updated_at_ms)
             VALUES($1, $2, $3, $4)
             ON CONFLICT(stream_id, consumer_group) DO UPDATE SET
               committed_offset = excluded.committed_offset,
               updated_at_ms = excluded.updated_at_ms",
        )
        .bind(to_i64(record.stream_id, "stream_id")?)
        .bind(&record.consumer_group)
        .bind(to_i64(record.offset, "offset")?)
        .bind(to_i64(record.updated_at_ms, "updated_at_ms")?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_consumer_offset(
        &mut self,
        stream_id: u64,
        consumer_group: &str,
    ) -> Result<Option<ConsumerOffsetRecord>> {
        let row = sqlx::query(
            "SELECT stream_id, consumer_group, committed_offset, updated_at_ms
             FROM stream_consumer_offsets WHERE stream_id = $1 AND consumer_group = $2",
        )
        .bind(to_i64(stream_id, "stream_id")?)
        .bind(consumer_group)
        .fetch_optional(&mut *self.tx)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(ConsumerOffsetRecord {
                stream_id,
                consumer_group: consumer_group.to_string(),
                offset: row.try_get::<i64, _>("committed_offset")?.max(0) as u64,
                updated_at_ms: row.try_get::<i64, _>("updated_at_ms")?.max(0) as u64,
            })),
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let PostgresTx { tx } = *self;
        tx.commit().await.map_err(Error::from)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let PostgresTx { tx } = *self;
        tx.rollback().await.map_err(Error::from)
    }
}
