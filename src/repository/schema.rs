//! On-disk schema shared by the durable repository backends.
//!
//! Each backend bootstraps its schema on first use and records the
//! applied version in `payload_schema_migrations`. The statements are
//! kept per-dialect because the id-assignment and upsert syntax differ;
//! the column sets are identical.

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 1;

/// SQLite dialect, one statement per element.
pub const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS payload (
        id TEXT PRIMARY KEY,
        tier INTEGER NOT NULL,
        state INTEGER NOT NULL,
        size_bytes INTEGER NOT NULL,
        version INTEGER NOT NULL,
        expires_at_ms INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS payload_metadata (
        id TEXT PRIMARY KEY,
        json TEXT NOT NULL,
        schema TEXT NOT NULL DEFAULT '',
        updated_at_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS payload_metadata_events (
        payload_id TEXT NOT NULL,
        ts_ms INTEGER NOT NULL,
        metadata TEXT NOT NULL,
        source TEXT NOT NULL DEFAULT '',
        version INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_metadata_events_payload
        ON payload_metadata_events(payload_id, ts_ms)",
    "CREATE TABLE IF NOT EXISTS payload_lineage (
        parent_id TEXT NOT NULL,
        child_id TEXT NOT NULL,
        operation TEXT NOT NULL DEFAULT '',
        role TEXT NOT NULL DEFAULT '',
        parameters TEXT NOT NULL DEFAULT '',
        created_at_ms INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_lineage_parent ON payload_lineage(parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_lineage_child ON payload_lineage(child_id)",
    "CREATE TABLE IF NOT EXISTS streams (
        stream_id INTEGER PRIMARY KEY AUTOINCREMENT,
        namespace TEXT NOT NULL,
        name TEXT NOT NULL,
        retention_max_entries INTEGER,
        retention_max_age_sec INTEGER,
        created_at_ms INTEGER NOT NULL,
        UNIQUE(namespace, name)
    )",
    "CREATE TABLE IF NOT EXISTS stream_entries (
        stream_id INTEGER NOT NULL,
        entry_offset INTEGER NOT NULL,
        payload_uuid TEXT NOT NULL,
        event_time_ms INTEGER,
        append_time_ms INTEGER NOT NULL,
        duration_ns INTEGER,
        tags TEXT NOT NULL DEFAULT '',
        PRIMARY KEY(stream_id, entry_offset)
    )",
    "CREATE TABLE IF NOT EXISTS stream_consumer_offsets (
        stream_id INTEGER NOT NULL,
        consumer_group TEXT NOT NULL,
        committed_offset INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL,
        PRIMARY KEY(stream_id, consumer_group)
    )",
    "CREATE TABLE IF NOT EXISTS payload_schema_migrations (
        version INTEGER PRIMARY KEY,
        applied_at_ms INTEGER NOT NULL
    )",
];

/// Postgres dialect.
pub const POSTGRES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS payload (
        id TEXT PRIMARY KEY,
        tier INTEGER NOT NULL,
        state INTEGER NOT NULL,
        size_bytes BIGINT NOT NULL,
        version BIGINT NOT NULL,
        expires_at_ms BIGINT
    )",
    "CREATE TABLE IF NOT EXISTS payload_metadata (
        id TEXT PRIMARY KEY,
        json TEXT NOT NULL,
        schema TEXT NOT NULL DEFAULT '',
        updated_at_ms BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS payload_metadata_events (
        payload_id TEXT NOT NULL,
        ts_ms BIGINT NOT NULL,
        metadata TEXT NOT NULL,
        source TEXT NOT NULL DEFAULT '',
        version BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_metadata_events_payload
        ON payload_metadata_events(payload_id, ts_ms)",
    "CREATE TABLE IF NOT EXISTS payload_lineage (
        parent_id TEXT NOT NULL,
        child_id TEXT NOT NULL,
        operation TEXT NOT NULL DEFAULT '',
        role TEXT NOT NULL DEFAULT '',
        parameters TEXT NOT NULL DEFAULT '',
        created_at_ms BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_lineage_parent ON payload_lineage(parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_lineage_child ON payload_lineage(child_id)",
    "CREATE TABLE IF NOT EXISTS streams (
        stream_id BIGSERIAL PRIMARY KEY,
        namespace TEXT NOT NULL,
        name TEXT NOT NULL,
        retention_max_entries BIGINT,
        retention_max_age_sec BIGINT,
        created_at_ms BIGINT NOT NULL,
        UNIQUE(namespace, name)
    )",
    "CREATE TABLE IF NOT EXISTS stream_entries (
        stream_id BIGINT NOT NULL,
        entry_offset BIGINT NOT NULL,
        payload_uuid TEXT NOT NULL,
        event_time_ms BIGINT,
        append_time_ms BIGINT NOT NULL,
        duration_ns BIGINT,
        tags TEXT NOT NULL DEFAULT '',
        PRIMARY KEY(stream_id, entry_offset)
    )",
    "CREATE TABLE IF NOT EXISTS stream_consumer_offsets (
        stream_id BIGINT NOT NULL,
        consumer_group TEXT NOT NULL,
        committed_offset BIGINT NOT NULL,
        updated_at_ms BIGINT NOT NULL,
        PRIMARY KEY(stream_id, consumer_group)
    )",
    "CREATE TABLE IF NOT EXISTS payload_schema_migrations (
        version BIGINT PRIMARY KEY,
        applied_at_ms BIGINT NOT NULL
    )",
];
