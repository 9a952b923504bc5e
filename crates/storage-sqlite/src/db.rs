//! Connection pool setup and schema bootstrap.

use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;

use crate::errors::StorageError;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS op_log (
    id TEXT PRIMARY KEY NOT NULL,
    client_id TEXT NOT NULL,
    timestamp BIGINT NOT NULL,
    vector_clock TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    op_type TEXT NOT NULL,
    action_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    local_seq BIGINT NOT NULL,
    is_synced INTEGER NOT NULL DEFAULT 0,
    applied_remote INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_op_log_local_seq ON op_log (local_seq);
CREATE INDEX IF NOT EXISTS idx_op_log_unsynced ON op_log (is_synced, local_seq);

CREATE TABLE IF NOT EXISTS sync_applied_ops (
    op_id TEXT PRIMARY KEY NOT NULL,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_cursor (
    kind TEXT PRIMARY KEY NOT NULL,
    cursor TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_client (
    id INTEGER PRIMARY KEY NOT NULL,
    client_id TEXT NOT NULL,
    observed_clock TEXT NOT NULL DEFAULT '{}',
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_engine_state (
    id INTEGER PRIMARY KEY NOT NULL,
    last_push_at TEXT,
    last_pull_at TEXT,
    last_error TEXT,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    next_retry_at TEXT,
    last_cycle_status TEXT,
    last_cycle_duration_ms BIGINT
);
"#;

/// Build a pool against `database_url` and bootstrap the schema.
pub fn create_pool(database_url: &str) -> Result<DbPool, StorageError> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(if database_url.contains(":memory:") {
            // An in-memory database lives and dies with its connection.
            1
        } else {
            8
        })
        .build(manager)?;

    let mut conn = pool.get()?;
    conn.batch_execute(SCHEMA_SQL)?;
    Ok(pool)
}
