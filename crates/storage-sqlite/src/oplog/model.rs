//! Database models for the op log tables.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(table_name = crate::schema::op_log)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct OpLogRowDB {
    pub id: String,
    pub client_id: String,
    pub timestamp: i64,
    pub vector_clock: String,
    pub schema_version: i32,
    pub entity_type: String,
    pub entity_id: String,
    pub op_type: String,
    pub action_type: String,
    pub payload: String,
    pub local_seq: i64,
    pub is_synced: i32,
    pub applied_remote: i32,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(op_id))]
#[diesel(table_name = crate::schema::sync_applied_ops)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncAppliedOpDB {
    pub op_id: String,
    pub applied_at: String,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(kind))]
#[diesel(table_name = crate::schema::sync_cursor)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncCursorRowDB {
    pub kind: String,
    pub cursor: String,
    pub updated_at: String,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(table_name = crate::schema::sync_client)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncClientRowDB {
    pub id: i32,
    pub client_id: String,
    pub observed_clock: String,
    pub updated_at: String,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(table_name = crate::schema::sync_engine_state)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct SyncEngineStateRowDB {
    pub id: i32,
    pub last_push_at: Option<String>,
    pub last_pull_at: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: i32,
    pub next_retry_at: Option<String>,
    pub last_cycle_status: Option<String>,
    pub last_cycle_duration_ms: Option<i64>,
}
