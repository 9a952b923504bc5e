//! Repository implementing the op log store contract over SQLite.

use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::debug;

use daystack_core::errors::Result;
use daystack_core::sync::{
    CursorKind, CycleRecord, EngineStatus, OpLogStore, StoredOp, SyncCursor, SyncOp,
    VectorClock, RECENT_OPS_CAP,
};

use crate::db::{DbConnection, DbPool};
use crate::errors::StorageError;
use crate::schema::{op_log, sync_applied_ops, sync_client, sync_cursor, sync_engine_state};

use super::model::{
    OpLogRowDB, SyncAppliedOpDB, SyncClientRowDB, SyncCursorRowDB, SyncEngineStateRowDB,
};

fn enum_to_db<T: serde::Serialize>(value: &T) -> std::result::Result<String, StorageError> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

fn enum_from_db<T: serde::de::DeserializeOwned>(
    value: &str,
) -> std::result::Result<T, StorageError> {
    Ok(serde_json::from_str(&format!("\"{}\"", value))?)
}

fn to_row(
    op: &SyncOp,
    local_seq: i64,
    is_synced: bool,
    applied_remote: bool,
) -> std::result::Result<OpLogRowDB, StorageError> {
    Ok(OpLogRowDB {
        id: op.id.clone(),
        client_id: op.client_id.clone(),
        timestamp: op.timestamp,
        vector_clock: serde_json::to_string(&op.vector_clock)?,
        schema_version: op.schema_version as i32,
        entity_type: enum_to_db(&op.entity_type)?,
        entity_id: op.entity_id.clone(),
        op_type: enum_to_db(&op.op_type)?,
        action_type: op.action_type.clone(),
        payload: serde_json::to_string(&op.payload)?,
        local_seq,
        is_synced: i32::from(is_synced),
        applied_remote: i32::from(applied_remote),
    })
}

fn from_row(row: OpLogRowDB) -> std::result::Result<StoredOp, StorageError> {
    Ok(StoredOp {
        op: SyncOp {
            id: row.id,
            client_id: row.client_id,
            timestamp: row.timestamp,
            vector_clock: serde_json::from_str(&row.vector_clock)?,
            schema_version: row.schema_version as u32,
            entity_type: enum_from_db(&row.entity_type)?,
            entity_id: row.entity_id,
            op_type: enum_from_db(&row.op_type)?,
            action_type: row.action_type,
            payload: serde_json::from_str(&row.payload)?,
        },
        local_seq: row.local_seq,
        is_synced: row.is_synced != 0,
        applied_remote: row.applied_remote != 0,
    })
}

fn next_local_seq(conn: &mut SqliteConnection) -> std::result::Result<i64, StorageError> {
    let max_seq: Option<i64> = op_log::table
        .select(diesel::dsl::max(op_log::local_seq))
        .first(conn)?;
    Ok(max_seq.unwrap_or(0) + 1)
}

fn insert_op(
    conn: &mut SqliteConnection,
    op: &SyncOp,
    is_synced: bool,
    applied_remote: bool,
) -> std::result::Result<bool, StorageError> {
    let exists = op_log::table
        .find(&op.id)
        .first::<OpLogRowDB>(conn)
        .optional()?
        .is_some();
    if exists {
        return Ok(false);
    }
    let seq = next_local_seq(conn)?;
    let row = to_row(op, seq, is_synced, applied_remote)?;
    diesel::insert_into(op_log::table)
        .values(&row)
        .execute(conn)?;
    Ok(true)
}

fn merge_observed_clock(
    conn: &mut SqliteConnection,
    clock: &VectorClock,
) -> std::result::Result<(), StorageError> {
    let now = Utc::now().to_rfc3339();
    let existing = sync_client::table
        .find(1)
        .first::<SyncClientRowDB>(conn)
        .optional()?;
    match existing {
        Some(mut row) => {
            let mut observed: VectorClock = serde_json::from_str(&row.observed_clock)?;
            observed.merge(clock);
            row.observed_clock = serde_json::to_string(&observed)?;
            row.updated_at = now;
            diesel::update(sync_client::table.find(1))
                .set(&row)
                .execute(conn)?;
        }
        None => {
            let row = SyncClientRowDB {
                id: 1,
                client_id: String::new(),
                observed_clock: serde_json::to_string(clock)?,
                updated_at: now,
            };
            diesel::insert_into(sync_client::table)
                .values(&row)
                .execute(conn)?;
        }
    }
    Ok(())
}

fn engine_row(
    conn: &mut SqliteConnection,
) -> std::result::Result<SyncEngineStateRowDB, StorageError> {
    let existing = sync_engine_state::table
        .find(1)
        .first::<SyncEngineStateRowDB>(conn)
        .optional()?;
    match existing {
        Some(row) => Ok(row),
        None => {
            let row = SyncEngineStateRowDB {
                id: 1,
                last_push_at: None,
                last_pull_at: None,
                last_error: None,
                consecutive_failures: 0,
                next_retry_at: None,
                last_cycle_status: None,
                last_cycle_duration_ms: None,
            };
            diesel::insert_into(sync_engine_state::table)
                .values(&row)
                .execute(conn)?;
            Ok(row)
        }
    }
}

/// Durable op log backed by a SQLite pool.
pub struct SqliteOpLog {
    pool: DbPool,
}

impl SqliteOpLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<DbConnection> {
        Ok(self.pool.get().map_err(StorageError::from)?)
    }
}

impl OpLogStore for SqliteOpLog {
    fn append(&self, op: &SyncOp) -> Result<()> {
        let mut conn = self.conn()?;
        conn.transaction::<_, StorageError, _>(|conn| {
            if insert_op(conn, op, false, false)? {
                merge_observed_clock(conn, &op.vector_clock)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    fn append_batch(&self, ops: &[SyncOp]) -> Result<()> {
        let mut conn = self.conn()?;
        conn.transaction::<_, StorageError, _>(|conn| {
            for op in ops {
                if insert_op(conn, op, false, false)? {
                    merge_observed_clock(conn, &op.vector_clock)?;
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<StoredOp>> {
        let mut conn = self.conn()?;
        let row = op_log::table
            .find(id)
            .first::<OpLogRowDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(row.map(from_row).transpose().map_err(StorageError::from)?)
    }

    fn get_unsynced(&self) -> Result<Vec<SyncOp>> {
        let mut conn = self.conn()?;
        let rows = op_log::table
            .filter(op_log::is_synced.eq(0))
            .order(op_log::local_seq.asc())
            .load::<OpLogRowDB>(&mut conn)
            .map_err(StorageError::from)?;
        let mut ops = Vec::with_capacity(rows.len());
        for row in rows {
            ops.push(from_row(row).map_err(StorageError::from)?.op);
        }
        Ok(ops)
    }

    fn get_recent(&self, n: usize) -> Result<Vec<SyncOp>> {
        let mut conn = self.conn()?;
        let rows = op_log::table
            .order(op_log::local_seq.desc())
            .limit(n as i64)
            .load::<OpLogRowDB>(&mut conn)
            .map_err(StorageError::from)?;
        let mut ops = Vec::with_capacity(rows.len());
        for row in rows.into_iter().rev() {
            ops.push(from_row(row).map_err(StorageError::from)?.op);
        }
        Ok(ops)
    }

    fn mark_synced(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        conn.transaction::<_, StorageError, _>(|conn| {
            let found: i64 = op_log::table
                .filter(op_log::id.eq_any(ids))
                .count()
                .get_result(conn)?;
            if found as usize != ids.len() {
                return Err(StorageError::invariant(format!(
                    "mark_synced: {} of {} ids unknown",
                    ids.len() - found as usize,
                    ids.len()
                )));
            }
            diesel::update(op_log::table.filter(op_log::id.eq_any(ids)))
                .set(op_log::is_synced.eq(1))
                .execute(conn)?;
            Ok(())
        })?;
        Ok(())
    }

    fn has_applied(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let row = sync_applied_ops::table
            .find(id)
            .first::<SyncAppliedOpDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(row.is_some())
    }

    fn record_applied(&self, ops: &[SyncOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        conn.transaction::<_, StorageError, _>(|conn| {
            let now = Utc::now().to_rfc3339();
            let mut merged = VectorClock::new();
            for op in ops {
                if !insert_op(conn, op, true, true)? {
                    diesel::update(op_log::table.find(&op.id))
                        .set((op_log::is_synced.eq(1), op_log::applied_remote.eq(1)))
                        .execute(conn)?;
                }
                diesel::insert_or_ignore_into(sync_applied_ops::table)
                    .values(&SyncAppliedOpDB {
                        op_id: op.id.clone(),
                        applied_at: now.clone(),
                    })
                    .execute(conn)?;
                merged.merge(&op.vector_clock);
            }
            merge_observed_clock(conn, &merged)?;
            Ok(())
        })?;
        Ok(())
    }

    fn discard_unsynced(&self) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let dropped = conn.transaction::<_, StorageError, _>(|conn| {
            let ids: Vec<String> = op_log::table
                .filter(op_log::is_synced.eq(0))
                .order(op_log::local_seq.asc())
                .select(op_log::id)
                .load(conn)?;
            diesel::delete(op_log::table.filter(op_log::is_synced.eq(0))).execute(conn)?;
            Ok(ids)
        })?;
        Ok(dropped)
    }

    fn compact(&self, retention_ms: i64) -> Result<usize> {
        let mut conn = self.conn()?;
        let dropped = conn.transaction::<_, StorageError, _>(|conn| {
            // Seq of the oldest op inside the protected recent window.
            let floor: Option<i64> = op_log::table
                .order(op_log::local_seq.desc())
                .offset(RECENT_OPS_CAP as i64 - 1)
                .limit(1)
                .select(op_log::local_seq)
                .first(conn)
                .optional()?;
            let Some(floor) = floor else {
                return Ok(0);
            };
            let cutoff = Utc::now().timestamp_millis() - retention_ms;
            let dropped = diesel::delete(
                op_log::table
                    .filter(op_log::local_seq.lt(floor))
                    .filter(op_log::is_synced.eq(1))
                    .filter(op_log::timestamp.lt(cutoff)),
            )
            .execute(conn)?;
            Ok(dropped)
        })?;
        if dropped > 0 {
            debug!("[OpLog] compacted {} synced ops", dropped);
        }
        Ok(dropped)
    }

    fn get_cursor(&self, kind: CursorKind) -> Result<SyncCursor> {
        let mut conn = self.conn()?;
        let key = enum_to_db(&kind).map_err(StorageError::from)?;
        let row = sync_cursor::table
            .find(&key)
            .first::<SyncCursorRowDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        match row {
            Some(row) => Ok(serde_json::from_str(&row.cursor).map_err(StorageError::from)?),
            None => Ok(SyncCursor::initial(kind)),
        }
    }

    fn set_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let mut conn = self.conn()?;
        let row = SyncCursorRowDB {
            kind: enum_to_db(&cursor.kind()).map_err(StorageError::from)?,
            cursor: serde_json::to_string(cursor).map_err(StorageError::from)?,
            updated_at: Utc::now().to_rfc3339(),
        };
        diesel::replace_into(sync_cursor::table)
            .values(&row)
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn get_client_id(&self) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        let row = sync_client::table
            .find(1)
            .first::<SyncClientRowDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(row.map(|r| r.client_id).filter(|id| !id.is_empty()))
    }

    fn set_client_id(&self, id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        conn.transaction::<_, StorageError, _>(|conn| {
            let now = Utc::now().to_rfc3339();
            let existing = sync_client::table
                .find(1)
                .first::<SyncClientRowDB>(conn)
                .optional()?;
            let row = match existing {
                Some(mut row) => {
                    row.client_id = id.to_string();
                    row.updated_at = now;
                    row
                }
                None => SyncClientRowDB {
                    id: 1,
                    client_id: id.to_string(),
                    observed_clock: "{}".to_string(),
                    updated_at: now,
                },
            };
            diesel::replace_into(sync_client::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })?;
        Ok(())
    }

    fn observed_clock(&self) -> Result<VectorClock> {
        let mut conn = self.conn()?;
        let row = sync_client::table
            .find(1)
            .first::<SyncClientRowDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        match row {
            Some(row) => {
                Ok(serde_json::from_str(&row.observed_clock).map_err(StorageError::from)?)
            }
            None => Ok(VectorClock::new()),
        }
    }

    fn clear_all(&self) -> Result<()> {
        let mut conn = self.conn()?;
        conn.transaction::<_, StorageError, _>(|conn| {
            diesel::delete(op_log::table).execute(conn)?;
            diesel::delete(sync_applied_ops::table).execute(conn)?;
            diesel::delete(sync_cursor::table).execute(conn)?;
            if let Some(mut row) = sync_client::table
                .find(1)
                .first::<SyncClientRowDB>(conn)
                .optional()?
            {
                row.observed_clock = "{}".to_string();
                row.updated_at = Utc::now().to_rfc3339();
                diesel::update(sync_client::table.find(1))
                    .set(&row)
                    .execute(conn)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    fn engine_status(&self) -> Result<EngineStatus> {
        let mut conn = self.conn()?;
        let row = conn
            .transaction::<_, StorageError, _>(|conn| engine_row(conn))?;
        Ok(EngineStatus {
            last_push_at: row.last_push_at,
            last_pull_at: row.last_pull_at,
            last_error: row.last_error,
            consecutive_failures: row.consecutive_failures,
            next_retry_at: row.next_retry_at,
            last_cycle_status: row.last_cycle_status,
            last_cycle_duration_ms: row.last_cycle_duration_ms,
        })
    }

    fn record_cycle_outcome(&self, record: &CycleRecord) -> Result<()> {
        let mut conn = self.conn()?;
        conn.transaction::<_, StorageError, _>(|conn| {
            let mut row = engine_row(conn)?;
            let now = Utc::now().to_rfc3339();
            if record.pushed_count > 0 {
                row.last_push_at = Some(now.clone());
            }
            if record.pulled_count > 0 {
                row.last_pull_at = Some(now);
            }
            row.last_cycle_status = Some(record.status.clone());
            row.last_cycle_duration_ms = Some(record.duration_ms);
            row.next_retry_at = record.next_retry_at.clone();
            if record.next_retry_at.is_none() {
                row.consecutive_failures = 0;
                row.last_error = None;
            }
            diesel::update(sync_engine_state::table.find(1))
                .set(&row)
                .execute(conn)?;
            Ok(())
        })?;
        Ok(())
    }

    fn record_engine_error(&self, message: &str) -> Result<()> {
        let mut conn = self.conn()?;
        conn.transaction::<_, StorageError, _>(|conn| {
            let mut row = engine_row(conn)?;
            row.last_error = Some(message.to_string());
            row.consecutive_failures += 1;
            diesel::update(sync_engine_state::table.find(1))
                .set(&row)
                .execute(conn)?;
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use daystack_core::sync::{EntityKind, OpType, CURRENT_SCHEMA_VERSION};

    fn store() -> SqliteOpLog {
        let pool = create_pool(":memory:").expect("pool");
        SqliteOpLog::new(pool)
    }

    fn op(id: &str, client: &str, component: u64, timestamp: i64) -> SyncOp {
        SyncOp {
            id: id.to_string(),
            client_id: client.to_string(),
            timestamp,
            vector_clock: [(client.to_string(), component)].into_iter().collect(),
            schema_version: CURRENT_SCHEMA_VERSION,
            entity_type: EntityKind::Task,
            entity_id: "t1".to_string(),
            op_type: OpType::LwwUpdate,
            action_type: "[TASK] LWW Update".to_string(),
            payload: serde_json::json!({ "id": "t1", "title": "x" }),
        }
    }

    #[test]
    fn append_round_trips_and_is_idempotent() {
        let log = store();
        let o = op("op-1", "a", 1, 100);
        log.append(&o).expect("append");
        log.append(&o).expect("append again");

        let stored = log.get("op-1").expect("get").expect("present");
        assert_eq!(stored.op, o);
        assert!(!stored.is_synced);
        assert_eq!(stored.local_seq, 1);
        assert_eq!(log.get_recent(10).expect("recent").len(), 1);
    }

    #[test]
    fn unsynced_is_insertion_ordered() {
        let log = store();
        log.append(&op("op-1", "a", 1, 100)).expect("1");
        log.append(&op("op-2", "a", 2, 101)).expect("2");
        log.append(&op("op-3", "a", 3, 102)).expect("3");
        log.mark_synced(&["op-2".to_string()]).expect("mark");

        let ids: Vec<String> = log
            .get_unsynced()
            .expect("unsynced")
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids, vec!["op-1", "op-3"]);
    }

    #[test]
    fn mark_synced_rejects_unknown_ids_atomically() {
        let log = store();
        log.append(&op("op-1", "a", 1, 100)).expect("1");
        let err = log
            .mark_synced(&["op-1".to_string(), "ghost".to_string()])
            .expect_err("unknown id");
        assert!(err.to_string().contains("mark_synced"));
        assert_eq!(log.get_unsynced().expect("unsynced").len(), 1);
    }

    #[test]
    fn record_applied_dedups_and_merges_clock() {
        let log = store();
        let remote = op("op-r", "peer", 7, 100);
        log.record_applied(std::slice::from_ref(&remote))
            .expect("record");
        log.record_applied(std::slice::from_ref(&remote))
            .expect("record again");

        assert!(log.has_applied("op-r").expect("has"));
        assert_eq!(log.observed_clock().expect("clock").get("peer"), 7);
        let stored = log.get("op-r").expect("get").expect("present");
        assert!(stored.is_synced);
        assert!(stored.applied_remote);
    }

    #[test]
    fn cursor_round_trips_per_kind() {
        let log = store();
        assert_eq!(
            log.get_cursor(CursorKind::File).expect("initial"),
            SyncCursor::initial(CursorKind::File)
        );

        let cursor = SyncCursor::File {
            last_sync_version: 9,
            last_mod_rev: Some("etag".to_string()),
        };
        log.set_cursor(&cursor).expect("set");
        assert_eq!(log.get_cursor(CursorKind::File).expect("get"), cursor);
        // The other kind is untouched.
        assert_eq!(
            log.get_cursor(CursorKind::ServerSeq).expect("other"),
            SyncCursor::initial(CursorKind::ServerSeq)
        );
    }

    #[test]
    fn client_id_survives_clear_all() {
        let log = store();
        log.set_client_id("client-a").expect("set id");
        log.append(&op("op-1", "a", 1, 100)).expect("append");
        log.set_cursor(&SyncCursor::ServerSeq { last_server_seq: 3 })
            .expect("cursor");

        log.clear_all().expect("clear");
        assert_eq!(
            log.get_client_id().expect("id"),
            Some("client-a".to_string())
        );
        assert!(log.get_recent(10).expect("recent").is_empty());
        assert!(log.observed_clock().expect("clock").is_empty());
        assert_eq!(
            log.get_cursor(CursorKind::ServerSeq).expect("cursor"),
            SyncCursor::initial(CursorKind::ServerSeq)
        );
    }

    #[test]
    fn discard_unsynced_returns_dropped_ids() {
        let log = store();
        log.append(&op("op-1", "a", 1, 100)).expect("1");
        log.append(&op("op-2", "a", 2, 101)).expect("2");
        log.mark_synced(&["op-1".to_string()]).expect("mark");

        let dropped = log.discard_unsynced().expect("discard");
        assert_eq!(dropped, vec!["op-2"]);
        assert!(log.get("op-1").expect("get").is_some());
        assert!(log.get("op-2").expect("get").is_none());
    }

    #[test]
    fn engine_status_tracks_failures_and_outcomes() {
        let log = store();
        log.record_engine_error("boom").expect("error");
        log.record_engine_error("boom again").expect("error 2");
        let status = log.engine_status().expect("status");
        assert_eq!(status.consecutive_failures, 2);
        assert_eq!(status.last_error.as_deref(), Some("boom again"));

        log.record_cycle_outcome(&CycleRecord {
            status: "in_sync".to_string(),
            pushed_count: 1,
            pulled_count: 0,
            duration_ms: 42,
            next_retry_at: None,
        })
        .expect("outcome");
        let status = log.engine_status().expect("status");
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());
        assert!(status.last_push_at.is_some());
        assert_eq!(status.last_cycle_status.as_deref(), Some("in_sync"));
    }

    #[test]
    fn observed_clock_merges_appends_and_applies() {
        let log = store();
        log.append(&op("op-1", "a", 2, 100)).expect("append");
        log.record_applied(&[op("op-2", "b", 5, 101)]).expect("apply");
        let clock = log.observed_clock().expect("clock");
        assert_eq!(clock.get("a"), 2);
        assert_eq!(clock.get("b"), 5);
    }
}
