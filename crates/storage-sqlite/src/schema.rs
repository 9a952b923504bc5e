//! Diesel table definitions for the sync log and its ancillary state.

diesel::table! {
    op_log (id) {
        id -> Text,
        client_id -> Text,
        timestamp -> BigInt,
        vector_clock -> Text,
        schema_version -> Integer,
        entity_type -> Text,
        entity_id -> Text,
        op_type -> Text,
        action_type -> Text,
        payload -> Text,
        local_seq -> BigInt,
        is_synced -> Integer,
        applied_remote -> Integer,
    }
}

diesel::table! {
    sync_applied_ops (op_id) {
        op_id -> Text,
        applied_at -> Text,
    }
}

diesel::table! {
    sync_cursor (kind) {
        kind -> Text,
        cursor -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    sync_client (id) {
        id -> Integer,
        client_id -> Text,
        observed_clock -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    sync_engine_state (id) {
        id -> Integer,
        last_push_at -> Nullable<Text>,
        last_pull_at -> Nullable<Text>,
        last_error -> Nullable<Text>,
        consecutive_failures -> Integer,
        next_retry_at -> Nullable<Text>,
        last_cycle_status -> Nullable<Text>,
        last_cycle_duration_ms -> Nullable<BigInt>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    op_log,
    sync_applied_ops,
    sync_cursor,
    sync_client,
    sync_engine_state,
);
