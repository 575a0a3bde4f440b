//! Esquema Diesel del ledger (declarado a mano; reemplazable con
//! `diesel print-schema`).
//!
//! Constraints que portan invariantes:
//! - `token_outcomes.token_id` PK → outcome terminal único por token.
//! - `node_states (token_id, node_id, attempt)` UNIQUE → un node_state por
//!   intento.
//! - `batch_members (batch_id, ordinal)` PK compuesta → ordinal único.

diesel::table! {
    runs (run_id) {
        run_id -> Text,
        status -> Text,
        config_json -> Jsonb,
        config_hash -> Text,
        canonical_version -> Text,
        started_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    nodes (node_id) {
        node_id -> Text,
        run_id -> Text,
        plugin_name -> Text,
        node_kind -> Text,
        plugin_version -> Text,
        config_json -> Jsonb,
        schema_json -> Jsonb,
        registered_at -> Timestamptz,
    }
}

diesel::table! {
    edges (edge_id) {
        edge_id -> Text,
        run_id -> Text,
        from_node_id -> Text,
        to_node_id -> Text,
        label -> Text,
        mode -> Text,
    }
}

diesel::table! {
    pipeline_rows (row_id) {
        row_id -> Text,
        run_id -> Text,
        source_node_id -> Text,
        row_index -> BigInt,
        data -> Jsonb,
        data_hash -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    tokens (token_id) {
        token_id -> Text,
        row_id -> Text,
        branch_name -> Nullable<Text>,
        fork_group_id -> Nullable<Text>,
        join_group_id -> Nullable<Text>,
        expand_group_id -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    token_parents (token_id, ordinal) {
        token_id -> Text,
        parent_token_id -> Text,
        ordinal -> BigInt,
    }
}

diesel::table! {
    token_outcomes (token_id) {
        token_id -> Text,
        outcome -> Text,
        sink_name -> Nullable<Text>,
        error_hash -> Nullable<Text>,
        fork_group_id -> Nullable<Text>,
        join_group_id -> Nullable<Text>,
        expand_group_id -> Nullable<Text>,
        recorded_at -> Timestamptz,
    }
}

diesel::table! {
    node_states (state_id) {
        state_id -> Text,
        token_id -> Text,
        node_id -> Text,
        step_index -> BigInt,
        attempt -> Integer,
        status -> Text,
        input_hash -> Text,
        output_hash -> Nullable<Text>,
        duration_ms -> Nullable<BigInt>,
        error_json -> Nullable<Jsonb>,
        context_after_json -> Nullable<Jsonb>,
        started_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    routing_events (event_id) {
        event_id -> Text,
        state_id -> Text,
        edge_id -> Text,
        mode -> Text,
        reason_hash -> Nullable<Text>,
        routing_group_id -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    batches (batch_id) {
        batch_id -> Text,
        run_id -> Text,
        node_id -> Text,
        status -> Text,
        trigger_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    batch_members (batch_id, ordinal) {
        batch_id -> Text,
        token_id -> Text,
        ordinal -> BigInt,
    }
}

diesel::table! {
    artifacts (artifact_id) {
        artifact_id -> Text,
        run_id -> Text,
        sink_node_id -> Text,
        produced_by_state_id -> Text,
        path_or_uri -> Text,
        size_bytes -> BigInt,
        content_hash -> Text,
        artifact_type -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    transform_errors (error_id) {
        error_id -> Text,
        run_id -> Text,
        node_id -> Text,
        token_id -> Text,
        row_id -> Text,
        destination -> Text,
        error_details -> Jsonb,
        error_hash -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    payloads (payload_hash) {
        payload_hash -> Text,
        payload -> Jsonb,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    runs,
    nodes,
    edges,
    pipeline_rows,
    tokens,
    token_parents,
    token_outcomes,
    node_states,
    routing_events,
    batches,
    batch_members,
    artifacts,
    transform_errors,
    payloads,
);
