//! `PgStore`: implementación Postgres (Diesel) del `AuditStore` del core.
//!
//! Decisiones:
//! - Transacciones cortas: cada operación del trait es una unidad de
//!   trabajo; no hay transacciones largas abiertas entre filas.
//! - Los unique constraints del esquema son la barrera de corrección: la
//!   violación de `token_outcomes` (PK por token) regresa como
//!   `UniqueViolation` y el core la convierte en violación de invariante.
//! - Retry con backoff pequeño para errores transitorios (deadlock,
//!   conexión caída); nunca se reintenta una violación de constraint.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use log::{debug, warn};
use serde_json::Value;

use cauce_core::contracts::{
    BatchStatus, NodeKind, NodeStateStatus, RoutingMode, RowOutcome, RunStatus,
};
use cauce_core::errors::StoreError;
use cauce_core::recorder::{
    ArtifactRecord, AuditStore, BatchMemberRecord, BatchRecord, EdgeRecord, NodeRecord,
    NodeStateRecord, PayloadStore, RoutingEventRecord, RowRecord, RunRecord, TokenOutcomeRecord,
    TokenParentRecord, TokenRecord, TransformErrorRecord,
};

use crate::error::{is_retryable, PersistenceError};
use crate::migrations::run_pending_migrations;
use crate::schema::*;

pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;

/// Retry con backoff pequeño (15/30/45 ms) para errores transitorios.
fn with_retry<F, T>(mut f: F) -> Result<T, PersistenceError>
    where F: FnMut() -> Result<T, PersistenceError>
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if is_retryable(&e) && attempts < 3 => {
                let delay_ms = 15 * (attempts + 1) as u64;
                warn!("retryable db error (attempt {}): {:?} -> sleeping {}ms",
                      attempts + 1,
                      e,
                      delay_ms);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}

fn parse_error(entity: &str, raw: &str) -> StoreError {
    StoreError::Serialization(format!("stored {entity} value {raw:?} is not recognized"))
}

fn run_status_from(raw: &str) -> Result<RunStatus, StoreError> {
    match raw {
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        other => Err(parse_error("run status", other)),
    }
}

fn node_kind_from(raw: &str) -> Result<NodeKind, StoreError> {
    match raw {
        "source" => Ok(NodeKind::Source),
        "transform" => Ok(NodeKind::Transform),
        "gate" => Ok(NodeKind::Gate),
        "aggregation" => Ok(NodeKind::Aggregation),
        "coalesce" => Ok(NodeKind::Coalesce),
        "sink" => Ok(NodeKind::Sink),
        other => Err(parse_error("node kind", other)),
    }
}

fn mode_from(raw: &str) -> Result<RoutingMode, StoreError> {
    match raw {
        "move" => Ok(RoutingMode::Move),
        "copy" => Ok(RoutingMode::Copy),
        "divert" => Ok(RoutingMode::Divert),
        other => Err(parse_error("routing mode", other)),
    }
}

fn outcome_from(raw: &str) -> Result<RowOutcome, StoreError> {
    match raw {
        "completed" => Ok(RowOutcome::Completed),
        "routed" => Ok(RowOutcome::Routed),
        "quarantined" => Ok(RowOutcome::Quarantined),
        "failed" => Ok(RowOutcome::Failed),
        "forked" => Ok(RowOutcome::Forked),
        "coalesced" => Ok(RowOutcome::Coalesced),
        "consumed_in_batch" => Ok(RowOutcome::ConsumedInBatch),
        "buffered" => Ok(RowOutcome::Buffered),
        "expanded" => Ok(RowOutcome::Expanded),
        other => Err(parse_error("row outcome", other)),
    }
}

fn state_status_from(raw: &str) -> Result<NodeStateStatus, StoreError> {
    match raw {
        "open" => Ok(NodeStateStatus::Open),
        "completed" => Ok(NodeStateStatus::Completed),
        "failed" => Ok(NodeStateStatus::Failed),
        other => Err(parse_error("node_state status", other)),
    }
}

fn batch_status_from(raw: &str) -> Result<BatchStatus, StoreError> {
    match raw {
        "open" => Ok(BatchStatus::Open),
        "flushing" => Ok(BatchStatus::Flushing),
        "completed" => Ok(BatchStatus::Completed),
        "failed" => Ok(BatchStatus::Failed),
        other => Err(parse_error("batch status", other)),
    }
}

// -- filas Queryable ------------------------------------------------------

#[derive(Queryable)]
struct RunRow {
    run_id: String,
    status: String,
    config_json: Value,
    config_hash: String,
    canonical_version: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl RunRow {
    fn into_record(self) -> Result<RunRecord, StoreError> {
        Ok(RunRecord { run_id: self.run_id,
                       status: run_status_from(&self.status)?,
                       config_json: self.config_json,
                       config_hash: self.config_hash,
                       canonical_version: self.canonical_version,
                       started_at: self.started_at,
                       completed_at: self.completed_at })
    }
}

#[derive(Queryable)]
struct NodeRow {
    node_id: String,
    run_id: String,
    plugin_name: String,
    node_kind: String,
    plugin_version: String,
    config_json: Value,
    schema_json: Value,
    registered_at: DateTime<Utc>,
}

impl NodeRow {
    fn into_record(self) -> Result<NodeRecord, StoreError> {
        Ok(NodeRecord { node_id: self.node_id,
                        run_id: self.run_id,
                        plugin_name: self.plugin_name,
                        node_kind: node_kind_from(&self.node_kind)?,
                        plugin_version: self.plugin_version,
                        config_json: self.config_json,
                        schema_json: self.schema_json,
                        registered_at: self.registered_at })
    }
}

#[derive(Queryable)]
struct EdgeRow {
    edge_id: String,
    run_id: String,
    from_node_id: String,
    to_node_id: String,
    label: String,
    mode: String,
}

impl EdgeRow {
    fn into_record(self) -> Result<EdgeRecord, StoreError> {
        Ok(EdgeRecord { edge_id: self.edge_id,
                        run_id: self.run_id,
                        from_node_id: self.from_node_id,
                        to_node_id: self.to_node_id,
                        label: self.label,
                        mode: mode_from(&self.mode)? })
    }
}

#[derive(Queryable)]
struct PipelineRowRow {
    row_id: String,
    run_id: String,
    source_node_id: String,
    row_index: i64,
    data: Value,
    data_hash: String,
    created_at: DateTime<Utc>,
}

impl PipelineRowRow {
    fn into_record(self) -> RowRecord {
        RowRecord { row_id: self.row_id,
                    run_id: self.run_id,
                    source_node_id: self.source_node_id,
                    row_index: self.row_index as usize,
                    data: self.data,
                    data_hash: self.data_hash,
                    created_at: self.created_at }
    }
}

#[derive(Queryable)]
struct TokenRow {
    token_id: String,
    row_id: String,
    branch_name: Option<String>,
    fork_group_id: Option<String>,
    join_group_id: Option<String>,
    expand_group_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TokenRow {
    fn into_record(self) -> TokenRecord {
        TokenRecord { token_id: self.token_id,
                      row_id: self.row_id,
                      branch_name: self.branch_name,
                      fork_group_id: self.fork_group_id,
                      join_group_id: self.join_group_id,
                      expand_group_id: self.expand_group_id,
                      created_at: self.created_at }
    }
}

#[derive(Queryable)]
struct TokenOutcomeRow {
    token_id: String,
    outcome: String,
    sink_name: Option<String>,
    error_hash: Option<String>,
    fork_group_id: Option<String>,
    join_group_id: Option<String>,
    expand_group_id: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl TokenOutcomeRow {
    fn into_record(self) -> Result<TokenOutcomeRecord, StoreError> {
        Ok(TokenOutcomeRecord { token_id: self.token_id,
                                outcome: outcome_from(&self.outcome)?,
                                sink_name: self.sink_name,
                                error_hash: self.error_hash,
                                fork_group_id: self.fork_group_id,
                                join_group_id: self.join_group_id,
                                expand_group_id: self.expand_group_id,
                                recorded_at: self.recorded_at })
    }
}

#[derive(Queryable)]
struct NodeStateRow {
    state_id: String,
    token_id: String,
    node_id: String,
    step_index: i64,
    attempt: i32,
    status: String,
    input_hash: String,
    output_hash: Option<String>,
    duration_ms: Option<i64>,
    error_json: Option<Value>,
    context_after_json: Option<Value>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl NodeStateRow {
    fn into_record(self) -> Result<NodeStateRecord, StoreError> {
        Ok(NodeStateRecord { state_id: self.state_id,
                             token_id: self.token_id,
                             node_id: self.node_id,
                             step_index: self.step_index as usize,
                             attempt: self.attempt as u32,
                             status: state_status_from(&self.status)?,
                             input_hash: self.input_hash,
                             output_hash: self.output_hash,
                             duration_ms: self.duration_ms.map(|d| d as u64),
                             error_json: self.error_json,
                             context_after_json: self.context_after_json,
                             started_at: self.started_at,
                             completed_at: self.completed_at })
    }
}

#[derive(Queryable)]
struct RoutingEventRow {
    event_id: String,
    state_id: String,
    edge_id: String,
    mode: String,
    reason_hash: Option<String>,
    routing_group_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl RoutingEventRow {
    fn into_record(self) -> Result<RoutingEventRecord, StoreError> {
        Ok(RoutingEventRecord { event_id: self.event_id,
                                state_id: self.state_id,
                                edge_id: self.edge_id,
                                mode: mode_from(&self.mode)?,
                                reason_hash: self.reason_hash,
                                routing_group_id: self.routing_group_id,
                                created_at: self.created_at })
    }
}

#[derive(Queryable)]
struct BatchRow {
    batch_id: String,
    run_id: String,
    node_id: String,
    status: String,
    trigger_reason: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl BatchRow {
    fn into_record(self) -> Result<BatchRecord, StoreError> {
        Ok(BatchRecord { batch_id: self.batch_id,
                         run_id: self.run_id,
                         node_id: self.node_id,
                         status: batch_status_from(&self.status)?,
                         trigger_reason: self.trigger_reason,
                         created_at: self.created_at,
                         completed_at: self.completed_at })
    }
}

#[derive(Queryable)]
struct ArtifactRow {
    artifact_id: String,
    run_id: String,
    sink_node_id: String,
    produced_by_state_id: String,
    path_or_uri: String,
    size_bytes: i64,
    content_hash: String,
    artifact_type: String,
    created_at: DateTime<Utc>,
}

impl ArtifactRow {
    fn into_record(self) -> ArtifactRecord {
        ArtifactRecord { artifact_id: self.artifact_id,
                         run_id: self.run_id,
                         sink_node_id: self.sink_node_id,
                         produced_by_state_id: self.produced_by_state_id,
                         path_or_uri: self.path_or_uri,
                         size_bytes: self.size_bytes as u64,
                         content_hash: self.content_hash,
                         artifact_type: self.artifact_type,
                         created_at: self.created_at }
    }
}

#[derive(Queryable)]
struct TransformErrorRow {
    error_id: String,
    run_id: String,
    node_id: String,
    token_id: String,
    row_id: String,
    destination: String,
    error_details: Value,
    error_hash: String,
    created_at: DateTime<Utc>,
}

impl TransformErrorRow {
    fn into_record(self) -> TransformErrorRecord {
        TransformErrorRecord { error_id: self.error_id,
                               run_id: self.run_id,
                               node_id: self.node_id,
                               token_id: self.token_id,
                               row_id: self.row_id,
                               destination: self.destination,
                               error_details: self.error_details,
                               error_hash: self.error_hash,
                               created_at: self.created_at }
    }
}

// -- el store -------------------------------------------------------------

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn from_env() -> Result<Self, PersistenceError> {
        Ok(Self::new(build_dev_pool_from_env()?))
    }

    fn conn(&self)
            -> Result<r2d2::PooledConnection<ConnectionManager<PgConnection>>, PersistenceError>
    {
        self.pool
            .get()
            .map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))
    }

    fn write<F>(&self, mut op: F) -> Result<(), StoreError>
        where F: FnMut(&mut PgConnection) -> Result<(), diesel::result::Error>
    {
        with_retry(|| {
            let mut conn = self.conn()?;
            conn.build_transaction()
                .read_write()
                .run(|tx| op(tx))
                .map_err(PersistenceError::from)
        }).map_err(StoreError::from)
    }

    fn read<T, F>(&self, mut op: F) -> Result<T, StoreError>
        where F: FnMut(&mut PgConnection) -> Result<T, diesel::result::Error>
    {
        with_retry(|| {
            let mut conn = self.conn()?;
            op(&mut conn).map_err(PersistenceError::from)
        }).map_err(StoreError::from)
    }
}

impl AuditStore for PgStore {
    fn insert_run(&mut self, run: RunRecord) -> Result<(), StoreError> {
        debug!("insert_run {}", run.run_id);
        self.write(|conn| {
            diesel::insert_into(runs::table)
                .values((runs::run_id.eq(&run.run_id),
                         runs::status.eq(run.status.as_str()),
                         runs::config_json.eq(&run.config_json),
                         runs::config_hash.eq(&run.config_hash),
                         runs::canonical_version.eq(&run.canonical_version),
                         runs::started_at.eq(run.started_at),
                         runs::completed_at.eq(run.completed_at)))
                .execute(conn)
                .map(|_| ())
        })
    }

    fn update_run_status(&mut self,
                         run_id: &str,
                         status: RunStatus,
                         completed_at: Option<DateTime<Utc>>)
                         -> Result<(), StoreError> {
        self.write(|conn| {
            diesel::update(runs::table.filter(runs::run_id.eq(run_id)))
                .set((runs::status.eq(status.as_str()),
                      runs::completed_at.eq(completed_at)))
                .execute(conn)
                .map(|_| ())
        })
    }

    fn insert_node(&mut self, node: NodeRecord) -> Result<(), StoreError> {
        self.write(|conn| {
            diesel::insert_into(nodes::table)
                .values((nodes::node_id.eq(&node.node_id),
                         nodes::run_id.eq(&node.run_id),
                         nodes::plugin_name.eq(&node.plugin_name),
                         nodes::node_kind.eq(node.node_kind.as_str()),
                         nodes::plugin_version.eq(&node.plugin_version),
                         nodes::config_json.eq(&node.config_json),
                         nodes::schema_json.eq(&node.schema_json),
                         nodes::registered_at.eq(node.registered_at)))
                .execute(conn)
                .map(|_| ())
        })
    }

    fn insert_edge(&mut self, edge: EdgeRecord) -> Result<(), StoreError> {
        self.write(|conn| {
            diesel::insert_into(edges::table)
                .values((edges::edge_id.eq(&edge.edge_id),
                         edges::run_id.eq(&edge.run_id),
                         edges::from_node_id.eq(&edge.from_node_id),
                         edges::to_node_id.eq(&edge.to_node_id),
                         edges::label.eq(&edge.label),
                         edges::mode.eq(edge.mode.as_str())))
                .execute(conn)
                .map(|_| ())
        })
    }

    fn insert_row(&mut self, row: RowRecord) -> Result<(), StoreError> {
        self.write(|conn| {
            diesel::insert_into(pipeline_rows::table)
                .values((pipeline_rows::row_id.eq(&row.row_id),
                         pipeline_rows::run_id.eq(&row.run_id),
                         pipeline_rows::source_node_id.eq(&row.source_node_id),
                         pipeline_rows::row_index.eq(row.row_index as i64),
                         pipeline_rows::data.eq(&row.data),
                         pipeline_rows::data_hash.eq(&row.data_hash),
                         pipeline_rows::created_at.eq(row.created_at)))
                .execute(conn)
                .map(|_| ())
        })
    }

    fn insert_token(&mut self, token: TokenRecord) -> Result<(), StoreError> {
        self.write(|conn| {
            diesel::insert_into(tokens::table)
                .values((tokens::token_id.eq(&token.token_id),
                         tokens::row_id.eq(&token.row_id),
                         tokens::branch_name.eq(token.branch_name.as_deref()),
                         tokens::fork_group_id.eq(token.fork_group_id.as_deref()),
                         tokens::join_group_id.eq(token.join_group_id.as_deref()),
                         tokens::expand_group_id.eq(token.expand_group_id.as_deref()),
                         tokens::created_at.eq(token.created_at)))
                .execute(conn)
                .map(|_| ())
        })
    }

    fn insert_token_parent(&mut self, parent: TokenParentRecord) -> Result<(), StoreError> {
        self.write(|conn| {
            diesel::insert_into(token_parents::table)
                .values((token_parents::token_id.eq(&parent.token_id),
                         token_parents::parent_token_id.eq(&parent.parent_token_id),
                         token_parents::ordinal.eq(parent.ordinal as i64)))
                .execute(conn)
                .map(|_| ())
        })
    }

    fn insert_token_outcome(&mut self, outcome: TokenOutcomeRecord) -> Result<(), StoreError> {
        // Insert PLANO a propósito: el PK por token_id convierte el doble
        // outcome en UniqueViolation, que es la señal que el core espera.
        self.write(|conn| {
            diesel::insert_into(token_outcomes::table)
                .values((token_outcomes::token_id.eq(&outcome.token_id),
                         token_outcomes::outcome.eq(outcome.outcome.as_str()),
                         token_outcomes::sink_name.eq(outcome.sink_name.as_deref()),
                         token_outcomes::error_hash.eq(outcome.error_hash.as_deref()),
                         token_outcomes::fork_group_id.eq(outcome.fork_group_id.as_deref()),
                         token_outcomes::join_group_id.eq(outcome.join_group_id.as_deref()),
                         token_outcomes::expand_group_id.eq(outcome.expand_group_id.as_deref()),
                         token_outcomes::recorded_at.eq(outcome.recorded_at)))
                .execute(conn)
                .map(|_| ())
        })
    }

    fn insert_node_state(&mut self, state: NodeStateRecord) -> Result<(), StoreError> {
        self.write(|conn| {
            diesel::insert_into(node_states::table)
                .values((node_states::state_id.eq(&state.state_id),
                         node_states::token_id.eq(&state.token_id),
                         node_states::node_id.eq(&state.node_id),
                         node_states::step_index.eq(state.step_index as i64),
                         node_states::attempt.eq(state.attempt as i32),
                         node_states::status.eq(state.status.as_str()),
                         node_states::input_hash.eq(&state.input_hash),
                         node_states::output_hash.eq(state.output_hash.as_deref()),
                         node_states::duration_ms.eq(state.duration_ms.map(|d| d as i64)),
                         node_states::error_json.eq(state.error_json.as_ref()),
                         node_states::context_after_json.eq(state.context_after_json.as_ref()),
                         node_states::started_at.eq(state.started_at),
                         node_states::completed_at.eq(state.completed_at)))
                .execute(conn)
                .map(|_| ())
        })
    }

    fn close_node_state(&mut self,
                        state_id: &str,
                        status: NodeStateStatus,
                        output_hash: Option<String>,
                        duration_ms: Option<u64>,
                        error_json: Option<Value>,
                        context_after_json: Option<Value>,
                        completed_at: DateTime<Utc>)
                        -> Result<(), StoreError> {
        self.write(|conn| {
            diesel::update(node_states::table.filter(node_states::state_id.eq(state_id)))
                .set((node_states::status.eq(status.as_str()),
                      node_states::output_hash.eq(output_hash.as_deref()),
                      node_states::duration_ms.eq(duration_ms.map(|d| d as i64)),
                      node_states::error_json.eq(error_json.as_ref()),
                      node_states::context_after_json.eq(context_after_json.as_ref()),
                      node_states::completed_at.eq(Some(completed_at))))
                .execute(conn)
                .map(|_| ())
        })
    }

    fn insert_routing_event(&mut self, event: RoutingEventRecord) -> Result<(), StoreError> {
        self.write(|conn| {
            diesel::insert_into(routing_events::table)
                .values((routing_events::event_id.eq(&event.event_id),
                         routing_events::state_id.eq(&event.state_id),
                         routing_events::edge_id.eq(&event.edge_id),
                         routing_events::mode.eq(event.mode.as_str()),
                         routing_events::reason_hash.eq(event.reason_hash.as_deref()),
                         routing_events::routing_group_id.eq(event.routing_group_id.as_deref()),
                         routing_events::created_at.eq(event.created_at)))
                .execute(conn)
                .map(|_| ())
        })
    }

    fn insert_batch(&mut self, batch: BatchRecord) -> Result<(), StoreError> {
        self.write(|conn| {
            diesel::insert_into(batches::table)
                .values((batches::batch_id.eq(&batch.batch_id),
                         batches::run_id.eq(&batch.run_id),
                         batches::node_id.eq(&batch.node_id),
                         batches::status.eq(batch.status.as_str()),
                         batches::trigger_reason.eq(batch.trigger_reason.as_deref()),
                         batches::created_at.eq(batch.created_at),
                         batches::completed_at.eq(batch.completed_at)))
                .execute(conn)
                .map(|_| ())
        })
    }

    fn update_batch_status(&mut self,
                           batch_id: &str,
                           status: BatchStatus,
                           trigger_reason: Option<String>,
                           completed_at: Option<DateTime<Utc>>)
                           -> Result<(), StoreError> {
        self.write(|conn| {
            let base = diesel::update(batches::table.filter(batches::batch_id.eq(batch_id)));
            match (&trigger_reason, completed_at) {
                (Some(reason), Some(done)) => base.set((batches::status.eq(status.as_str()),
                                                        batches::trigger_reason.eq(reason),
                                                        batches::completed_at.eq(Some(done))))
                                                  .execute(conn),
                (Some(reason), None) => base.set((batches::status.eq(status.as_str()),
                                                  batches::trigger_reason.eq(reason)))
                                            .execute(conn),
                (None, Some(done)) => base.set((batches::status.eq(status.as_str()),
                                                batches::completed_at.eq(Some(done))))
                                          .execute(conn),
                (None, None) => base.set(batches::status.eq(status.as_str())).execute(conn),
            }
            .map(|_| ())
        })
    }

    fn insert_batch_member(&mut self, member: BatchMemberRecord) -> Result<(), StoreError> {
        self.write(|conn| {
            diesel::insert_into(batch_members::table)
                .values((batch_members::batch_id.eq(&member.batch_id),
                         batch_members::token_id.eq(&member.token_id),
                         batch_members::ordinal.eq(member.ordinal as i64)))
                .execute(conn)
                .map(|_| ())
        })
    }

    fn insert_artifact(&mut self, artifact: ArtifactRecord) -> Result<(), StoreError> {
        self.write(|conn| {
            diesel::insert_into(artifacts::table)
                .values((artifacts::artifact_id.eq(&artifact.artifact_id),
                         artifacts::run_id.eq(&artifact.run_id),
                         artifacts::sink_node_id.eq(&artifact.sink_node_id),
                         artifacts::produced_by_state_id.eq(&artifact.produced_by_state_id),
                         artifacts::path_or_uri.eq(&artifact.path_or_uri),
                         artifacts::size_bytes.eq(artifact.size_bytes as i64),
                         artifacts::content_hash.eq(&artifact.content_hash),
                         artifacts::artifact_type.eq(&artifact.artifact_type),
                         artifacts::created_at.eq(artifact.created_at)))
                .execute(conn)
                .map(|_| ())
        })
    }

    fn insert_transform_error(&mut self, error: TransformErrorRecord) -> Result<(), StoreError> {
        self.write(|conn| {
            diesel::insert_into(transform_errors::table)
                .values((transform_errors::error_id.eq(&error.error_id),
                         transform_errors::run_id.eq(&error.run_id),
                         transform_errors::node_id.eq(&error.node_id),
                         transform_errors::token_id.eq(&error.token_id),
                         transform_errors::row_id.eq(&error.row_id),
                         transform_errors::destination.eq(&error.destination),
                         transform_errors::error_details.eq(&error.error_details),
                         transform_errors::error_hash.eq(&error.error_hash),
                         transform_errors::created_at.eq(error.created_at)))
                .execute(conn)
                .map(|_| ())
        })
    }

    fn get_run(&self, run_id: &str) -> Result<RunRecord, StoreError> {
        let row: RunRow = self.read(|conn| {
            runs::table.filter(runs::run_id.eq(run_id)).first(conn)
        })?;
        row.into_record()
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let rows: Vec<RunRow> =
            self.read(|conn| runs::table.order(runs::started_at.asc()).load(conn))?;
        rows.into_iter().map(RunRow::into_record).collect()
    }

    fn get_node(&self, node_id: &str) -> Result<NodeRecord, StoreError> {
        let row: NodeRow = self.read(|conn| {
            nodes::table.filter(nodes::node_id.eq(node_id)).first(conn)
        })?;
        row.into_record()
    }

    fn list_nodes(&self, run_id: &str) -> Result<Vec<NodeRecord>, StoreError> {
        let rows: Vec<NodeRow> = self.read(|conn| {
            nodes::table.filter(nodes::run_id.eq(run_id))
                        .order(nodes::registered_at.asc())
                        .load(conn)
        })?;
        rows.into_iter().map(NodeRow::into_record).collect()
    }

    fn list_edges(&self, run_id: &str) -> Result<Vec<EdgeRecord>, StoreError> {
        let rows: Vec<EdgeRow> = self.read(|conn| {
            edges::table.filter(edges::run_id.eq(run_id)).load(conn)
        })?;
        rows.into_iter().map(EdgeRow::into_record).collect()
    }

    fn get_row(&self, row_id: &str) -> Result<RowRecord, StoreError> {
        let row: PipelineRowRow = self.read(|conn| {
            pipeline_rows::table.filter(pipeline_rows::row_id.eq(row_id)).first(conn)
        })?;
        Ok(row.into_record())
    }

    fn list_rows(&self, run_id: &str) -> Result<Vec<RowRecord>, StoreError> {
        let rows: Vec<PipelineRowRow> = self.read(|conn| {
            pipeline_rows::table.filter(pipeline_rows::run_id.eq(run_id))
                                .order(pipeline_rows::row_index.asc())
                                .load(conn)
        })?;
        Ok(rows.into_iter().map(PipelineRowRow::into_record).collect())
    }

    fn get_token(&self, token_id: &str) -> Result<TokenRecord, StoreError> {
        let row: TokenRow = self.read(|conn| {
            tokens::table.filter(tokens::token_id.eq(token_id)).first(conn)
        })?;
        Ok(row.into_record())
    }

    fn list_tokens_for_row(&self, row_id: &str) -> Result<Vec<TokenRecord>, StoreError> {
        let rows: Vec<TokenRow> = self.read(|conn| {
            tokens::table.filter(tokens::row_id.eq(row_id))
                         .order(tokens::created_at.asc())
                         .load(conn)
        })?;
        Ok(rows.into_iter().map(TokenRow::into_record).collect())
    }

    fn list_tokens_for_run(&self, run_id: &str) -> Result<Vec<TokenRecord>, StoreError> {
        let rows: Vec<TokenRow> = self.read(|conn| {
            tokens::table.inner_join(
                             pipeline_rows::table.on(tokens::row_id.eq(pipeline_rows::row_id)),
                         )
                         .filter(pipeline_rows::run_id.eq(run_id))
                         .select((tokens::token_id,
                                  tokens::row_id,
                                  tokens::branch_name,
                                  tokens::fork_group_id,
                                  tokens::join_group_id,
                                  tokens::expand_group_id,
                                  tokens::created_at))
                         .order(tokens::created_at.asc())
                         .load(conn)
        })?;
        Ok(rows.into_iter().map(TokenRow::into_record).collect())
    }

    fn get_token_outcome(&self, token_id: &str)
                         -> Result<Option<TokenOutcomeRecord>, StoreError> {
        let row: Option<TokenOutcomeRow> = self.read(|conn| {
            token_outcomes::table.filter(token_outcomes::token_id.eq(token_id))
                                 .first(conn)
                                 .optional()
        })?;
        row.map(TokenOutcomeRow::into_record).transpose()
    }

    fn list_node_states_for_token(&self, token_id: &str)
                                  -> Result<Vec<NodeStateRecord>, StoreError> {
        let rows: Vec<NodeStateRow> = self.read(|conn| {
            node_states::table.filter(node_states::token_id.eq(token_id))
                              .order((node_states::step_index.asc(),
                                      node_states::attempt.asc()))
                              .load(conn)
        })?;
        rows.into_iter().map(NodeStateRow::into_record).collect()
    }

    fn get_node_state(&self, state_id: &str) -> Result<NodeStateRecord, StoreError> {
        let row: NodeStateRow = self.read(|conn| {
            node_states::table.filter(node_states::state_id.eq(state_id)).first(conn)
        })?;
        row.into_record()
    }

    fn list_routing_events(&self, state_id: &str)
                           -> Result<Vec<RoutingEventRecord>, StoreError> {
        let rows: Vec<RoutingEventRow> = self.read(|conn| {
            routing_events::table.filter(routing_events::state_id.eq(state_id))
                                 .order(routing_events::created_at.asc())
                                 .load(conn)
        })?;
        rows.into_iter().map(RoutingEventRow::into_record).collect()
    }

    fn get_batch(&self, batch_id: &str) -> Result<BatchRecord, StoreError> {
        let row: BatchRow = self.read(|conn| {
            batches::table.filter(batches::batch_id.eq(batch_id)).first(conn)
        })?;
        row.into_record()
    }

    fn list_batch_members(&self, batch_id: &str)
                          -> Result<Vec<BatchMemberRecord>, StoreError> {
        let rows: Vec<(String, String, i64)> = self.read(|conn| {
            batch_members::table.filter(batch_members::batch_id.eq(batch_id))
                                .order(batch_members::ordinal.asc())
                                .load(conn)
        })?;
        Ok(rows.into_iter()
               .map(|(batch_id, token_id, ordinal)| BatchMemberRecord {
                   batch_id,
                   token_id,
                   ordinal: ordinal as usize,
               })
               .collect())
    }

    fn list_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactRecord>, StoreError> {
        let rows: Vec<ArtifactRow> = self.read(|conn| {
            artifacts::table.filter(artifacts::run_id.eq(run_id))
                            .order(artifacts::created_at.asc())
                            .load(conn)
        })?;
        Ok(rows.into_iter().map(ArtifactRow::into_record).collect())
    }

    fn list_transform_errors_for_token(&self, token_id: &str)
                                       -> Result<Vec<TransformErrorRecord>, StoreError> {
        let rows: Vec<TransformErrorRow> = self.read(|conn| {
            transform_errors::table.filter(transform_errors::token_id.eq(token_id))
                                   .order(transform_errors::created_at.asc())
                                   .load(conn)
        })?;
        Ok(rows.into_iter().map(TransformErrorRow::into_record).collect())
    }

    fn list_token_parents(&self, token_id: &str)
                          -> Result<Vec<TokenParentRecord>, StoreError> {
        let rows: Vec<(String, String, i64)> = self.read(|conn| {
            token_parents::table.filter(token_parents::token_id.eq(token_id))
                                .order(token_parents::ordinal.asc())
                                .load(conn)
        })?;
        Ok(rows.into_iter()
               .map(|(token_id, parent_token_id, ordinal)| TokenParentRecord {
                   token_id,
                   parent_token_id,
                   ordinal: ordinal as usize,
               })
               .collect())
    }
}

/// Payload store direccionado por contenido sobre la tabla `payloads`
/// (dedupe por PK con `ON CONFLICT DO NOTHING`).
pub struct PgPayloadStore {
    pool: PgPool,
}

impl PgPayloadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PayloadStore for PgPayloadStore {
    fn put(&self, hash: &str, payload: &Value) {
        let result = self.pool.get().map_err(|e| e.to_string()).and_then(|mut conn| {
            diesel::insert_into(payloads::table)
                .values((payloads::payload_hash.eq(hash), payloads::payload.eq(payload)))
                .on_conflict_do_nothing()
                .execute(&mut conn)
                .map_err(|e| e.to_string())
        });
        if let Err(e) = result {
            warn!("payload put failed for {hash}: {e}");
        }
    }

    fn get(&self, hash: &str) -> Option<Value> {
        let mut conn = self.pool.get().ok()?;
        payloads::table.filter(payloads::payload_hash.eq(hash))
                       .select(payloads::payload)
                       .first(&mut conn)
                       .ok()
    }
}

/// Construye un pool r2d2 y corre las migraciones pendientes una vez.
pub fn build_pool(database_url: &str,
                  min_size: u32,
                  max_size: u32)
                  -> Result<PgPool, PersistenceError> {
    let validated_min = min_size.max(1);
    let validated_max = max_size.max(1);
    let final_min = validated_min.min(validated_max);
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder()
        .min_idle(Some(final_min))
        .max_size(validated_max)
        .build(manager)
        .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get().map_err(|e| {
            PersistenceError::TransientIo(format!("pool get for migrations: {e}"))
        })?;
        run_pending_migrations(&mut conn)?;
    }
    Ok(pool)
}

/// Helper de desarrollo: carga `.env`, lee configuración y construye un
/// pool ya migrado.
pub fn build_dev_pool_from_env() -> Result<PgPool, PersistenceError> {
    crate::config::init_dotenv();
    let cfg = crate::config::DbConfig::from_env();
    build_pool(&cfg.url, cfg.min_connections, cfg.max_connections)
}
