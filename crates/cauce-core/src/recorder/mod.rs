//! Recorder: la única vía de escritura al ledger de auditoría.
//!
//! Rol en el runtime:
//! - Todos los componentes (executors, procesador, orquestador) escriben a
//!   través de esta fachada; el store de atrás es intercambiable.
//! - Asigna ids y timestamps, hashea payloads (JSON canónico + blake3) y
//!   espeja los payloads en el `PayloadStore` si hay uno configurado.
//! - `record_terminal_outcome` convierte la violación de unicidad del store
//!   en una violación de invariante del motor: el segundo outcome de un
//!   token jamás se escribe.
//!
//! El lado de consulta reconstruye lineage por ids (el ledger es la arena;
//! no hay punteros en memoria entre tokens).

mod memory;
mod payloads;
mod store;
mod types;

pub use memory::MemoryStore;
pub use payloads::{MemoryPayloadStore, PayloadStore};
pub use store::AuditStore;
pub use types::*;

use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::contracts::{
    BatchStatus, NodeKind, NodeStateStatus, RoutingMode, RowOutcome, RunStatus, SchemaConfig,
};
use crate::errors::{EngineError, StoreError};
use crate::hashing::hash_value;

/// Detalle opcional de un outcome terminal.
#[derive(Debug, Clone, Default)]
pub struct OutcomeDetail {
    pub sink_name: Option<String>,
    pub error_hash: Option<String>,
    pub fork_group_id: Option<String>,
    pub join_group_id: Option<String>,
    pub expand_group_id: Option<String>,
}

impl OutcomeDetail {
    pub fn sink(name: impl Into<String>) -> Self {
        Self { sink_name: Some(name.into()), ..Default::default() }
    }

    pub fn error(hash: impl Into<String>) -> Self {
        Self { error_hash: Some(hash.into()), ..Default::default() }
    }

    pub fn fork_group(id: impl Into<String>) -> Self {
        Self { fork_group_id: Some(id.into()), ..Default::default() }
    }

    pub fn join_group(id: impl Into<String>) -> Self {
        Self { join_group_id: Some(id.into()), ..Default::default() }
    }

    pub fn expand_group(id: impl Into<String>) -> Self {
        Self { expand_group_id: Some(id.into()), ..Default::default() }
    }
}

pub struct Recorder<S: AuditStore> {
    store: Mutex<S>,
    payloads: Option<Box<dyn PayloadStore>>,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl<S: AuditStore> Recorder<S> {
    pub fn new(store: S) -> Self {
        Self { store: Mutex::new(store), payloads: None }
    }

    /// Espeja payloads hasheados en un almacén direccionado por contenido.
    pub fn with_payload_store(mut self, payloads: Box<dyn PayloadStore>) -> Self {
        self.payloads = Some(payloads);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, S> {
        self.store.lock().expect("audit store poisoned")
    }

    fn hash_payload(&self, payload: &Value) -> String {
        let hash = hash_value(payload);
        if let Some(store) = &self.payloads {
            store.put(&hash, payload);
        }
        hash
    }

    // -- ciclo de vida del run --------------------------------------------

    pub fn begin_run(&self,
                     config: Value,
                     canonical_version: &str)
                     -> Result<RunRecord, EngineError> {
        let run = RunRecord { run_id: new_id(),
                              status: RunStatus::Running,
                              config_hash: hash_value(&config),
                              config_json: config,
                              canonical_version: canonical_version.to_string(),
                              started_at: Utc::now(),
                              completed_at: None };
        log::debug!("begin_run run_id={}", run.run_id);
        self.lock().insert_run(run.clone())?;
        Ok(run)
    }

    pub fn complete_run(&self, run_id: &str, status: RunStatus) -> Result<(), EngineError> {
        log::debug!("complete_run run_id={run_id} status={}", status.as_str());
        self.lock().update_run_status(run_id, status, Some(Utc::now()))?;
        Ok(())
    }

    // -- registro del grafo ------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn register_node(&self,
                         run_id: &str,
                         plugin_name: &str,
                         node_kind: NodeKind,
                         plugin_version: &str,
                         config: Value,
                         schema_config: &SchemaConfig)
                         -> Result<NodeRecord, EngineError> {
        let node = NodeRecord { node_id: new_id(),
                                run_id: run_id.to_string(),
                                plugin_name: plugin_name.to_string(),
                                node_kind,
                                plugin_version: plugin_version.to_string(),
                                config_json: config,
                                schema_json: schema_config.to_value(),
                                registered_at: Utc::now() };
        self.lock().insert_node(node.clone())?;
        Ok(node)
    }

    pub fn register_edge(&self,
                         run_id: &str,
                         from_node_id: &str,
                         to_node_id: &str,
                         label: &str,
                         mode: RoutingMode)
                         -> Result<EdgeRecord, EngineError> {
        let edge = EdgeRecord { edge_id: new_id(),
                                run_id: run_id.to_string(),
                                from_node_id: from_node_id.to_string(),
                                to_node_id: to_node_id.to_string(),
                                label: label.to_string(),
                                mode };
        self.lock().insert_edge(edge.clone())?;
        Ok(edge)
    }

    // -- filas y tokens ----------------------------------------------------

    pub fn create_row(&self,
                      run_id: &str,
                      source_node_id: &str,
                      row_index: usize,
                      data: Value,
                      row_id: Option<String>)
                      -> Result<RowRecord, EngineError> {
        let row = RowRecord { row_id: row_id.unwrap_or_else(new_id),
                              run_id: run_id.to_string(),
                              source_node_id: source_node_id.to_string(),
                              row_index,
                              data_hash: self.hash_payload(&data),
                              data,
                              created_at: Utc::now() };
        self.lock().insert_row(row.clone())?;
        Ok(row)
    }

    /// Crea un token. Los parent links (fork/coalesce/expand) se registran
    /// junto con el token, en el orden dado.
    #[allow(clippy::too_many_arguments)]
    pub fn create_token(&self,
                        row_id: &str,
                        token_id: Option<String>,
                        branch_name: Option<String>,
                        fork_group_id: Option<String>,
                        join_group_id: Option<String>,
                        expand_group_id: Option<String>,
                        parent_token_ids: &[String])
                        -> Result<TokenRecord, EngineError> {
        let token = TokenRecord { token_id: token_id.unwrap_or_else(new_id),
                                  row_id: row_id.to_string(),
                                  branch_name,
                                  fork_group_id,
                                  join_group_id,
                                  expand_group_id,
                                  created_at: Utc::now() };
        let mut store = self.lock();
        store.insert_token(token.clone())?;
        for (ordinal, parent) in parent_token_ids.iter().enumerate() {
            store.insert_token_parent(TokenParentRecord { token_id: token.token_id.clone(),
                                                          parent_token_id: parent.clone(),
                                                          ordinal })?;
        }
        Ok(token)
    }

    // -- node states -------------------------------------------------------

    pub fn begin_node_state(&self,
                            token_id: &str,
                            node_id: &str,
                            step_index: usize,
                            attempt: u32,
                            input: &Value)
                            -> Result<NodeStateRecord, EngineError> {
        let state = NodeStateRecord { state_id: new_id(),
                                      token_id: token_id.to_string(),
                                      node_id: node_id.to_string(),
                                      step_index,
                                      attempt,
                                      status: NodeStateStatus::Open,
                                      input_hash: self.hash_payload(input),
                                      output_hash: None,
                                      duration_ms: None,
                                      error_json: None,
                                      context_after_json: None,
                                      started_at: Utc::now(),
                                      completed_at: None };
        self.lock().insert_node_state(state.clone()).map_err(|e| match e {
            StoreError::UniqueViolation(detail) => EngineError::InvariantViolation(format!(
                "duplicate node_state attempt: {detail}"
            )),
            other => EngineError::Store(other),
        })?;
        Ok(state)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn complete_node_state(&self,
                               state_id: &str,
                               status: NodeStateStatus,
                               output: Option<&Value>,
                               duration_ms: Option<u64>,
                               error_json: Option<Value>,
                               context_after_json: Option<Value>)
                               -> Result<(), EngineError> {
        let output_hash = output.map(|o| self.hash_payload(o));
        self.lock().close_node_state(state_id,
                                     status,
                                     output_hash,
                                     duration_ms,
                                     error_json,
                                     context_after_json,
                                     Utc::now())?;
        Ok(())
    }

    // -- ruteo -------------------------------------------------------------

    pub fn record_routing_event(&self,
                                state_id: &str,
                                edge_id: &str,
                                mode: RoutingMode,
                                reason: Option<&Value>,
                                routing_group_id: Option<String>)
                                -> Result<RoutingEventRecord, EngineError> {
        let event = RoutingEventRecord { event_id: new_id(),
                                         state_id: state_id.to_string(),
                                         edge_id: edge_id.to_string(),
                                         mode,
                                         reason_hash: reason.map(|r| self.hash_payload(r)),
                                         routing_group_id,
                                         created_at: Utc::now() };
        self.lock().insert_routing_event(event.clone())?;
        Ok(event)
    }

    // -- batches -----------------------------------------------------------

    pub fn create_batch(&self, run_id: &str, node_id: &str) -> Result<BatchRecord, EngineError> {
        let batch = BatchRecord { batch_id: new_id(),
                                  run_id: run_id.to_string(),
                                  node_id: node_id.to_string(),
                                  status: BatchStatus::Open,
                                  trigger_reason: None,
                                  created_at: Utc::now(),
                                  completed_at: None };
        self.lock().insert_batch(batch.clone())?;
        Ok(batch)
    }

    pub fn add_batch_member(&self,
                            batch_id: &str,
                            token_id: &str,
                            ordinal: usize)
                            -> Result<(), EngineError> {
        self.lock().insert_batch_member(BatchMemberRecord { batch_id: batch_id.to_string(),
                                                            token_id: token_id.to_string(),
                                                            ordinal })?;
        Ok(())
    }

    pub fn mark_batch_flushing(&self, batch_id: &str) -> Result<(), EngineError> {
        self.lock().update_batch_status(batch_id, BatchStatus::Flushing, None, None)?;
        Ok(())
    }

    pub fn complete_batch(&self,
                          batch_id: &str,
                          status: BatchStatus,
                          trigger_reason: &str)
                          -> Result<(), EngineError> {
        self.lock().update_batch_status(batch_id,
                                        status,
                                        Some(trigger_reason.to_string()),
                                        Some(Utc::now()))?;
        Ok(())
    }

    // -- artifacts y errores de transform ---------------------------------

    pub fn record_artifact(&self,
                           run_id: &str,
                           sink_node_id: &str,
                           produced_by_state_id: &str,
                           descriptor: &crate::contracts::ArtifactDescriptor)
                           -> Result<ArtifactRecord, EngineError> {
        let artifact = ArtifactRecord { artifact_id: new_id(),
                                        run_id: run_id.to_string(),
                                        sink_node_id: sink_node_id.to_string(),
                                        produced_by_state_id: produced_by_state_id.to_string(),
                                        path_or_uri: descriptor.path_or_uri.clone(),
                                        size_bytes: descriptor.size_bytes,
                                        content_hash: descriptor.content_hash.clone(),
                                        artifact_type: descriptor.artifact_type.clone(),
                                        created_at: Utc::now() };
        self.lock().insert_artifact(artifact.clone())?;
        Ok(artifact)
    }

    pub fn record_transform_error(&self,
                                  run_id: &str,
                                  node_id: &str,
                                  token_id: &str,
                                  row_id: &str,
                                  error_details: Value,
                                  destination: &str)
                                  -> Result<TransformErrorRecord, EngineError> {
        let error = TransformErrorRecord { error_id: new_id(),
                                           run_id: run_id.to_string(),
                                           node_id: node_id.to_string(),
                                           token_id: token_id.to_string(),
                                           row_id: row_id.to_string(),
                                           destination: destination.to_string(),
                                           error_hash: hash_value(&error_details),
                                           error_details,
                                           created_at: Utc::now() };
        self.lock().insert_transform_error(error.clone())?;
        Ok(error)
    }

    // -- outcome terminal --------------------------------------------------

    /// Escribe EL outcome terminal de un token. Insert condicional: si ya
    /// existe uno, el store devuelve violación de unicidad y acá se convierte
    /// en violación de invariante del motor.
    pub fn record_terminal_outcome(&self,
                                   token_id: &str,
                                   outcome: RowOutcome,
                                   detail: OutcomeDetail)
                                   -> Result<TokenOutcomeRecord, EngineError> {
        let record = TokenOutcomeRecord { token_id: token_id.to_string(),
                                          outcome,
                                          sink_name: detail.sink_name,
                                          error_hash: detail.error_hash,
                                          fork_group_id: detail.fork_group_id,
                                          join_group_id: detail.join_group_id,
                                          expand_group_id: detail.expand_group_id,
                                          recorded_at: Utc::now() };
        self.lock().insert_token_outcome(record.clone()).map_err(|e| match e {
            StoreError::UniqueViolation(_) => EngineError::InvariantViolation(format!(
                "double terminal outcome write for token {token_id} ({})",
                outcome.as_str()
            )),
            other => EngineError::Store(other),
        })?;
        Ok(record)
    }

    // -- consulta ----------------------------------------------------------

    pub fn get_run(&self, run_id: &str) -> Result<RunRecord, EngineError> {
        Ok(self.lock().get_run(run_id)?)
    }

    pub fn list_runs(&self) -> Result<Vec<RunRecord>, EngineError> {
        Ok(self.lock().list_runs()?)
    }

    pub fn get_nodes(&self, run_id: &str) -> Result<Vec<NodeRecord>, EngineError> {
        Ok(self.lock().list_nodes(run_id)?)
    }

    pub fn get_edges(&self, run_id: &str) -> Result<Vec<EdgeRecord>, EngineError> {
        Ok(self.lock().list_edges(run_id)?)
    }

    pub fn get_row(&self, row_id: &str) -> Result<RowRecord, EngineError> {
        Ok(self.lock().get_row(row_id)?)
    }

    pub fn get_rows(&self, run_id: &str) -> Result<Vec<RowRecord>, EngineError> {
        Ok(self.lock().list_rows(run_id)?)
    }

    pub fn get_token(&self, token_id: &str) -> Result<TokenRecord, EngineError> {
        Ok(self.lock().get_token(token_id)?)
    }

    pub fn get_tokens(&self, row_id: &str) -> Result<Vec<TokenRecord>, EngineError> {
        Ok(self.lock().list_tokens_for_row(row_id)?)
    }

    pub fn get_tokens_for_run(&self, run_id: &str) -> Result<Vec<TokenRecord>, EngineError> {
        Ok(self.lock().list_tokens_for_run(run_id)?)
    }

    pub fn get_token_outcome(&self,
                             token_id: &str)
                             -> Result<Option<TokenOutcomeRecord>, EngineError> {
        Ok(self.lock().get_token_outcome(token_id)?)
    }

    pub fn get_node_states_for_token(&self,
                                     token_id: &str)
                                     -> Result<Vec<NodeStateRecord>, EngineError> {
        Ok(self.lock().list_node_states_for_token(token_id)?)
    }

    pub fn get_routing_events(&self,
                              state_id: &str)
                              -> Result<Vec<RoutingEventRecord>, EngineError> {
        Ok(self.lock().list_routing_events(state_id)?)
    }

    pub fn get_batch(&self, batch_id: &str) -> Result<BatchRecord, EngineError> {
        Ok(self.lock().get_batch(batch_id)?)
    }

    pub fn get_batch_members(&self,
                             batch_id: &str)
                             -> Result<Vec<BatchMemberRecord>, EngineError> {
        Ok(self.lock().list_batch_members(batch_id)?)
    }

    pub fn get_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactRecord>, EngineError> {
        Ok(self.lock().list_artifacts(run_id)?)
    }

    pub fn get_transform_errors_for_token(&self,
                                          token_id: &str)
                                          -> Result<Vec<TransformErrorRecord>, EngineError> {
        Ok(self.lock().list_transform_errors_for_token(token_id)?)
    }

    pub fn get_token_parents(&self, token_id: &str) -> Result<Vec<TokenRecord>, EngineError> {
        let parents = self.lock().list_token_parents(token_id)?;
        let mut records = Vec::with_capacity(parents.len());
        for parent in parents {
            records.push(self.lock().get_token(&parent.parent_token_id)?);
        }
        Ok(records)
    }

    pub fn get_payload(&self, hash: &str) -> Option<Value> {
        self.payloads.as_ref().and_then(|p| p.get(hash))
    }

    /// Traza completa de un token: fila origen, node_states ordenados,
    /// eventos de ruteo, padres, outcome terminal, errores de transform y
    /// artifacts producidos por sus estados de sink.
    pub fn explain(&self, run_id: &str, token_id: &str) -> Result<Lineage, EngineError> {
        let token = self.get_token(token_id)?;
        let row = self.get_row(&token.row_id)?;
        if row.run_id != run_id {
            return Err(EngineError::Store(StoreError::NotFound(format!(
                "token {token_id} does not belong to run {run_id}"
            ))));
        }
        let node_states = self.get_node_states_for_token(token_id)?;
        let mut routing_events = Vec::new();
        for state in &node_states {
            routing_events.extend(self.get_routing_events(&state.state_id)?);
        }
        let state_ids: Vec<&str> = node_states.iter().map(|s| s.state_id.as_str()).collect();
        let artifacts = self.get_artifacts(run_id)?
                            .into_iter()
                            .filter(|a| state_ids.contains(&a.produced_by_state_id.as_str()))
                            .collect();
        Ok(Lineage { run_id: run_id.to_string(),
                     parents: self.get_token_parents(token_id)?,
                     outcome: self.get_token_outcome(token_id)?,
                     transform_errors: self.get_transform_errors_for_token(token_id)?,
                     node_states,
                     routing_events,
                     artifacts,
                     row,
                     token })
    }
}
