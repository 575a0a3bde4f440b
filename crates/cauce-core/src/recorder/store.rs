//! Trait del almacén de auditoría.
//!
//! Contrato principal:
//! - Operaciones append-mostly: los registros se insertan y (salvo cierres de
//!   run/node_state/batch) nunca se mutan.
//! - `insert_token_outcome` es un insert condicional: un duplicado por
//!   token_id DEBE devolver `StoreError::UniqueViolation`. Esa unicidad es la
//!   barrera de corrección del invariante de outcome único.
//! - Las lecturas devuelven registros en orden estable (ver cada método).
//!
//! La intención es que la interfaz sea implementable por backends distintos
//! (memoria para tests, Postgres en `cauce-persistence`).

use chrono::{DateTime, Utc};

use super::types::*;
use crate::contracts::{BatchStatus, NodeStateStatus, RunStatus};
use crate::errors::StoreError;

pub trait AuditStore {
    // -- escritura ---------------------------------------------------------

    fn insert_run(&mut self, run: RunRecord) -> Result<(), StoreError>;

    fn update_run_status(&mut self,
                         run_id: &str,
                         status: RunStatus,
                         completed_at: Option<DateTime<Utc>>)
                         -> Result<(), StoreError>;

    fn insert_node(&mut self, node: NodeRecord) -> Result<(), StoreError>;

    fn insert_edge(&mut self, edge: EdgeRecord) -> Result<(), StoreError>;

    fn insert_row(&mut self, row: RowRecord) -> Result<(), StoreError>;

    fn insert_token(&mut self, token: TokenRecord) -> Result<(), StoreError>;

    fn insert_token_parent(&mut self, parent: TokenParentRecord) -> Result<(), StoreError>;

    /// Insert condicional. Duplicado por token_id → `UniqueViolation`.
    fn insert_token_outcome(&mut self, outcome: TokenOutcomeRecord) -> Result<(), StoreError>;

    /// Duplicado por `(token_id, node_id, attempt)` → `UniqueViolation`.
    fn insert_node_state(&mut self, state: NodeStateRecord) -> Result<(), StoreError>;

    fn close_node_state(&mut self,
                        state_id: &str,
                        status: NodeStateStatus,
                        output_hash: Option<String>,
                        duration_ms: Option<u64>,
                        error_json: Option<serde_json::Value>,
                        context_after_json: Option<serde_json::Value>,
                        completed_at: DateTime<Utc>)
                        -> Result<(), StoreError>;

    fn insert_routing_event(&mut self, event: RoutingEventRecord) -> Result<(), StoreError>;

    fn insert_batch(&mut self, batch: BatchRecord) -> Result<(), StoreError>;

    fn update_batch_status(&mut self,
                           batch_id: &str,
                           status: BatchStatus,
                           trigger_reason: Option<String>,
                           completed_at: Option<DateTime<Utc>>)
                           -> Result<(), StoreError>;

    /// Duplicado por `(batch_id, ordinal)` → `UniqueViolation`.
    fn insert_batch_member(&mut self, member: BatchMemberRecord) -> Result<(), StoreError>;

    fn insert_artifact(&mut self, artifact: ArtifactRecord) -> Result<(), StoreError>;

    fn insert_transform_error(&mut self, error: TransformErrorRecord) -> Result<(), StoreError>;

    // -- lectura -----------------------------------------------------------

    fn get_run(&self, run_id: &str) -> Result<RunRecord, StoreError>;

    /// Runs ordenados por `started_at` ascendente.
    fn list_runs(&self) -> Result<Vec<RunRecord>, StoreError>;

    fn get_node(&self, node_id: &str) -> Result<NodeRecord, StoreError>;

    /// Nodos de un run en orden de registro.
    fn list_nodes(&self, run_id: &str) -> Result<Vec<NodeRecord>, StoreError>;

    /// Edges de un run en orden de registro.
    fn list_edges(&self, run_id: &str) -> Result<Vec<EdgeRecord>, StoreError>;

    fn get_row(&self, row_id: &str) -> Result<RowRecord, StoreError>;

    /// Filas de un run ordenadas por row_index.
    fn list_rows(&self, run_id: &str) -> Result<Vec<RowRecord>, StoreError>;

    fn get_token(&self, token_id: &str) -> Result<TokenRecord, StoreError>;

    /// Tokens de una fila en orden de creación.
    fn list_tokens_for_row(&self, row_id: &str) -> Result<Vec<TokenRecord>, StoreError>;

    /// Todos los tokens del run en orden de creación.
    fn list_tokens_for_run(&self, run_id: &str) -> Result<Vec<TokenRecord>, StoreError>;

    fn get_token_outcome(&self, token_id: &str)
                         -> Result<Option<TokenOutcomeRecord>, StoreError>;

    /// node_states de un token ordenados por `(step_index, attempt)`.
    fn list_node_states_for_token(&self, token_id: &str)
                                  -> Result<Vec<NodeStateRecord>, StoreError>;

    fn get_node_state(&self, state_id: &str) -> Result<NodeStateRecord, StoreError>;

    /// Eventos de ruteo de un node_state en orden de emisión.
    fn list_routing_events(&self, state_id: &str)
                           -> Result<Vec<RoutingEventRecord>, StoreError>;

    fn get_batch(&self, batch_id: &str) -> Result<BatchRecord, StoreError>;

    /// Miembros de un batch ordenados por ordinal.
    fn list_batch_members(&self, batch_id: &str)
                          -> Result<Vec<BatchMemberRecord>, StoreError>;

    /// Artifacts de un run en orden de creación.
    fn list_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactRecord>, StoreError>;

    fn list_transform_errors_for_token(&self, token_id: &str)
                                       -> Result<Vec<TransformErrorRecord>, StoreError>;

    /// Padres de un token ordenados por ordinal.
    fn list_token_parents(&self, token_id: &str)
                          -> Result<Vec<TokenParentRecord>, StoreError>;
}
