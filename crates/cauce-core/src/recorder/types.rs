//! Registros del ledger de auditoría (una struct por tabla).
//!
//! Todas las structs son serializables: la capa de persistencia las mapea a
//! filas relacionales y los tests las inspeccionan como JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contracts::{
    BatchStatus, NodeKind, NodeStateStatus, RoutingMode, RowOutcome, RunStatus,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub status: RunStatus,
    pub config_json: Value,
    pub config_hash: String,
    pub canonical_version: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub run_id: String,
    pub plugin_name: String,
    pub node_kind: NodeKind,
    pub plugin_version: String,
    pub config_json: Value,
    pub schema_json: Value,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub edge_id: String,
    pub run_id: String,
    pub from_node_id: String,
    pub to_node_id: String,
    pub label: String,
    pub mode: RoutingMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowRecord {
    pub row_id: String,
    pub run_id: String,
    pub source_node_id: String,
    pub row_index: usize,
    pub data: Value,
    pub data_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_id: String,
    pub row_id: String,
    pub branch_name: Option<String>,
    pub fork_group_id: Option<String>,
    pub join_group_id: Option<String>,
    pub expand_group_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenParentRecord {
    pub token_id: String,
    pub parent_token_id: String,
    pub ordinal: usize,
}

/// El único estado terminal de un token. La inserción es condicional: un
/// segundo intento para el mismo token_id es una violación de unicidad.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenOutcomeRecord {
    pub token_id: String,
    pub outcome: RowOutcome,
    pub sink_name: Option<String>,
    pub error_hash: Option<String>,
    pub fork_group_id: Option<String>,
    pub join_group_id: Option<String>,
    pub expand_group_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl TokenOutcomeRecord {
    /// Todo outcome persistido es terminal por definición.
    pub fn is_terminal(&self) -> bool {
        true
    }
}

/// Un intento de un token en un nodo: par abrir/cerrar alrededor del trabajo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStateRecord {
    pub state_id: String,
    pub token_id: String,
    pub node_id: String,
    pub step_index: usize,
    pub attempt: u32,
    pub status: NodeStateStatus,
    pub input_hash: String,
    pub output_hash: Option<String>,
    pub duration_ms: Option<u64>,
    pub error_json: Option<Value>,
    pub context_after_json: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingEventRecord {
    pub event_id: String,
    pub state_id: String,
    pub edge_id: String,
    pub mode: RoutingMode,
    pub reason_hash: Option<String>,
    pub routing_group_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: String,
    pub run_id: String,
    pub node_id: String,
    pub status: BatchStatus,
    pub trigger_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMemberRecord {
    pub batch_id: String,
    pub token_id: String,
    pub ordinal: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub artifact_id: String,
    pub run_id: String,
    pub sink_node_id: String,
    pub produced_by_state_id: String,
    pub path_or_uri: String,
    pub size_bytes: u64,
    pub content_hash: String,
    pub artifact_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformErrorRecord {
    pub error_id: String,
    pub run_id: String,
    pub node_id: String,
    pub token_id: String,
    pub row_id: String,
    pub destination: String,
    pub error_details: Value,
    pub error_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Traza materializada de un token: el producto final del sistema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lineage {
    pub run_id: String,
    pub row: RowRecord,
    pub token: TokenRecord,
    pub node_states: Vec<NodeStateRecord>,
    pub routing_events: Vec<RoutingEventRecord>,
    pub parents: Vec<TokenRecord>,
    pub outcome: Option<TokenOutcomeRecord>,
    pub transform_errors: Vec<TransformErrorRecord>,
    pub artifacts: Vec<ArtifactRecord>,
}
