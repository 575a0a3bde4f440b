//! Contratos neutrales entre el runtime y los plugins.
//!
//! El runtime no conoce implementaciones: sólo ve estos traits y tipos de
//! resultado. Las capacidades de cada plugin son declarativas
//! (`is_batch_aware`, `creates_tokens`, `on_error`), nunca descubiertas por
//! introspección en tiempo de ejecución.

mod config;
mod context;
mod enums;
mod plugin;
mod results;
mod schema;

pub use config::{
    AggregationMode, AggregationSettings, CheckpointSettings, CoalescePolicy, CoalesceSettings,
    GateSettings, MergeStrategy, RetrySettings, TriggerConfig,
};
pub use context::PluginContext;
pub use enums::{
    BatchStatus, Determinism, NodeKind, NodeStateStatus, RoutingMode, RowOutcome, RunStatus,
};
pub use plugin::{
    error_edge_label, ErrorDisposition, GatePlugin, PipelineStep, SinkPlugin, SourcePlugin,
    TransformPlugin,
};
pub use results::{
    ArtifactDescriptor, GateResult, PluginCallError, RoutingAction, RowResult, SourceRow,
    TransformResult,
};
pub use schema::{SchemaConfig, SchemaFields};

/// Identificadores opacos (texto). Se generan como UUID v4 pero el runtime
/// sólo los compara; el backend decide el tipo de columna.
pub type NodeId = String;
pub type EdgeId = String;
pub type RunId = String;
pub type RowId = String;
pub type TokenId = String;
pub type StateId = String;
pub type BatchId = String;
pub type BranchName = String;
pub type CoalesceName = String;
