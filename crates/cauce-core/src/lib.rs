//! cauce-core: runtime de pipelines con trail de auditoría como producto.
//!
//! Propósito:
//! - Ejecutar pipelines de procesamiento de filas (transforms, gates,
//!   agregaciones, coalesce, sinks) sobre un DAG tipado.
//! - Dejar, para CADA fila observada o ausente, una respuesta consultable a
//!   "¿qué le pasó a esta fila, en qué nodo, con qué inputs, en qué intento
//!   y por qué?". El trail es el producto primario; el output transformado
//!   es secundario.
//!
//! Componentes principales:
//! - `recorder`: la única vía de escritura al ledger (trait `AuditStore` +
//!   backend en memoria; Postgres en `cauce-persistence`).
//! - `dag`: grafo de ejecución inmutable con validación fail-fast de rutas.
//! - `tokens`: identidades trazables y su genealogía (fork/coalesce/expand).
//! - `executors`: adaptadores por tipo de nodo (transform, gate,
//!   agregación, sink) y `coalesce`.
//! - `processor`: la máquina de estados por fila (work queue FIFO acotada).
//! - `retry`: backoff exponencial con jitter sobre fallos clasificados.
//! - `orchestrator`: ciclo de vida del run, fases y eventos.
//! - `checkpoint`: estado durable de agregaciones para reanudación.
//! - `hashing`: JSON canónico + blake3 (los hashes anclan el audit trail).
//! - `workers`: pool con salida FIFO para transforms que paralelizan.
//!
//! Re-exports: se exponen los símbolos de uso frecuente para binarios/tests.

pub mod checkpoint;
pub mod clock;
pub mod coalesce;
pub mod constants;
pub mod contracts;
pub mod dag;
pub mod errors;
pub mod events;
pub mod executors;
pub mod expr;
pub mod hashing;
pub mod orchestrator;
pub mod processor;
pub mod recorder;
pub mod retry;
pub mod spans;
pub mod tokens;
pub mod workers;

// Re-exports públicos principales
pub use checkpoint::CheckpointManager;
pub use clock::{Clock, MockClock, SystemClock};
pub use coalesce::{CoalesceExecutor, CoalesceOutcome};
pub use contracts::{
    AggregationMode, AggregationSettings, ArtifactDescriptor, BatchStatus, CheckpointSettings,
    CoalescePolicy, CoalesceSettings, Determinism, ErrorDisposition, GatePlugin, GateResult,
    GateSettings, MergeStrategy, NodeKind, NodeStateStatus, PipelineStep, PluginCallError,
    PluginContext, RetrySettings, RoutingAction, RoutingMode, RowOutcome, RowResult, RunStatus,
    SchemaConfig, SinkPlugin, SourcePlugin, SourceRow, TransformPlugin, TransformResult,
    TriggerConfig,
};
pub use dag::{ExecutionGraph, GraphBuilder};
pub use errors::{classify_error, EngineError, ErrorClass, ExprError, StoreError};
pub use events::{EventBus, PhaseError, PipelineEvent, PipelinePhase};
pub use executors::{
    AggregationExecutor, GateExecutor, SinkExecutor, TransformExecutor, TransformOutcome,
};
pub use orchestrator::{CancelToken, Orchestrator, PipelineConfig, RunSummary};
pub use processor::RowProcessor;
pub use recorder::{
    AuditStore, Lineage, MemoryPayloadStore, MemoryStore, OutcomeDetail, PayloadStore, Recorder,
};
pub use retry::RetryManager;
pub use spans::{Span, SpanExporter, SpanFactory};
pub use tokens::{TokenInfo, TokenManager};
pub use workers::RowPipeline;
