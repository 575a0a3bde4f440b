//! Executors: adaptadores finos por tipo de nodo.
//!
//! Cada executor abre/cierra un node_state alrededor del trabajo y registra
//! los eventos de ruteo u outcomes que correspondan. No deciden política de
//! pipeline: eso es del RowProcessor.

mod aggregation;
mod gate;
mod sink;
mod transform;

pub use aggregation::{AggregationExecutor, BufferDecision, FlushResult};
pub use gate::{GateExecution, GateExecutor};
pub use sink::SinkExecutor;
pub use transform::{TransformExecution, TransformExecutor, TransformOutcome};
