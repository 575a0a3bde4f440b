//! Traits de plugin: los cuatro contratos pluggables del runtime.
//!
//! Reglas clave:
//! - El `node_id` lo asigna el registro del grafo, no el plugin; el binding
//!   es explícito vía `bind_node_id`.
//! - Un transform que devuelve `TransformResult::Error` sin `on_error`
//!   configurado es un bug de plugin, no un dato en cuarentena.
//! - `process_batch` sólo aplica a transforms `is_batch_aware`; el default
//!   es una violación de contrato.

use serde_json::Value;

use super::context::PluginContext;
use super::results::{ArtifactDescriptor, GateResult, PluginCallError, SourceRow, TransformResult};
use super::schema::SchemaConfig;
use super::enums::Determinism;
use super::NodeId;

/// Destino configurado para errores de datos de un transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Cuarentena intencional: el error se registra y la fila no sigue.
    Discard,
    /// Ruteo por edge DIVERT hacia un sink nombrado.
    Sink(String),
}

impl ErrorDisposition {
    /// Forma persistida en `transform_errors.destination`.
    pub fn destination(&self) -> &str {
        match self {
            ErrorDisposition::Discard => "discard",
            ErrorDisposition::Sink(name) => name,
        }
    }
}

/// Etiqueta del edge DIVERT de errores para un intento dado. El orquestador
/// registra estos edges y el executor los resuelve con la misma función.
pub fn error_edge_label(attempt: u32) -> String {
    format!("on_error_{attempt}")
}

pub trait SourcePlugin {
    fn name(&self) -> &str;

    fn schema_config(&self) -> SchemaConfig {
        SchemaConfig::dynamic()
    }

    fn plugin_version(&self) -> &str {
        "1.0"
    }

    fn on_start(&mut self, _ctx: &PluginContext) -> Result<(), PluginCallError> {
        Ok(())
    }

    /// Carga acotada: todas las filas del source, válidas o inválidas.
    fn load(&mut self, ctx: &PluginContext) -> Result<Vec<SourceRow>, PluginCallError>;

    fn on_complete(&mut self, _ctx: &PluginContext) -> Result<(), PluginCallError> {
        Ok(())
    }

    fn close(&mut self) {}
}

pub trait TransformPlugin {
    fn name(&self) -> &str;

    /// Id del nodo al que este plugin quedó ligado en el run actual.
    fn node_id(&self) -> Option<&str>;

    /// Binding asignado por el registro del grafo.
    fn bind_node_id(&mut self, node_id: NodeId);

    fn schema_config(&self) -> SchemaConfig {
        SchemaConfig::dynamic()
    }

    fn plugin_version(&self) -> &str {
        "1.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn is_batch_aware(&self) -> bool {
        false
    }

    fn creates_tokens(&self) -> bool {
        false
    }

    fn on_error(&self) -> Option<ErrorDisposition> {
        None
    }

    fn process(&mut self, row: &Value, ctx: &PluginContext)
               -> Result<TransformResult, PluginCallError>;

    /// Procesamiento de un batch completo (modo agregación).
    fn process_batch(&mut self,
                     _rows: &[Value],
                     _ctx: &PluginContext)
                     -> Result<TransformResult, PluginCallError> {
        Err(PluginCallError::fatal(format!(
            "transform {} is not batch-aware but was driven as an aggregation",
            self.name()
        )))
    }
}

pub trait GatePlugin {
    fn name(&self) -> &str;

    fn node_id(&self) -> Option<&str>;

    fn bind_node_id(&mut self, node_id: NodeId);

    fn schema_config(&self) -> SchemaConfig {
        SchemaConfig::dynamic()
    }

    fn plugin_version(&self) -> &str {
        "1.0"
    }

    fn evaluate(&mut self, row: &Value, ctx: &PluginContext)
                -> Result<GateResult, PluginCallError>;
}

pub trait SinkPlugin {
    fn name(&self) -> &str;

    fn node_id(&self) -> Option<&str>;

    fn bind_node_id(&mut self, node_id: NodeId);

    fn schema_config(&self) -> SchemaConfig {
        SchemaConfig::dynamic()
    }

    fn plugin_version(&self) -> &str {
        "1.0"
    }

    /// Sinks idempotentes pueden reescribirse sin efecto duplicado; el
    /// runtime no garantiza exactly-once externo.
    fn idempotent(&self) -> bool {
        false
    }

    fn on_start(&mut self, _ctx: &PluginContext) -> Result<(), PluginCallError> {
        Ok(())
    }

    fn write(&mut self, rows: &[Value], ctx: &PluginContext)
             -> Result<ArtifactDescriptor, PluginCallError>;

    fn on_complete(&mut self, _ctx: &PluginContext) -> Result<(), PluginCallError> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// Un paso del pipeline: transform ordinario o gate plugin intercalado.
/// Los config gates (`GateSettings`) corren después del último paso.
pub enum PipelineStep {
    Transform(Box<dyn TransformPlugin>),
    Gate(Box<dyn GatePlugin>),
}

impl PipelineStep {
    pub fn name(&self) -> &str {
        match self {
            PipelineStep::Transform(t) => t.name(),
            PipelineStep::Gate(g) => g.name(),
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            PipelineStep::Transform(t) => t.node_id(),
            PipelineStep::Gate(g) => g.node_id(),
        }
    }
}
