//! Tipos de resultado intercambiados entre plugins y runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::enums::RowOutcome;
use crate::tokens::TokenInfo;

/// Fila emitida por un source: válida (con record) o inválida (con razón).
/// Las inválidas también entran al audit trail: se admiten y se cuarentenan.
#[derive(Debug, Clone)]
pub enum SourceRow {
    Valid(Value),
    Invalid { reason: Value },
}

impl SourceRow {
    pub fn valid(data: Value) -> Self {
        SourceRow::Valid(data)
    }

    pub fn invalid(reason: Value) -> Self {
        SourceRow::Invalid { reason }
    }
}

/// Resultado de un transform.
///
/// `Error` es un error de datos de primera clase: se rutea según `on_error`,
/// no es un fallo del plugin. Los fallos externos (red, rate limit) se
/// devuelven como `Err(PluginCallError)` del propio `process`.
#[derive(Debug, Clone)]
pub enum TransformResult {
    Success {
        row: Value,
        context_after: Option<Value>,
    },
    /// Varias filas de salida. Exige `creates_tokens = true`; de lo
    /// contrario es una violación de contrato.
    SuccessMulti { rows: Vec<Value> },
    Error { reason: Value },
}

impl TransformResult {
    pub fn success(row: Value) -> Self {
        TransformResult::Success { row, context_after: None }
    }

    pub fn success_with_context(row: Value, context_after: Value) -> Self {
        TransformResult::Success { row, context_after: Some(context_after) }
    }

    pub fn success_multi(rows: Vec<Value>) -> Self {
        TransformResult::SuccessMulti { rows }
    }

    pub fn error(reason: Value) -> Self {
        TransformResult::Error { reason }
    }
}

/// Acción decidida por un gate.
#[derive(Debug, Clone)]
pub enum RoutingAction {
    Continue,
    Route {
        labels: Vec<String>,
        reason: Option<Value>,
    },
    ForkToPaths {
        branches: Vec<String>,
        reason: Option<Value>,
    },
}

impl RoutingAction {
    pub fn continue_() -> Self {
        RoutingAction::Continue
    }

    pub fn route(label: impl Into<String>, reason: Option<Value>) -> Self {
        RoutingAction::Route { labels: vec![label.into()], reason }
    }

    pub fn route_many(labels: Vec<String>, reason: Option<Value>) -> Self {
        RoutingAction::Route { labels, reason }
    }

    pub fn fork_to_paths(branches: Vec<String>, reason: Option<Value>) -> Self {
        RoutingAction::ForkToPaths { branches, reason }
    }

    /// Nombre estable de la variante, para auditoría y logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RoutingAction::Continue => "continue",
            RoutingAction::Route { .. } => "route",
            RoutingAction::ForkToPaths { .. } => "fork_to_paths",
        }
    }
}

/// Resultado de evaluar un gate plugin: la fila (posiblemente anotada) y la
/// acción de ruteo.
#[derive(Debug, Clone)]
pub struct GateResult {
    pub row: Value,
    pub action: RoutingAction,
}

/// Descriptor de un artifact producido por un sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub path_or_uri: String,
    pub size_bytes: u64,
    pub content_hash: String,
    pub artifact_type: String,
}

impl ArtifactDescriptor {
    /// Descriptor para un archivo local; normaliza a URI `file://`.
    pub fn for_file(path: &str, size_bytes: u64, content_hash: impl Into<String>) -> Self {
        let path_or_uri = if path.contains("://") {
            path.to_string()
        } else {
            format!("file://{path}")
        };
        Self { path_or_uri,
               size_bytes,
               content_hash: content_hash.into(),
               artifact_type: "file".to_string() }
    }

    pub fn for_uri(uri: impl Into<String>,
                   size_bytes: u64,
                   content_hash: impl Into<String>,
                   artifact_type: impl Into<String>)
                   -> Self {
        Self { path_or_uri: uri.into(),
               size_bytes,
               content_hash: content_hash.into(),
               artifact_type: artifact_type.into() }
    }
}

/// Fallo externo levantado por un plugin. `retryable` habilita al
/// RetryManager; un fallo no reintentable es un bug y tumba el run.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PluginCallError {
    pub message: String,
    pub details: Option<Value>,
    pub retryable: bool,
}

impl PluginCallError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), details: None, retryable: true }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { message: message.into(), details: None, retryable: false }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// JSON estable para `error_json` de node_states.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "message": self.message,
            "details": self.details,
            "retryable": self.retryable,
        })
    }
}

/// Resultado por token terminal que el procesador entrega al orquestador.
#[derive(Debug, Clone)]
pub struct RowResult {
    pub token: TokenInfo,
    pub outcome: RowOutcome,
    pub sink_name: Option<String>,
}

impl RowResult {
    pub fn new(token: TokenInfo, outcome: RowOutcome, sink_name: Option<String>) -> Self {
        Self { token, outcome, sink_name }
    }

    pub fn token_id(&self) -> &str {
        &self.token.token_id
    }

    pub fn row_id(&self) -> &str {
        &self.token.row_id
    }

    pub fn final_data(&self) -> &Value {
        &self.token.row_data
    }
}
