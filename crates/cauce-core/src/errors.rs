//! Errores semánticos del runtime.
//!
//! La taxonomía sigue los cinco niveles de confianza del motor:
//! - configuración (el run nunca arranca),
//! - errores de datos declarados por plugins (ruteados, no son fallos),
//! - errores externos transitorios (reintentables),
//! - bugs de plugin (propagan y tumban el run),
//! - violaciones de invariante (fatales, no se maquillan).

use thiserror::Error;

/// Error del almacén de auditoría. Los backends (memoria, Postgres) mapean
/// sus fallos nativos a estas variantes semánticas.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("transient IO: {0}")]
    TransientIo(String),
    #[error("backend: {0}")]
    Backend(String),
}

/// Error del evaluador de expresiones de config gates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("unknown row field: {0}")]
    UnknownField(String),
    #[error("type error: {0}")]
    Type(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Error de configuración detectado en la construcción del grafo.
    #[error("route validation failed: {0}")]
    RouteValidation(String),

    /// Un nodo resolvió una etiqueta sin edge registrado. Fatal: el audit
    /// trail quedaría incompleto.
    #[error("no edge registered for ({node_id}, {label}). Audit trail would be incomplete")]
    MissingEdge { node_id: String, label: String },

    /// El evaluador de un config gate produjo una etiqueta fuera de `routes`.
    #[error("gate {gate} resolved label {label:?} not present in routes")]
    MissingRoute { gate: String, label: String },

    /// Un plugin violó su contrato declarado (p.ej. SuccessMulti sin
    /// `creates_tokens`, o un Error sin `on_error`).
    #[error("plugin contract violation: {0}")]
    ContractViolation(String),

    /// Invariante del runtime roto (doble outcome terminal, tope de la work
    /// queue, versión de checkpoint desconocida). El run falla.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Fallo externo levantado por un plugin (no un error de datos). Si
    /// `retryable` el RetryManager puede reintentarlo.
    #[error("plugin {node_id} failed: {message}")]
    PluginFailure {
        node_id: String,
        message: String,
        retryable: bool,
    },

    /// Reintentos agotados. El procesador lo mapea a outcome FAILED.
    #[error("max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },

    #[error("config gate expression failed: {0}")]
    Expression(#[from] ExprError),

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Señala si el error admite reintento con backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::PluginFailure { retryable, .. } => *retryable,
            EngineError::Store(StoreError::TransientIo(_)) => true,
            _ => false,
        }
    }
}

/// Clasificación gruesa para logging y para la capa de persistencia.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Config,
    Contract,
    Invariant,
    Transient,
    Permanent,
}

/// Clasifica un `EngineError` para etiquetado estable en logs y tablas.
pub fn classify_error(err: &EngineError) -> ErrorClass {
    match err {
        EngineError::RouteValidation(_) => ErrorClass::Config,
        EngineError::Expression(_) => ErrorClass::Config,
        EngineError::ContractViolation(_) => ErrorClass::Contract,
        EngineError::MissingEdge { .. } | EngineError::MissingRoute { .. } => ErrorClass::Invariant,
        EngineError::InvariantViolation(_) => ErrorClass::Invariant,
        EngineError::PluginFailure { retryable: true, .. } => ErrorClass::Transient,
        EngineError::Store(StoreError::TransientIo(_)) => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}
